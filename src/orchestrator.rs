//! Backup orchestration
//!
//! Turns a "create backup" request into a script run and reports its state.
//! Repeated requests for the same backup name query the existing run.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{error, info};

use crate::crd::S3Spec;
use crate::error::Result;
use crate::script::{Progress, RunState, ScriptParams, ScriptRunner};

/// Credentials resolved from a secret at reconcile time
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub encryption_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Fully resolved remote storage descriptor handed to a script
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataSource {
    pub path: String,
    pub endpoint: String,
    pub verify_tls: bool,
    pub http_proxy: String,
    pub https_proxy: String,
    pub credentials: Credentials,
    /// Only meaningful for restores
    pub synchronous: bool,
}

impl DataSource {
    pub fn s3(spec: &S3Spec, credentials: Credentials, synchronous: bool) -> Self {
        Self {
            path: spec.path.clone(),
            endpoint: spec.endpoint.clone(),
            verify_tls: spec.verify_tls,
            http_proxy: spec.http_proxy.clone(),
            https_proxy: spec.https_proxy.clone(),
            credentials,
            synchronous,
        }
    }

    /// Environment passed to backup and restore scripts
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("S3_PATH".to_string(), self.path.clone());
        env.insert("S3_ENDPOINT".to_string(), self.endpoint.clone());
        env.insert("S3_VERIFY_TLS".to_string(), self.verify_tls.to_string());
        env.insert("HTTP_PROXY".to_string(), self.http_proxy.clone());
        env.insert("HTTPS_PROXY".to_string(), self.https_proxy.clone());
        env.insert("AWS_ACCESS_KEY_ID".to_string(), self.credentials.access_key_id.clone());
        env.insert(
            "AWS_SECRET_ACCESS_KEY".to_string(),
            self.credentials.secret_access_key.clone(),
        );
        env.insert("AWS_SESSION_TOKEN".to_string(), self.credentials.session_token.clone());
        if let Some(key) = &self.credentials.encryption_key {
            env.insert("ENCRYPTION_KEY".to_string(), key.clone());
        }
        env
    }
}

/// Restore seeding request attached to a volume creation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Progress-store key, see [`crate::crd::restore_operation_id`]
    pub id: String,
    pub source: DataSource,
}

/// Result of one orchestration call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupState {
    pub name: String,
    pub state: RunState,
    pub message: String,
}

impl BackupState {
    fn from_progress(name: &str, progress: Progress) -> Self {
        let (state, message) = match progress {
            Progress::NotStarted | Progress::Running => (RunState::InProgress, String::new()),
            Progress::Complete => (RunState::Complete, String::new()),
            Progress::Failed(message) => (RunState::Error, message),
        };
        Self {
            name: name.to_string(),
            state,
            message,
        }
    }
}

/// Operations the reconcilers need from the node's volume service
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Start or query the backup run for `name`
    async fn create_backup(
        &self,
        name: &str,
        volume_handle: &str,
        source: &DataSource,
    ) -> BackupState;

    /// Progress of a restore run on this node
    async fn restore_progress(&self, id: &str) -> Result<Progress>;
}

/// Drives the backup script
#[derive(Clone, Debug)]
pub struct BackupOrchestrator {
    runner: ScriptRunner,
}

impl BackupOrchestrator {
    pub fn new(runner: ScriptRunner) -> Self {
        Self { runner }
    }

    pub async fn create_backup(
        &self,
        name: &str,
        volume_handle: &str,
        source: &DataSource,
    ) -> BackupState {
        info!(name = %name, volume = %volume_handle, "Backup creation requested");

        let params = ScriptParams::new(vec![volume_handle.to_string()], source.to_env());
        match self.runner.start(name, params).await {
            Ok(progress) => BackupState::from_progress(name, progress),
            Err(e) => {
                error!(name = %name, error = %e, "Backup creation failed");
                BackupState {
                    name: name.to_string(),
                    state: RunState::Error,
                    message: e.to_string(),
                }
            }
        }
    }
}
