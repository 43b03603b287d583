//! Custom Resource Definitions for the LVM Backup Operator

mod backup;
mod restore;

pub use backup::*;
pub use restore::*;

use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Storage backend type understood by the backup/restore scripts
pub const STORAGE_TYPE_S3: &str = "s3";

/// Lifecycle state shared by Backup and Restore resources
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum OperationState {
    #[default]
    Pending,
    InProgress,
    Error,
    Complete,
}

impl OperationState {
    /// Error and Complete are never left once reached
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Error | OperationState::Complete)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::Pending => write!(f, "Pending"),
            OperationState::InProgress => write!(f, "InProgress"),
            OperationState::Error => write!(f, "Error"),
            OperationState::Complete => write!(f, "Complete"),
        }
    }
}

/// Observed state of a Backup or Restore
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// Current state (Pending, InProgress, Error, Complete)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OperationState>,

    /// Human-readable message, prefixed with the reporting node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl OperationStatus {
    pub fn new(state: OperationState, message: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            message: message.into(),
        }
    }
}

/// State of an optional status block; a missing status is Pending
pub fn current_state(status: Option<&OperationStatus>) -> OperationState {
    status.and_then(|s| s.state).unwrap_or_default()
}

/// S3 bucket access shared by Backup and Restore
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Spec {
    /// Bucket path the volume content is written to or read from
    pub path: String,

    /// Name of the secret holding the credentials, in the resource namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,

    /// Custom endpoint (for MinIO, Ceph, etc.)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    /// Verify the endpoint's TLS certificate
    #[serde(default, rename = "verifyTLS")]
    pub verify_tls: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_proxy: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub https_proxy: String,
}

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&Backup::crd())?,
        serde_yaml::to_string(&Restore::crd())?,
    ])
}
