//! File-backed progress store
//!
//! Each run owns `<root>/<id>/`. Creating that directory is the claim on the
//! identifier; `status.json` inside it holds the [`ProgressRecord`] and
//! `output.log` collects the script's stdout and stderr.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunState;
use crate::error::{Error, Result};

const RECORD_FILE: &str = "status.json";
const LOG_FILE: &str = "output.log";
const MAX_MESSAGE_LEN: usize = 512;

lazy_static::lazy_static! {
    /// Identity of this operator process. Process ids repeat across container
    /// restarts, so the start time is part of it.
    static ref INSTANCE_ID: String = format!(
        "{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
}

/// Token written into the records this process supervises
pub fn instance_id() -> &'static str {
    INSTANCE_ID.as_str()
}

/// Persisted state of one script run
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub state: RunState,
    #[serde(default)]
    pub message: String,
    /// Script process id
    #[serde(default)]
    pub pid: Option<u32>,
    /// Operator instance supervising the script, see [`instance_id`]
    #[serde(default)]
    pub supervisor: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ProgressRecord {
    pub fn running(pid: Option<u32>) -> Self {
        Self {
            state: RunState::InProgress,
            message: String::new(),
            pid,
            supervisor: instance_id().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
        }
    }

    pub fn finish(
        mut self,
        state: RunState,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        self.state = state;
        self.message = message.into();
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Still marked running, but neither the supervising operator instance
    /// nor the script process exists any more.
    pub fn is_orphaned(&self) -> bool {
        self.state == RunState::InProgress
            && self.supervisor != instance_id()
            && !self.pid.map(process_alive).unwrap_or(false)
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Identifier-keyed run directories under a work directory
#[derive(Clone, Debug)]
pub struct ProgressStore {
    root: PathBuf,
}

impl ProgressStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    pub fn log_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.run_dir(id)?.join(LOG_FILE))
    }

    /// Claim `id` for a new run. Returns false when a run already exists.
    pub async fn claim(&self, id: &str) -> Result<bool> {
        let dir = self.run_dir(id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::store(format!("cannot create {}: {}", self.root.display(), e)))?;
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::store(format!("cannot create {}: {}", dir.display(), e))),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        let dir = self.run_dir(id)?;
        tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| Error::store(format!("cannot stat {}: {}", dir.display(), e)))
    }

    /// When `id` was claimed, taken from its run directory
    pub async fn claimed_at(&self, id: &str) -> Result<SystemTime> {
        let dir = self.run_dir(id)?;
        tokio::fs::metadata(&dir)
            .await
            .and_then(|meta| meta.modified())
            .map_err(|e| Error::store(format!("cannot stat {}: {}", dir.display(), e)))
    }

    pub async fn load(&self, id: &str) -> Result<Option<ProgressRecord>> {
        let path = self.run_dir(id)?.join(RECORD_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::store(format!("cannot read {}: {}", path.display(), e))),
        }
    }

    /// Replace the record atomically
    pub async fn save(&self, id: &str, record: &ProgressRecord) -> Result<()> {
        let dir = self.run_dir(id)?;
        let tmp = dir.join(format!("{}.tmp", RECORD_FILE));
        let raw = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| Error::store(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, dir.join(RECORD_FILE))
            .await
            .map_err(|e| Error::store(format!("cannot replace record in {}: {}", dir.display(), e)))
    }

    /// Last non-empty line the script printed, shortened for status messages
    pub async fn last_output_line(&self, id: &str) -> Option<String> {
        let raw = tokio::fs::read(self.log_path(id).ok()?).await.ok()?;
        let text = String::from_utf8_lossy(&raw);
        let line = text.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
        Some(line.chars().take(MAX_MESSAGE_LEN).collect())
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.starts_with('.') || id.contains('/') || id.contains('\\') {
        return Err(Error::validation(format!("invalid run identifier '{}'", id)));
    }
    Ok(())
}
