//! Detached execution of backup and restore scripts
//!
//! A run is addressed by an identifier. [`ScriptRunner::start`] launches the
//! script at most once per identifier; [`ScriptRunner::query`] reports how the
//! run is doing. Both go through the [`ProgressStore`], so progress survives
//! operator restarts.

mod store;

pub use store::*;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::ScriptConf;
use crate::error::{Error, Result};
use crate::metrics;

/// Tri-state outcome of a script run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RunState {
    InProgress,
    Error,
    Complete,
}

/// What the store knows about an identifier
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    NotStarted,
    Running,
    Complete,
    Failed(String),
}

/// Arguments and environment handed to the script
#[derive(Clone, Debug, Default)]
pub struct ScriptParams {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ScriptParams {
    pub fn new(args: Vec<String>, env: BTreeMap<String, String>) -> Self {
        Self { args, env }
    }
}

/// Launches one script and tracks its runs under a work directory
#[derive(Clone, Debug)]
pub struct ScriptRunner {
    kind: &'static str,
    script: PathBuf,
    store: ProgressStore,
    poll_interval: Duration,
    claim_grace: Duration,
}

/// How long a claimed run may go without a record before it counts as abandoned
const DEFAULT_CLAIM_GRACE: Duration = Duration::from_secs(60);

impl ScriptRunner {
    /// `kind` labels logs and metrics ("backup" or "restore")
    pub fn new(kind: &'static str, conf: &ScriptConf) -> Self {
        Self {
            kind,
            script: conf.script_path.clone(),
            store: ProgressStore::new(&conf.workdir),
            poll_interval: Duration::from_secs(1),
            claim_grace: DEFAULT_CLAIM_GRACE,
        }
    }

    /// How often [`ScriptRunner::run_to_completion`] re-reads the store
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long a claim may stay without a record before the run is abandoned
    pub fn with_claim_grace(mut self, claim_grace: Duration) -> Self {
        self.claim_grace = claim_grace;
        self
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Launch the script for `id` unless a run already exists, then report
    /// its progress. An existing run is never restarted.
    pub async fn start(&self, id: &str, params: ScriptParams) -> Result<Progress> {
        if !self.store.claim(id).await? {
            debug!(kind = self.kind, id = %id, "run already exists, querying progress");
            return self.query(id).await;
        }

        let run_dir = self.store.run_dir(id)?;
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.store.log_path(id)?)
            .await
            .map_err(|e| {
                Error::store(format!(
                    "cannot open output log in {}: {}",
                    run_dir.display(),
                    e
                ))
            })?
            .into_std()
            .await;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&self.script);
        command
            .args(&params.args)
            .envs(&params.env)
            .env("WORKDIR", &run_dir)
            .env("OPERATION_ID", id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", self.script.display(), e);
                error!(kind = self.kind, id = %id, error = %message, "Script launch failed");
                let record =
                    ProgressRecord::running(None).finish(RunState::Error, message.clone(), None);
                self.store.save(id, &record).await?;
                return Err(Error::ScriptLaunch(message));
            }
        };

        let record = ProgressRecord::running(child.id());
        self.store.save(id, &record).await?;
        metrics::SCRIPT_RUNS_STARTED.with_label_values(&[self.kind]).inc();
        info!(kind = self.kind, id = %id, pid = ?record.pid, "Script launched");

        let store = self.store.clone();
        let kind = self.kind;
        let id_owned = id.to_string();
        tokio::spawn(async move {
            let finished = match child.wait().await {
                Ok(status) if status.success() => {
                    record.finish(RunState::Complete, "", status.code())
                }
                Ok(status) => {
                    let message = store
                        .last_output_line(&id_owned)
                        .await
                        .unwrap_or_else(|| format!("script exited with {}", status));
                    record.finish(RunState::Error, message, status.code())
                }
                Err(e) => record.finish(
                    RunState::Error,
                    format!("failed to wait for script: {}", e),
                    None,
                ),
            };
            info!(
                kind,
                id = %id_owned,
                state = ?finished.state,
                exit_code = ?finished.exit_code,
                "Script finished"
            );
            if let Err(e) = store.save(&id_owned, &finished).await {
                error!(kind, id = %id_owned, error = %e, "Failed to record script result");
            }
        });

        Ok(Progress::Running)
    }

    /// Report the progress of `id` without side effects
    pub async fn query(&self, id: &str) -> Result<Progress> {
        if !self.store.exists(id).await? {
            return Ok(Progress::NotStarted);
        }
        let Some(record) = self.store.load(id).await? else {
            return self.unrecorded(id).await;
        };
        Ok(match record.state {
            RunState::InProgress if record.is_orphaned() => {
                warn!(
                    kind = self.kind,
                    id = %id,
                    supervisor = %record.supervisor,
                    "Script run was orphaned"
                );
                Progress::Failed(format!(
                    "script run was orphaned: supervising operator {} is gone",
                    record.supervisor
                ))
            }
            RunState::InProgress => Progress::Running,
            RunState::Complete => Progress::Complete,
            RunState::Error => Progress::Failed(record.message),
        })
    }

    /// A claimed run without a record is still being launched, unless the
    /// claim is older than the grace period.
    async fn unrecorded(&self, id: &str) -> Result<Progress> {
        let claimed_at = self.store.claimed_at(id).await?;
        let age = SystemTime::now()
            .duration_since(claimed_at)
            .unwrap_or_default();
        if age < self.claim_grace {
            return Ok(Progress::Running);
        }
        warn!(
            kind = self.kind,
            id = %id,
            age = ?age,
            "Script run was claimed but never recorded"
        );
        Ok(Progress::Failed(format!(
            "script run was abandoned before it was recorded ({}s ago)",
            age.as_secs()
        )))
    }

    /// Start the run if needed and wait until it stops running
    pub async fn run_to_completion(&self, id: &str, params: ScriptParams) -> Result<Progress> {
        let mut progress = self.start(id, params).await?;
        while progress == Progress::Running {
            tokio::time::sleep(self.poll_interval).await;
            progress = self.query(id).await?;
        }
        Ok(progress)
    }
}
