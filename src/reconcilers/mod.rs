//! Reconcilers for Backup and Restore resources
//!
//! This module contains the decision logic for each resource type.
//! Reconcilers are responsible for:
//! - Re-reading the resource and skipping terminal ones
//! - Resolving and validating referenced objects
//! - Deciding on the next status and when to look again
//!
//! They never write to the API server; controllers apply the [`Decision`].

pub mod backup;
pub mod restore;

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::Settings;
use crate::crd::{OperationState, OperationStatus};
use crate::error::{Error, Result};

/// Outcome of one reconciliation
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Leave the status alone and wait for the next event
    Skip,
    /// Leave the status alone and look again after the delay
    Recheck(Duration),
    /// Write the status, then look again if a delay is given
    Persist {
        status: OperationStatus,
        requeue: Option<Duration>,
    },
}

impl Decision {
    /// Persist `status` unless it is already the current one
    pub fn persist(
        current: Option<&OperationStatus>,
        status: OperationStatus,
        requeue: Option<Duration>,
    ) -> Self {
        if current == Some(&status) {
            return match requeue {
                Some(delay) => Decision::Recheck(delay),
                None => Decision::Skip,
            };
        }
        Decision::Persist { status, requeue }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Decision::Skip => None,
            Decision::Recheck(delay) => Some(*delay),
            Decision::Persist { requeue, .. } => *requeue,
        }
    }
}

/// Status messages name the reporting node, since every node sees every resource
pub fn node_message(node_name: &str, text: impl std::fmt::Display) -> String {
    format!("{}: {}", node_name, text)
}

/// Run a remote call under the configured deadline
pub(crate) async fn with_deadline<T, F>(settings: &Settings, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(settings.remote_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            seconds: settings.remote_timeout.as_secs(),
        }),
    }
}

/// Transient failures go back to the controller for a retry; everything
/// else becomes a terminal Error status.
pub(crate) fn fail(
    settings: &Settings,
    current: Option<&OperationStatus>,
    error: Error,
) -> Result<Decision> {
    if error.is_transient() {
        return Err(error);
    }
    warn!(error = %error, "Reconciliation failed permanently");
    Ok(Decision::persist(
        current,
        OperationStatus::new(OperationState::Error, node_message(&settings.node_name, &error)),
        None,
    ))
}
