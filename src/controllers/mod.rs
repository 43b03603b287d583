//! Kubernetes controllers for Backup and Restore resources
//!
//! This module contains the controller implementations that watch for
//! resource changes, trigger reconciliation and apply its decisions.

mod backup_controller;
pub mod events;
mod restore_controller;

pub use backup_controller::run as run_backup_controller;
pub use restore_controller::run as run_restore_controller;

use std::fmt::Debug;
use std::sync::Arc;

use kube::{
    api::{Patch, PatchParams},
    runtime::{controller, controller::Action, reflector::ObjectRef},
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::metrics;
use crate::orchestrator::BackupService;
use crate::reconcilers::Decision;

/// Field manager used for status writes
const FIELD_MANAGER: &str = "lvm-backup-operator";

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Node identity and timing
    pub settings: Settings,
    /// Node-local volume service
    pub service: Arc<dyn BackupService>,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, settings: Settings, service: Arc<dyn BackupService>) -> Self {
        Self {
            client,
            settings,
            service,
        }
    }
}

/// Write the decided status, if any, and translate the decision to an action
async fn apply_decision<K>(api: &Api<K>, name: &str, decision: Decision) -> Result<Action>
where
    K: Clone + DeserializeOwned + Debug,
{
    if let Decision::Persist { status, .. } = &decision {
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
    }

    Ok(match decision.requeue_after() {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

/// Log one controller outcome. Deletions drop the object from the store
/// before its event is processed; those are not reconciliation errors.
fn report_outcome<K, QueueErr>(
    kind: &str,
    result: std::result::Result<(ObjectRef<K>, Action), controller::Error<Error, QueueErr>>,
) where
    K: Resource,
    QueueErr: std::error::Error + 'static,
{
    match result {
        Ok((obj, _action)) => {
            info!(
                name = %obj.name,
                namespace = obj.namespace.as_deref().unwrap_or("default"),
                "Reconciled {}", kind
            );
        }
        Err(controller::Error::ObjectNotFound(obj)) => {
            debug!(object = %obj, "{} is gone, nothing to reconcile", kind);
        }
        Err(e) => {
            error!(error = %e, "Reconciliation error");
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[kind])
                .inc();
        }
    }
}
