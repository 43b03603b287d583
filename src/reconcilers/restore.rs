//! Restore reconciler
//!
//! Restores run on the node that provisions the volume, started by
//! [`crate::lvm::LvService::create_volume`]. Each node reports the progress of
//! the runs it holds locally; a node without a local run is not in charge.

use tracing::{debug, error, info, instrument};

use super::{fail, node_message, with_deadline, Decision};
use crate::adapters::{credentials_from_secret, ClusterLookups};
use crate::config::Settings;
use crate::crd::{OperationState, OperationStatus, Restore, STORAGE_TYPE_S3};
use crate::error::{Error, Result};
use crate::metrics;
use crate::orchestrator::{BackupService, Credentials, DataSource, RestoreRequest};
use crate::script::Progress;

/// Validate the Restore spec
pub fn validate(restore: &Restore) -> Result<()> {
    if restore.spec.backup_storage_type != STORAGE_TYPE_S3 {
        return Err(Error::validation(format!(
            "Invalid storage type '{}': must be {}",
            restore.spec.backup_storage_type, STORAGE_TYPE_S3
        )));
    }
    if restore.spec.s3.path.is_empty() {
        return Err(Error::validation("S3 path must be specified"));
    }
    Ok(())
}

/// Build the seeding request for a volume provisioned from `restore`
pub async fn resolve_data_source(
    restore: &Restore,
    cluster: &dyn ClusterLookups,
    settings: &Settings,
) -> Result<RestoreRequest> {
    validate(restore)?;

    let namespace = restore.metadata.namespace.as_deref().unwrap_or("default");
    let credentials = if restore.spec.s3.secret.is_empty() {
        Credentials::default()
    } else {
        let secret = with_deadline(
            settings,
            "fetch Secret",
            cluster.secret(namespace, &restore.spec.s3.secret),
        )
        .await?;
        credentials_from_secret(&secret)?
    };

    Ok(RestoreRequest {
        id: restore.operation_id(),
        source: DataSource::s3(&restore.spec.s3, credentials, restore.spec.synchronous_restore),
    })
}

/// Reconcile one Restore on this node
#[instrument(skip(cluster, service, settings), fields(node = %settings.node_name))]
pub async fn reconcile(
    namespace: &str,
    name: &str,
    cluster: &dyn ClusterLookups,
    service: &dyn BackupService,
    settings: &Settings,
) -> Result<Decision> {
    let Some(restore) =
        with_deadline(settings, "fetch Restore", cluster.restore(namespace, name)).await?
    else {
        debug!("Restore no longer exists");
        return Ok(Decision::Skip);
    };

    if restore.state().is_terminal() {
        return Ok(Decision::Skip);
    }
    let current = restore.status.as_ref();

    let id = restore.operation_id();
    let query = service.restore_progress(&id);
    let progress = match with_deadline(settings, "query restore progress", query).await {
        Ok(progress) => progress,
        Err(e) => return fail(settings, current, e),
    };

    let node = &settings.node_name;
    Ok(match progress {
        Progress::NotStarted => {
            debug!(id = %id, "No local restore run, not in charge");
            Decision::Recheck(settings.requeue_interval)
        }
        Progress::Running => Decision::persist(
            current,
            OperationStatus::new(
                OperationState::InProgress,
                node_message(node, "restore in progress"),
            ),
            Some(settings.requeue_interval),
        ),
        Progress::Complete => {
            info!(id = %id, "Restore completed");
            metrics::RESTORES_TOTAL.with_label_values(&["success", namespace]).inc();
            Decision::persist(
                current,
                OperationStatus::new(
                    OperationState::Complete,
                    node_message(node, "restore complete"),
                ),
                None,
            )
        }
        Progress::Failed(message) => {
            error!(id = %id, message = %message, "Restore failed");
            metrics::RESTORES_TOTAL.with_label_values(&["failure", namespace]).inc();
            Decision::persist(
                current,
                OperationStatus::new(OperationState::Error, node_message(node, message)),
                None,
            )
        }
    })
}
