//! Backup reconciler
//!
//! Handles the business logic for backups including:
//! - Claim → volume resolution
//! - Driver, volume mode and node ownership checks
//! - Credential resolution
//! - Mapping the orchestrator's state onto the Backup status

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use tracing::{debug, error, info, instrument};

use super::{fail, node_message, with_deadline, Decision};
use crate::adapters::{credentials_from_secret, ClusterLookups};
use crate::config::Settings;
use crate::crd::{backup_operation_id, Backup, OperationState, OperationStatus, STORAGE_TYPE_S3};
use crate::error::{Error, Result};
use crate::metrics;
use crate::orchestrator::{BackupService, BackupState, Credentials, DataSource};
use crate::script::RunState;

/// Source kind a Backup can reference
pub const SUPPORTED_SOURCE_KIND: &str = "pvc";

/// Volume mode a backup can be taken of
const FILESYSTEM_MODE: &str = "Filesystem";

/// Validate the Backup spec
pub fn validate(backup: &Backup) -> Result<()> {
    if backup.spec.backup_storage_type != STORAGE_TYPE_S3 {
        return Err(Error::validation(format!(
            "Invalid storage type '{}': must be {}",
            backup.spec.backup_storage_type, STORAGE_TYPE_S3
        )));
    }
    if backup.spec.s3.path.is_empty() {
        return Err(Error::validation("S3 path must be specified"));
    }
    if backup.spec.name.is_empty() {
        return Err(Error::validation("Source name must be specified"));
    }
    Ok(())
}

/// Name of the volume a claim is bound to
pub fn bound_volume_name(pvc: &PersistentVolumeClaim) -> Result<String> {
    pvc.spec
        .as_ref()
        .and_then(|spec| spec.volume_name.clone())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::validation(format!(
                "claim {} is not bound to a volume",
                pvc.metadata.name.as_deref().unwrap_or_default()
            ))
        })
}

/// Check that a volume belongs to `driver` and is in filesystem mode.
/// Returns the CSI volume handle.
pub fn validate_volume(pv: &PersistentVolume, driver: &str) -> Result<String> {
    let spec = pv.spec.as_ref();
    let csi = spec.and_then(|s| s.csi.as_ref());
    let mode = spec
        .and_then(|s| s.volume_mode.as_deref())
        .unwrap_or(FILESYSTEM_MODE);

    match csi {
        Some(csi) if csi.driver == driver && mode == FILESYSTEM_MODE => {
            Ok(csi.volume_handle.clone())
        }
        _ => Err(Error::validation(format!(
            "unsupported backup type: driver={}, volumeMode={}",
            csi.map(|c| c.driver.as_str()).unwrap_or("<none>"),
            mode
        ))),
    }
}

/// Node hosting the volume, taken from its node affinity
pub fn owner_node(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()?
        .node_affinity
        .as_ref()?
        .required
        .as_ref()?
        .node_selector_terms
        .first()?
        .match_expressions
        .as_ref()?
        .first()?
        .values
        .as_ref()?
        .first()
        .map(String::as_str)
}

/// Reconcile one Backup on this node
#[instrument(skip(cluster, service, settings), fields(node = %settings.node_name))]
pub async fn reconcile(
    namespace: &str,
    name: &str,
    cluster: &dyn ClusterLookups,
    service: &dyn BackupService,
    settings: &Settings,
) -> Result<Decision> {
    let Some(backup) =
        with_deadline(settings, "fetch Backup", cluster.backup(namespace, name)).await?
    else {
        debug!("Backup no longer exists");
        return Ok(Decision::Skip);
    };

    // Prevent endless loops
    if backup.state().is_terminal() {
        return Ok(Decision::Skip);
    }
    let current = backup.status.as_ref();

    if !backup.spec.kind.eq_ignore_ascii_case(SUPPORTED_SOURCE_KIND) {
        error!(kind = %backup.spec.kind, "unsupported backup source kind");
        return Ok(Decision::Skip);
    }

    if let Err(e) = validate(&backup) {
        return fail(settings, current, e);
    }

    let claim = cluster.claim(namespace, &backup.spec.name);
    let pvc = match with_deadline(settings, "fetch PVC", claim).await {
        Ok(pvc) => pvc,
        Err(e) => return fail(settings, current, e),
    };
    let volume_name = match bound_volume_name(&pvc) {
        Ok(volume_name) => volume_name,
        Err(e) => return fail(settings, current, e),
    };
    let pv = match with_deadline(settings, "fetch PV", cluster.volume(&volume_name)).await {
        Ok(pv) => pv,
        Err(e) => return fail(settings, current, e),
    };

    let volume_handle = match validate_volume(&pv, &settings.driver_name) {
        Ok(handle) => handle,
        Err(e) => return fail(settings, current, e),
    };

    match owner_node(&pv) {
        Some(node) if node == settings.node_name => {}
        volume_node => {
            info!(volume_node = ?volume_node, "This node is not in charge of the backup");
            return Ok(Decision::Skip);
        }
    }

    let credentials = if backup.spec.s3.secret.is_empty() {
        Credentials::default()
    } else {
        let secret = with_deadline(
            settings,
            "fetch Secret",
            cluster.secret(namespace, &backup.spec.s3.secret),
        )
        .await
        .and_then(|secret| credentials_from_secret(&secret));
        match secret {
            Ok(credentials) => credentials,
            Err(e) => return fail(settings, current, e),
        }
    };

    info!(lv = %volume_handle, "Backup: PV found, starting orchestration");
    let source = DataSource::s3(&backup.spec.s3, credentials, false);
    let id = backup_operation_id(namespace, name);
    let state = with_deadline(settings, "create backup", async {
        Ok(service.create_backup(&id, &volume_handle, &source).await)
    })
    .await?;

    Ok(decide(current, state, namespace, settings))
}

fn decide(
    current: Option<&OperationStatus>,
    state: BackupState,
    namespace: &str,
    settings: &Settings,
) -> Decision {
    let node = &settings.node_name;
    match state.state {
        RunState::InProgress => {
            let message = node_message(node, or_default(&state.message, "backup in progress"));
            Decision::persist(
                current,
                OperationStatus::new(OperationState::InProgress, message),
                Some(settings.requeue_interval),
            )
        }
        RunState::Error => {
            error!(backup = %state.name, message = %state.message, "Backup failed");
            metrics::BACKUPS_TOTAL.with_label_values(&["failure", namespace]).inc();
            let message = node_message(node, or_default(&state.message, "backup failed"));
            Decision::persist(current, OperationStatus::new(OperationState::Error, message), None)
        }
        RunState::Complete => {
            info!(backup = %state.name, "Backup completed");
            metrics::BACKUPS_TOTAL.with_label_values(&["success", namespace]).inc();
            let message = node_message(node, or_default(&state.message, "backup complete"));
            Decision::persist(
                current,
                OperationStatus::new(OperationState::Complete, message),
                None,
            )
        }
    }
}

fn or_default<'a>(message: &'a str, fallback: &'a str) -> &'a str {
    if message.is_empty() {
        fallback
    } else {
        message
    }
}
