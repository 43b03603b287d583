//! Backup Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{current_state, OperationState, OperationStatus, S3Spec};

/// Backup resource specification
///
/// Requests a copy of a node-local logical volume, referenced through the
/// claim that binds it, to be uploaded to remote storage.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "topolvm.cybozu.com",
    version = "v1",
    kind = "Backup",
    plural = "backups",
    singular = "backup",
    namespaced,
    status = "OperationStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Source", "type": "string", "jsonPath": ".spec.name"}"#,
    printcolumn = r#"{"name": "Message", "type": "string", "jsonPath": ".status.message", "priority": 1}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Storage backend type (s3)
    #[serde(default = "default_storage_type")]
    pub backup_storage_type: String,

    /// S3 target configuration
    pub s3: S3Spec,

    /// Kind of the source object; only "pvc" is supported
    pub kind: String,

    /// Name of the source object in the Backup's namespace
    pub name: String,
}

pub(crate) fn default_storage_type() -> String {
    super::STORAGE_TYPE_S3.to_string()
}

impl Backup {
    /// Current state, Pending when no status was written yet
    pub fn state(&self) -> OperationState {
        current_state(self.status.as_ref())
    }
}

/// Progress-store key of the backup run for a namespaced Backup
pub fn backup_operation_id(namespace: &str, name: &str) -> String {
    format!("{}.{}", namespace, name)
}
