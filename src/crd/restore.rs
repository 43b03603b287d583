//! Restore Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backup::default_storage_type;
use super::{current_state, OperationState, OperationStatus, S3Spec};

/// Restore resource specification
///
/// Describes where the content of a pre-populated volume comes from. A claim
/// references the Restore as its data source; the node that provisions the
/// volume runs the restore and reports progress here.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "topolvm.cybozu.com",
    version = "v1",
    kind = "Restore",
    plural = "restores",
    singular = "restore",
    namespaced,
    status = "OperationStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Synchronous", "type": "boolean", "jsonPath": ".spec.synchronousRestore"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Storage backend type (s3)
    #[serde(default = "default_storage_type")]
    pub backup_storage_type: String,

    /// S3 source configuration
    pub s3: S3Spec,

    /// Block volume creation until the restore script has finished
    #[serde(default)]
    pub synchronous_restore: bool,
}

impl Restore {
    /// Current state, Pending when no status was written yet
    pub fn state(&self) -> OperationState {
        current_state(self.status.as_ref())
    }

    /// Key under which the restore run is tracked on the provisioning node
    pub fn operation_id(&self) -> String {
        restore_operation_id(
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }
}

/// Progress-store key of the restore run for a namespaced Restore
pub fn restore_operation_id(namespace: &str, name: &str) -> String {
    format!("{}.{}", namespace, name)
}
