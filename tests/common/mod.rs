//! Shared fakes for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeSpec,
    Secret, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use lvm_backup_operator::adapters::ClusterLookups;
use lvm_backup_operator::crd::{
    Backup, BackupSpec, OperationStatus, Restore, RestoreSpec, S3Spec,
};
use lvm_backup_operator::error::{Error, Result};
use lvm_backup_operator::lvm::{LogicalVolume, VolumeGroup, VolumeGroupAccessor};
use lvm_backup_operator::orchestrator::{BackupService, BackupState, DataSource};
use lvm_backup_operator::reconcilers::Decision;
use lvm_backup_operator::script::{Progress, RunState};

pub const NAMESPACE: &str = "default";
pub const DRIVER: &str = "topolvm.cybozu.com";

// ============================================================================
// Volume groups
// ============================================================================

#[derive(Debug, Default)]
struct VgState {
    capacity: u64,
    volumes: Vec<LogicalVolume>,
}

/// In-memory volume group; allocation itself never checks free space and
/// removal of a missing volume fails like lvremove
#[derive(Debug)]
pub struct FakeVolumeGroup {
    name: String,
    state: Mutex<VgState>,
}

impl FakeVolumeGroup {
    pub fn new(name: &str, capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(VgState {
                capacity,
                volumes: Vec::new(),
            }),
        })
    }

    pub fn used(&self) -> u64 {
        self.state.lock().unwrap().volumes.iter().map(|lv| lv.size).sum()
    }

    pub fn free_now(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.capacity.saturating_sub(state.volumes.iter().map(|lv| lv.size).sum())
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .iter()
            .map(|lv| lv.name.clone())
            .collect()
    }

    pub fn size_of(&self, name: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .iter()
            .find(|lv| lv.name == name)
            .map(|lv| lv.size)
    }
}

#[async_trait]
impl VolumeGroup for FakeVolumeGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn free(&self) -> Result<u64> {
        let free = self.free_now();
        // widen the window between the capacity check and the allocation
        tokio::task::yield_now().await;
        Ok(free)
    }

    async fn list_volumes(&self) -> Result<Vec<LogicalVolume>> {
        Ok(self.state.lock().unwrap().volumes.clone())
    }

    async fn create_volume(&self, name: &str, size: u64, tags: &[String]) -> Result<LogicalVolume> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        if state.volumes.iter().any(|lv| lv.name == name) {
            return Err(Error::lvm(format!("volume {} already exists", name)));
        }
        let lv = LogicalVolume {
            name: name.to_string(),
            size,
            dev_major: 253,
            dev_minor: state.volumes.len() as u32,
            tags: tags.to_vec(),
            path: PathBuf::from("/dev").join(&self.name).join(name),
        };
        state.volumes.push(lv.clone());
        Ok(lv)
    }

    async fn resize_volume(&self, name: &str, size: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let lv = state
            .volumes
            .iter_mut()
            .find(|lv| lv.name == name)
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))?;
        lv.size = size;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        let before = state.volumes.len();
        state.volumes.retain(|lv| lv.name != name);
        if state.volumes.len() == before {
            // lvremove fails on a missing volume
            return Err(Error::lvm(format!(
                "Failed to find logical volume \"{}/{}\"",
                self.name, name
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAccessor {
    groups: HashMap<String, Arc<FakeVolumeGroup>>,
}

impl FakeAccessor {
    pub fn with_group(mut self, vg: Arc<FakeVolumeGroup>) -> Self {
        self.groups.insert(vg.name.clone(), vg);
        self
    }
}

#[async_trait]
impl VolumeGroupAccessor for FakeAccessor {
    async fn volume_group(&self, name: &str) -> Result<Arc<dyn VolumeGroup>> {
        self.groups
            .get(name)
            .cloned()
            .map(|vg| vg as Arc<dyn VolumeGroup>)
            .ok_or_else(|| Error::VolumeGroupNotFound(name.to_string()))
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// In-memory API server
#[derive(Default)]
pub struct FakeCluster {
    pub backups: Mutex<HashMap<String, Backup>>,
    pub restores: Mutex<HashMap<String, Restore>>,
    pub claims: HashMap<String, PersistentVolumeClaim>,
    pub volumes: HashMap<String, PersistentVolume>,
    pub secrets: HashMap<String, Secret>,
}

impl FakeCluster {
    pub fn add_backup(&self, backup: Backup) {
        let name = backup.metadata.name.clone().unwrap_or_default();
        self.backups.lock().unwrap().insert(name, backup);
    }

    pub fn add_restore(&self, restore: Restore) {
        let name = restore.metadata.name.clone().unwrap_or_default();
        self.restores.lock().unwrap().insert(name, restore);
    }

    pub fn backup_status(&self, name: &str) -> Option<OperationStatus> {
        self.backups.lock().unwrap().get(name).and_then(|b| b.status.clone())
    }

    pub fn restore_status(&self, name: &str) -> Option<OperationStatus> {
        self.restores.lock().unwrap().get(name).and_then(|r| r.status.clone())
    }

    /// What a controller does with a decision
    pub fn apply_backup(&self, name: &str, decision: &Decision) {
        if let Decision::Persist { status, .. } = decision {
            if let Some(backup) = self.backups.lock().unwrap().get_mut(name) {
                backup.status = Some(status.clone());
            }
        }
    }

    pub fn apply_restore(&self, name: &str, decision: &Decision) {
        if let Decision::Persist { status, .. } = decision {
            if let Some(restore) = self.restores.lock().unwrap().get_mut(name) {
                restore.status = Some(status.clone());
            }
        }
    }
}

#[async_trait]
impl ClusterLookups for FakeCluster {
    async fn backup(&self, _namespace: &str, name: &str) -> Result<Option<Backup>> {
        Ok(self.backups.lock().unwrap().get(name).cloned())
    }

    async fn restore(&self, _namespace: &str, name: &str) -> Result<Option<Restore>> {
        Ok(self.restores.lock().unwrap().get(name).cloned())
    }

    async fn claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.claims
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PvcNotFound(format!("{}/{}", namespace, name)))
    }

    async fn volume(&self, name: &str) -> Result<PersistentVolume> {
        self.volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PvNotFound(name.to_string()))
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SecretNotFound(format!("{}/{}", namespace, name)))
    }
}

// ============================================================================
// Volume service
// ============================================================================

/// Backup service replaying scripted states
#[derive(Default)]
pub struct ScriptedService {
    states: Mutex<Vec<RunState>>,
    pub calls: Mutex<Vec<(String, String, DataSource)>>,
    pub restore_runs: Mutex<HashMap<String, Progress>>,
}

impl ScriptedService {
    pub fn new(states: Vec<RunState>) -> Self {
        Self {
            states: Mutex::new(states),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BackupService for ScriptedService {
    async fn create_backup(
        &self,
        name: &str,
        volume_handle: &str,
        source: &DataSource,
    ) -> BackupState {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), volume_handle.to_string(), source.clone()));
        let mut states = self.states.lock().unwrap();
        let state = if states.len() > 1 {
            states.remove(0)
        } else {
            states.first().copied().unwrap_or(RunState::InProgress)
        };
        BackupState {
            name: name.to_string(),
            state,
            message: match state {
                RunState::Error => "upload failed".to_string(),
                _ => String::new(),
            },
        }
    }

    async fn restore_progress(&self, id: &str) -> Result<Progress> {
        Ok(self
            .restore_runs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(Progress::NotStarted))
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    }
}

pub fn s3_spec(secret: &str) -> S3Spec {
    S3Spec {
        path: "s3://backups/data".to_string(),
        secret: secret.to_string(),
        endpoint: "https://minio.local:9000".to_string(),
        verify_tls: true,
        http_proxy: String::new(),
        https_proxy: String::new(),
    }
}

pub fn backup(name: &str, claim: &str) -> Backup {
    Backup {
        metadata: metadata(name),
        spec: BackupSpec {
            backup_storage_type: "s3".to_string(),
            s3: s3_spec("s3-creds"),
            kind: "PVC".to_string(),
            name: claim.to_string(),
        },
        status: None,
    }
}

pub fn restore(name: &str, synchronous: bool) -> Restore {
    Restore {
        metadata: metadata(name),
        spec: RestoreSpec {
            backup_storage_type: "s3".to_string(),
            s3: s3_spec("s3-creds"),
            synchronous_restore: synchronous,
        },
        status: None,
    }
}

pub fn claim(name: &str, volume: Option<&str>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: metadata(name),
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: volume.map(str::to_string),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn volume(name: &str, driver: &str, mode: &str, node: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: driver.to_string(),
                volume_handle: format!("lv-{}", name),
                ..Default::default()
            }),
            volume_mode: Some(mode.to_string()),
            node_affinity: Some(VolumeNodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "topology.topolvm.cybozu.com/node".to_string(),
                            operator: "In".to_string(),
                            values: Some(vec![node.to_string()]),
                        }]),
                        match_fields: None,
                    }],
                }),
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn secret(name: &str, entries: &[(&str, &str)]) -> Secret {
    let data: BTreeMap<String, ByteString> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect();
    Secret {
        metadata: metadata(name),
        data: Some(data),
        ..Default::default()
    }
}

/// A claim "data" bound to volume "pv-data" hosted on `node`, with credentials
pub fn cluster_with_volume(node: &str, mode: &str) -> FakeCluster {
    let mut cluster = FakeCluster::default();
    cluster
        .claims
        .insert("data".to_string(), claim("data", Some("pv-data")));
    cluster
        .volumes
        .insert("pv-data".to_string(), volume("pv-data", DRIVER, mode, node));
    cluster.secrets.insert(
        "s3-creds".to_string(),
        secret(
            "s3-creds",
            &[("AccessKeyId", "AKIA"), ("SecretAccessKey", "s3cr3t")],
        ),
    );
    cluster
}

// ============================================================================
// Scripts
// ============================================================================

/// Write an executable shell script
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
