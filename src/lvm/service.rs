//! Volume service
//!
//! Capacity admission for logical volume creation and resizing. Free space
//! is read and then acted upon, so every mutating call on a volume group runs
//! inside that group's exclusive admission section.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{DeviceClassManager, LogicalVolume, VolumeGroup, VolumeGroupAccessor};
use crate::config::ScriptConf;
use crate::error::{Error, Result};
use crate::metrics;
use crate::orchestrator::{
    BackupOrchestrator, BackupService, BackupState, DataSource, RestoreRequest,
};
use crate::script::{Progress, ScriptParams, ScriptRunner};

/// Node-local volume service
pub struct LvService {
    device_classes: DeviceClassManager,
    accessor: Arc<dyn VolumeGroupAccessor>,
    group_locks: DashMap<String, Arc<Mutex<()>>>,
    backups: BackupOrchestrator,
    restores: ScriptRunner,
    changes: watch::Sender<u64>,
}

impl LvService {
    pub fn new(
        device_classes: DeviceClassManager,
        accessor: Arc<dyn VolumeGroupAccessor>,
        backup: &ScriptConf,
        restore: &ScriptConf,
    ) -> Self {
        Self::with_runners(
            device_classes,
            accessor,
            ScriptRunner::new("backup", backup),
            ScriptRunner::new("restore", restore),
        )
    }

    pub fn with_runners(
        device_classes: DeviceClassManager,
        accessor: Arc<dyn VolumeGroupAccessor>,
        backup: ScriptRunner,
        restore: ScriptRunner,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            device_classes,
            accessor,
            group_locks: DashMap::new(),
            backups: BackupOrchestrator::new(backup),
            restores: restore,
            changes,
        }
    }

    /// Receiver bumped after every successful mutation
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    async fn lock_group(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self.group_locks.entry(name.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    async fn volume_group(&self, device_class: &str) -> Result<Arc<dyn VolumeGroup>> {
        let dc = self.device_classes.device_class(device_class)?;
        self.accessor.volume_group(&dc.volume_group).await
    }

    /// Create a volume of `size` bytes, seeding it from `restore` if given
    pub async fn create_volume(
        &self,
        device_class: &str,
        name: &str,
        size: u64,
        tags: &[String],
        restore: Option<&RestoreRequest>,
    ) -> Result<LogicalVolume> {
        let result = self.admit_create(device_class, name, size, tags, restore).await;
        record("create", &result);
        result
    }

    async fn admit_create(
        &self,
        device_class: &str,
        name: &str,
        size: u64,
        tags: &[String],
        restore: Option<&RestoreRequest>,
    ) -> Result<LogicalVolume> {
        let vg = self.volume_group(device_class).await?;

        let lv = {
            let _admission = self.lock_group(vg.name()).await;
            let free = vg.free().await.map_err(|e| {
                error!(volume_group = vg.name(), error = %e, "failed to get free space of VG");
                e
            })?;
            if free < size {
                warn!(
                    volume_group = vg.name(),
                    free,
                    requested = size,
                    "no enough space left on VG"
                );
                return Err(Error::CapacityExhausted { free, requested: size });
            }
            vg.create_volume(name, size, tags).await.map_err(|e| {
                error!(
                    name = %name,
                    requested = size,
                    tags = ?tags,
                    error = %e,
                    "failed to create volume"
                );
                e
            })?
        };
        self.notify();

        if let Some(restore) = restore {
            if let Err(e) = self.seed(&lv, restore).await {
                error!(
                    name = %name,
                    restore = %restore.id,
                    error = %e,
                    "restore failed, removing volume"
                );
                if let Err(remove_err) = vg.remove_volume(name).await {
                    error!(
                        name = %name,
                        error = %remove_err,
                        "failed to remove volume after restore failure"
                    );
                } else {
                    self.notify();
                }
                return Err(e);
            }
        }

        info!(name = %name, size = lv.size, volume_group = vg.name(), "created a new LV");
        Ok(lv)
    }

    async fn seed(&self, lv: &LogicalVolume, restore: &RestoreRequest) -> Result<()> {
        let params = ScriptParams::new(
            vec![lv.path.to_string_lossy().into_owned()],
            restore.source.to_env(),
        );
        let progress = if restore.source.synchronous {
            self.restores.run_to_completion(&restore.id, params).await?
        } else {
            self.restores.start(&restore.id, params).await?
        };
        match progress {
            Progress::Failed(message) => Err(Error::Restore(message)),
            _ => Ok(()),
        }
    }

    /// Grow a volume to `size` bytes; shrinking is rejected
    pub async fn resize_volume(&self, device_class: &str, name: &str, size: u64) -> Result<()> {
        let result = self.admit_resize(device_class, name, size).await;
        record("resize", &result);
        result
    }

    async fn admit_resize(&self, device_class: &str, name: &str, requested: u64) -> Result<()> {
        let vg = self.volume_group(device_class).await?;
        let _admission = self.lock_group(vg.name()).await;

        let lv = vg.find_volume(name).await?.ok_or_else(|| {
            warn!(name = %name, "logical volume is not found");
            Error::VolumeNotFound(name.to_string())
        })?;
        let current = lv.size;
        if requested < current {
            warn!(name = %name, requested, current, "shrinking volume size is not allowed");
            return Err(Error::ShrinkNotAllowed { current, requested });
        }
        if requested == current {
            return Ok(());
        }

        let free = vg.free().await?;
        let delta = requested - current;
        if free < delta {
            warn!(name = %name, requested, current, free, "no enough space left on VG");
            return Err(Error::CapacityExhausted { free, requested: delta });
        }

        vg.resize_volume(name, requested).await.map_err(|e| {
            error!(name = %name, requested, current, free, error = %e, "failed to resize LV");
            e
        })?;
        self.notify();

        info!(name = %name, size = requested, "resized a LV");
        Ok(())
    }

    /// Remove a volume; an absent volume is not an error
    pub async fn remove_volume(&self, device_class: &str, name: &str) -> Result<()> {
        let result = self.remove(device_class, name).await;
        record("remove", &result);
        result
    }

    async fn remove(&self, device_class: &str, name: &str) -> Result<()> {
        let vg = self.volume_group(device_class).await?;
        if vg.find_volume(name).await?.is_none() {
            return Ok(());
        }
        if let Err(e) = vg.remove_volume(name).await {
            // a concurrent removal may have won the race
            if vg.find_volume(name).await?.is_none() {
                info!(name = %name, "LV was removed concurrently");
                return Ok(());
            }
            error!(name = %name, error = %e, "failed to remove volume");
            return Err(e);
        }
        self.notify();

        info!(name = %name, "removed a LV");
        Ok(())
    }

    /// Publish the free capacity of every configured volume group
    pub async fn report_capacity(&self) {
        for dc in self.device_classes.iter() {
            let free = match self.accessor.volume_group(&dc.volume_group).await {
                Ok(vg) => vg.free().await,
                Err(e) => Err(e),
            };
            match free {
                Ok(free) => metrics::VG_FREE_BYTES
                    .with_label_values(&[&dc.volume_group])
                    .set(free as f64),
                Err(e) => warn!(
                    volume_group = %dc.volume_group,
                    error = %e,
                    "failed to read free capacity"
                ),
            }
        }
    }
}

#[async_trait]
impl BackupService for LvService {
    async fn create_backup(
        &self,
        name: &str,
        volume_handle: &str,
        source: &DataSource,
    ) -> BackupState {
        self.backups.create_backup(name, volume_handle, source).await
    }

    async fn restore_progress(&self, id: &str) -> Result<Progress> {
        self.restores.query(id).await
    }
}

fn record<T>(operation: &str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(Error::CapacityExhausted { .. }) | Err(Error::ShrinkNotAllowed { .. }) => "rejected",
        Err(_) => "failure",
    };
    metrics::LV_OPERATIONS
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Refresh the capacity gauges whenever the service reports a change
pub async fn watch_capacity(service: Arc<LvService>, shutdown: CancellationToken) {
    let mut changes = service.subscribe();
    service.report_capacity().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                service.report_capacity().await;
            }
        }
    }
}
