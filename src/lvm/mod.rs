//! Logical volume management
//!
//! The volume group accessor is the seam to the host's LVM installation. The
//! [`LvService`] sits on top of it and owns capacity admission for volume
//! creation and resizing, restore seeding and backup orchestration.

mod command;
mod device_class;
mod service;

pub use command::LvmCommand;
pub use device_class::*;
pub use service::*;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// A logical volume as reported by its volume group
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogicalVolume {
    pub name: String,
    /// Size in bytes
    pub size: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub tags: Vec<String>,
    /// Device node, e.g. /dev/vg-ssd/pvc-1234
    pub path: PathBuf,
}

/// A volume group: a pool of capacity logical volumes are carved from
#[async_trait]
pub trait VolumeGroup: Send + Sync {
    fn name(&self) -> &str;

    /// Unallocated capacity in bytes
    async fn free(&self) -> Result<u64>;

    async fn list_volumes(&self) -> Result<Vec<LogicalVolume>>;

    async fn find_volume(&self, name: &str) -> Result<Option<LogicalVolume>> {
        Ok(self
            .list_volumes()
            .await?
            .into_iter()
            .find(|lv| lv.name == name))
    }

    async fn create_volume(&self, name: &str, size: u64, tags: &[String]) -> Result<LogicalVolume>;

    async fn resize_volume(&self, name: &str, size: u64) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;
}

/// Resolves volume groups by name
#[async_trait]
pub trait VolumeGroupAccessor: Send + Sync {
    async fn volume_group(&self, name: &str) -> Result<Arc<dyn VolumeGroup>>;
}
