//! Volume group accessor backed by the LVM2 command line tools
//!
//! Reports are requested as JSON (`--reportformat json`) with sizes in plain
//! bytes so no unit parsing is needed.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{LogicalVolume, VolumeGroup, VolumeGroupAccessor};
use crate::error::{Error, Result};

const DEFAULT_LVM_PATH: &str = "/sbin/lvm";

/// Runs `lvm` subcommands on the host
#[derive(Clone, Debug)]
pub struct LvmCommand {
    lvm_path: PathBuf,
}

impl Default for LvmCommand {
    fn default() -> Self {
        Self::new(DEFAULT_LVM_PATH)
    }
}

impl LvmCommand {
    pub fn new(lvm_path: impl Into<PathBuf>) -> Self {
        Self {
            lvm_path: lvm_path.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(lvm = %self.lvm_path.display(), args = ?args, "running lvm command");
        let output = Command::new(&self.lvm_path)
            .args(args)
            .env("LC_ALL", "C")
            .output()
            .await
            .map_err(|e| Error::lvm(format!("{}: {}", self.lvm_path.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::lvm(format!(
                "lvm {} failed ({}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn vg_free(&self, vg: &str) -> Result<Option<u64>> {
        let args = to_args(&[
            "vgs",
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "vg_name,vg_free",
            vg,
        ]);
        match self.run(&args).await {
            Ok(out) => parse_vg_report(&out, vg),
            Err(Error::Lvm(msg)) if msg.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl VolumeGroupAccessor for LvmCommand {
    async fn volume_group(&self, name: &str) -> Result<Arc<dyn VolumeGroup>> {
        if self.vg_free(name).await?.is_none() {
            return Err(Error::VolumeGroupNotFound(name.to_string()));
        }
        Ok(Arc::new(CommandVolumeGroup {
            name: name.to_string(),
            lvm: self.clone(),
        }))
    }
}

/// A volume group managed through [`LvmCommand`]
#[derive(Debug)]
struct CommandVolumeGroup {
    name: String,
    lvm: LvmCommand,
}

impl CommandVolumeGroup {
    fn lv_path(&self, lv: &str) -> String {
        format!("{}/{}", self.name, lv)
    }
}

#[async_trait]
impl VolumeGroup for CommandVolumeGroup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn free(&self) -> Result<u64> {
        self.lvm
            .vg_free(&self.name)
            .await?
            .ok_or_else(|| Error::VolumeGroupNotFound(self.name.clone()))
    }

    async fn list_volumes(&self) -> Result<Vec<LogicalVolume>> {
        let args = to_args(&[
            "lvs",
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "lv_name,lv_size,lv_kernel_major,lv_kernel_minor,lv_tags",
            &self.name,
        ]);
        let out = self.lvm.run(&args).await?;
        parse_lv_report(&out, &self.name)
    }

    async fn create_volume(&self, name: &str, size: u64, tags: &[String]) -> Result<LogicalVolume> {
        let mut args = to_args(&[
            "lvcreate",
            "-n",
            name,
            "-L",
            &format!("{}b", size),
            "-W",
            "y",
            "-y",
        ]);
        for tag in tags {
            args.push("--addtag".to_string());
            args.push(tag.clone());
        }
        args.push(self.name.clone());
        self.lvm.run(&args).await?;

        self.find_volume(name)
            .await?
            .ok_or_else(|| {
                Error::lvm(format!(
                    "created volume {} is not listed",
                    self.lv_path(name)
                ))
            })
    }

    async fn resize_volume(&self, name: &str, size: u64) -> Result<()> {
        let args = to_args(&["lvresize", "-L", &format!("{}b", size), &self.lv_path(name)]);
        self.lvm.run(&args).await.map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let args = to_args(&["lvremove", "-f", &self.lv_path(name)]);
        self.lvm.run(&args).await.map(|_| ())
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[derive(Deserialize)]
struct Report<T> {
    report: Vec<T>,
}

#[derive(Deserialize)]
struct VgSection {
    #[serde(default)]
    vg: Vec<VgRow>,
}

#[derive(Deserialize)]
struct VgRow {
    vg_name: String,
    vg_free: String,
}

#[derive(Deserialize)]
struct LvSection {
    #[serde(default)]
    lv: Vec<LvRow>,
}

#[derive(Deserialize)]
struct LvRow {
    lv_name: String,
    lv_size: String,
    #[serde(default)]
    lv_kernel_major: String,
    #[serde(default)]
    lv_kernel_minor: String,
    #[serde(default)]
    lv_tags: String,
}

fn parse_bytes(field: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::lvm(format!("unexpected {} value '{}'", field, value)))
}

/// Inactive volumes report -1 for their device numbers
fn parse_device_number(value: &str) -> u32 {
    value.trim().parse().unwrap_or(0)
}

pub(crate) fn parse_vg_report(out: &str, vg: &str) -> Result<Option<u64>> {
    let report: Report<VgSection> = serde_json::from_str(out)?;
    report
        .report
        .into_iter()
        .flat_map(|section| section.vg)
        .find(|row| row.vg_name == vg)
        .map(|row| parse_bytes("vg_free", &row.vg_free))
        .transpose()
}

pub(crate) fn parse_lv_report(out: &str, vg: &str) -> Result<Vec<LogicalVolume>> {
    let report: Report<LvSection> = serde_json::from_str(out)?;
    report
        .report
        .into_iter()
        .flat_map(|section| section.lv)
        .map(|row| {
            Ok(LogicalVolume {
                size: parse_bytes("lv_size", &row.lv_size)?,
                dev_major: parse_device_number(&row.lv_kernel_major),
                dev_minor: parse_device_number(&row.lv_kernel_minor),
                tags: row
                    .lv_tags
                    .split(',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
                path: PathBuf::from("/dev").join(vg).join(&row.lv_name),
                name: row.lv_name,
            })
        })
        .collect()
}
