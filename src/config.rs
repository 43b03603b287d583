//! Node configuration
//!
//! The node config file lists the device classes served on this node and the
//! scripts used for backup and restore. It is YAML with kebab-case keys:
//!
//! ```yaml
//! device-classes:
//!   - name: ssd
//!     volume-group: vg-ssd
//!     default: true
//! backup:
//!   script-path: /usr/local/bin/lv-backup
//!   workdir: /var/lib/lvm-backup/backups
//! restore:
//!   script-path: /usr/local/bin/lv-restore
//!   workdir: /var/lib/lvm-backup/restores
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lvm::DeviceClass;

/// CSI driver whose volumes can be backed up by this operator
pub const DEFAULT_DRIVER_NAME: &str = "topolvm.cybozu.com";

/// Parsed node config file
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub device_classes: Vec<DeviceClass>,
    pub backup: ScriptConf,
    pub restore: ScriptConf,
}

/// Where to find a script and where its runs keep their state
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScriptConf {
    /// Executable launched for each run
    pub script_path: PathBuf,
    /// Directory holding one progress directory per run
    pub workdir: PathBuf,
}

impl NodeConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate config text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: NodeConfig = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("invalid node config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.device_classes.is_empty() {
            return Err(Error::config("at least one device class must be configured"));
        }

        let mut names = HashSet::new();
        let mut defaults = 0;
        for dc in &self.device_classes {
            if dc.name.is_empty() {
                return Err(Error::config("device class name must not be empty"));
            }
            if dc.volume_group.is_empty() {
                return Err(Error::config(format!(
                    "device class '{}' has no volume group",
                    dc.name
                )));
            }
            if !names.insert(dc.name.as_str()) {
                return Err(Error::config(format!("duplicate device class '{}'", dc.name)));
            }
            if dc.default {
                defaults += 1;
            }
        }
        if defaults > 1 {
            return Err(Error::config("only one device class can be the default"));
        }

        for (what, conf) in [("backup", &self.backup), ("restore", &self.restore)] {
            if conf.script_path.as_os_str().is_empty() || conf.workdir.as_os_str().is_empty() {
                return Err(Error::config(format!(
                    "{} script-path and workdir are required",
                    what
                )));
            }
        }
        Ok(())
    }
}

/// Process-wide reconciliation settings, passed explicitly to the controllers
#[derive(Clone, Debug)]
pub struct Settings {
    /// Identity of the node this process runs on
    pub node_name: String,
    /// CSI driver name a volume must carry to be backed up
    pub driver_name: String,
    /// Delay before re-checking an in-progress run
    pub requeue_interval: Duration,
    /// Deadline for each remote call made while reconciling
    pub remote_timeout: Duration,
}

impl Settings {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            requeue_interval: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(60),
        }
    }
}
