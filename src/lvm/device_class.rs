//! Device class lookup

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Named mapping onto a volume group served by this node
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceClass {
    pub name: String,
    pub volume_group: String,
    /// Used when a request names no device class
    #[serde(default)]
    pub default: bool,
}

/// Immutable set of device classes loaded from the node config
#[derive(Clone, Debug, Default)]
pub struct DeviceClassManager {
    classes: Vec<DeviceClass>,
}

impl DeviceClassManager {
    pub fn new(classes: Vec<DeviceClass>) -> Self {
        Self { classes }
    }

    /// Look up a device class; an empty name selects the default class
    pub fn device_class(&self, name: &str) -> Result<&DeviceClass> {
        let found = if name.is_empty() {
            self.classes.iter().find(|dc| dc.default)
        } else {
            self.classes.iter().find(|dc| dc.name == name)
        };
        found.ok_or_else(|| Error::DeviceClassNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceClass> {
        self.classes.iter()
    }
}
