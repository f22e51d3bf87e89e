use anyhow::Context;
use itertools::Itertools;
use ota_engine::{PartitionEntry, Roles};
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Flash devices of the board, in registration order.
    #[serde(rename = "device")]
    pub devices: Vec<DeviceConfig>,

    /// Partitions on those devices.
    #[serde(rename = "partition")]
    pub partitions: Vec<PartitionConfig>,

    /// Names of the partitions the engine works with.
    #[serde(default)]
    pub roles: RolesConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    /// Size of the device in bytes.
    pub capacity: u32,
    /// Smallest erasable unit in bytes.
    pub erase_size: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PartitionConfig {
    pub name: String,
    /// Name of the device the partition lives on.
    pub device: String,
    /// Offset from the start of the device.
    pub offset: u32,
    pub len: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RolesConfig {
    pub bootloader: String,
    pub bootloader_crc: String,
    pub app: String,
    pub download: String,
    pub backup: String,
    pub record: String,
}

impl Default for RolesConfig {
    fn default() -> Self {
        let roles = Roles::DEFAULT;
        Self {
            bootloader: roles.bootloader.to_string(),
            bootloader_crc: roles.bootloader_crc.to_string(),
            app: roles.app.to_string(),
            download: roles.download.to_string(),
            backup: roles.backup.to_string(),
            record: roles.record.to_string(),
        }
    }
}

/// The engine refers to names for the lifetime of the program.
fn leak(name: &str) -> &'static str {
    Box::leak(name.to_owned().into_boxed_str())
}

impl Config {
    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str::<Config>(s)?)
    }

    pub fn entries(&self) -> Vec<PartitionEntry> {
        self.partitions
            .iter()
            .map(|partition| PartitionEntry::new(leak(&partition.name), leak(&partition.device), partition.offset, partition.len))
            .collect()
    }

    pub fn roles(&self) -> Roles {
        Roles {
            bootloader: leak(&self.roles.bootloader),
            bootloader_crc: leak(&self.roles.bootloader_crc),
            app: leak(&self.roles.app),
            download: leak(&self.roles.download),
            backup: leak(&self.roles.backup),
            record: leak(&self.roles.record),
        }
    }

    pub fn partition(&self, name: &str) -> anyhow::Result<&PartitionConfig> {
        self.partitions
            .iter()
            .find(|partition| partition.name == name)
            .with_context(|| format!("No partition named {name}"))
    }

    /// Erase size shared by all devices.
    ///
    /// The simulator models every device with the same geometry.
    pub fn erase_size(&self) -> anyhow::Result<u32> {
        match self.devices.iter().map(|device| device.erase_size).all_equal_value() {
            Ok(erase_size) => Ok(erase_size),
            Err(None) => Err(anyhow::anyhow!("No devices configured")),
            Err(Some((a, b))) => Err(anyhow::anyhow!(
                "Devices with different erase sizes ({a} and {b}) are not supported"
            )),
        }
    }
}
