//! Boot-time firmware update engine.
//!
//! Given a set of flash devices and a static partition table, the engine verifies
//! a firmware image staged in the download partition, preserves the running
//! application into the backup partition and commits the new image, keeping a
//! [ota_state::record::UpdateRecord] journal so that an interrupted commit is
//! either completed or rolled back on the next boot.
#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod boot;
pub mod error;
pub mod header;
pub mod partition;
pub mod registry;
pub mod select;
pub mod update;
pub mod verify;

#[cfg(test)]
mod fixture;

pub use boot::{start, Board, BootError, BootPlan, BootPolicy};
pub use error::{ConfigError, Error, ErrorKind, LookupError};
pub use partition::{PartitionEntry, PartitionStorage, PartitionTable, Region, StorageError};
pub use registry::{DeviceId, FlashDevice, FlashRegistry};
pub use select::BootTarget;
pub use update::{Layout, Recovery, UpdateEngine};
pub use verify::{Mismatch, StagedImage};

pub use ota_state::digest::Digest;
pub use ota_state::record::{FirmwareVersion, ImageInfo, Outcome, UpdateRecord, UpdateState};

/// Default number of flash devices a [FlashRegistry] can hold.
pub const MAX_DEVICES: usize = 4;

/// Default number of entries a [PartitionTable] can hold.
pub const MAX_PARTITIONS: usize = 8;

/// Names of the partitions the engine works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Roles {
    /// Second stage bootloader, never written by the engine.
    pub bootloader: &'static str,
    /// Length and CRC32 of the bootloader. Optional.
    pub bootloader_crc: &'static str,
    /// Live application image.
    pub app: &'static str,
    /// Staging partition the host application writes new images to.
    pub download: &'static str,
    /// Copy of the previous application.
    pub backup: &'static str,
    /// Journal holding the update record.
    pub record: &'static str,
}

impl Roles {
    pub const DEFAULT: Roles = Roles {
        bootloader: "bootloader",
        bootloader_crc: "bootloader_crc",
        app: "app",
        download: "download",
        backup: "backup",
        record: "ota_record",
    };
}

impl Default for Roles {
    fn default() -> Self {
        Self::DEFAULT
    }
}
