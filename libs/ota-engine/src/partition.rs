//! Static partition table and partition scoped flash access.

use defmt_or_log::debug;
use embedded_storage_async::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

use crate::error::{ConfigError, LookupError};
use crate::registry::{DeviceId, FlashRegistry};
use crate::MAX_PARTITIONS;

/// A partition as declared by the board configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionEntry {
    pub name: &'static str,
    /// Name of the [crate::FlashDevice] the partition lives on.
    pub device: &'static str,
    pub offset: u32,
    pub len: u32,
}

impl PartitionEntry {
    pub const fn new(name: &'static str, device: &'static str, offset: u32, len: u32) -> Self {
        Self {
            name,
            device,
            offset,
            len,
        }
    }
}

/// A validated partition, resolved to its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    pub name: &'static str,
    pub device: DeviceId,
    pub offset: u32,
    pub len: u32,
    /// Erase size of the device.
    pub erase_size: u32,
}

impl Region {
    /// Exclusive end address on the device.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.len as u64
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.device == other.device && (self.offset as u64) < other.end() && (other.offset as u64) < self.end()
    }

    /// Whether the partition starts and ends on erase boundaries.
    pub fn is_erase_aligned(&self) -> bool {
        self.offset.is_multiple_of(self.erase_size) && self.len.is_multiple_of(self.erase_size)
    }

    /// Number of bytes to erase to cover `len` bytes from the start of the partition.
    pub fn erase_len(&self, len: u32) -> u32 {
        len.next_multiple_of(self.erase_size).min(self.len)
    }
}

/// Read-only map from partition names to regions.
///
/// Only obtainable through [PartitionTable::validate_layout].
#[derive(Debug, Clone)]
pub struct PartitionTable<const M: usize = MAX_PARTITIONS> {
    regions: heapless::Vec<Region, M>,
}

impl<const M: usize> PartitionTable<M> {
    /// Resolve and check all entries against an initialized registry.
    ///
    /// Rejects duplicate or unknown names, partitions exceeding their device and
    /// partitions overlapping on the same device.
    pub fn validate_layout<T: NorFlash, const N: usize>(
        entries: &[PartitionEntry],
        registry: &FlashRegistry<T, N>,
    ) -> Result<Self, ConfigError> {
        if !registry.is_initialized() {
            return Err(ConfigError::RegistryNotInitialized);
        }

        let mut regions = heapless::Vec::new();
        for entry in entries {
            if entry.name.is_empty() {
                return Err(ConfigError::EmptyName);
            }

            if regions.iter().any(|region: &Region| region.name == entry.name) {
                return Err(ConfigError::DuplicatePartition(entry.name));
            }

            let id = registry.find(entry.device).map_err(|_| ConfigError::UnknownDevice {
                partition: entry.name,
                device: entry.device,
            })?;
            let device = registry.device(id).map_err(|_| ConfigError::RegistryNotInitialized)?;

            if entry.len == 0 {
                return Err(ConfigError::EmptyPartition(entry.name));
            }

            let region = Region {
                name: entry.name,
                device: id,
                offset: entry.offset,
                len: entry.len,
                erase_size: device.erase_size() as u32,
            };

            if region.end() > device.capacity() as u64 {
                return Err(ConfigError::ExceedsCapacity(entry.name));
            }

            if let Some(other) = regions.iter().find(|other| region.overlaps(other)) {
                return Err(ConfigError::Overlap(other.name, entry.name));
            }

            regions.push(region).map_err(|_| ConfigError::TooManyEntries)?;
            debug!(
                "Partition {} at {:#x}..{:#x} on {}",
                entry.name,
                region.offset,
                region.end(),
                entry.device
            );
        }

        Ok(Self { regions })
    }

    pub fn resolve(&self, name: &str) -> Result<Region, LookupError> {
        self.regions
            .iter()
            .find(|region| region.name == name)
            .copied()
            .ok_or(LookupError::NotFound)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }
}

/// Errors yielded by a [PartitionStorage].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError<E> {
    /// The access does not fit inside the partition.
    OutOfBounds,
    /// The underlying flash device yielded an error.
    Flash(E),
}

impl<E> From<E> for StorageError<E> {
    fn from(value: E) -> Self {
        StorageError::Flash(value)
    }
}

impl<E: NorFlashError> NorFlashError for StorageError<E> {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            StorageError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            StorageError::Flash(e) => e.kind(),
        }
    }
}

/// One partition of a device, addressed relative to the start of the partition.
///
/// Accesses outside the partition yield [StorageError::OutOfBounds] and never reach the device.
pub struct PartitionStorage<'a, T> {
    flash: &'a mut T,
    region: Region,
}

impl<'a, T: NorFlash> PartitionStorage<'a, T> {
    pub fn new(flash: &'a mut T, region: Region) -> Self {
        Self { flash, region }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    fn absolute(&self, offset: u32, len: usize) -> Result<u32, StorageError<T::Error>> {
        if offset as u64 + len as u64 > self.region.len as u64 {
            return Err(StorageError::OutOfBounds);
        }
        Ok(self.region.offset + offset)
    }
}

impl<T: NorFlash> ErrorType for PartitionStorage<'_, T> {
    type Error = StorageError<T::Error>;
}

impl<T: NorFlash> ReadNorFlash for PartitionStorage<'_, T> {
    const READ_SIZE: usize = T::READ_SIZE;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let address = self.absolute(offset, bytes.len())?;
        Ok(self.flash.read(address, bytes).await?)
    }

    fn capacity(&self) -> usize {
        self.region.len as usize
    }
}

impl<T: NorFlash> NorFlash for PartitionStorage<'_, T> {
    const WRITE_SIZE: usize = T::WRITE_SIZE;
    const ERASE_SIZE: usize = T::ERASE_SIZE;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to {
            return Err(StorageError::OutOfBounds);
        }
        let from = self.absolute(from, 0)?;
        let to = self.absolute(to, 0)?;
        Ok(self.flash.erase(from, to).await?)
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let address = self.absolute(offset, bytes.len())?;
        Ok(self.flash.write(address, bytes).await?)
    }
}
