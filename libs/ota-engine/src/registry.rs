//! Named flash devices.
//!
//! Devices are registered once at startup and validated by [FlashRegistry::initialize].
//! Lookups are refused until that validation has succeeded.

use defmt_or_log::{debug, info};
use embedded_storage_async::nor_flash::NorFlash;

use ota_state::record::RECORD_SIZE;

use crate::error::{ConfigError, LookupError};
use crate::header::{HEADER_SIZE, SHADOW_SIZE};
use crate::update::JOURNAL_BUFFER_SIZE;
use crate::verify::CHUNK_SIZE;
use crate::MAX_DEVICES;

/// Sizes of the buffers the engine reads into.
const READ_SIZES: [usize; 5] = [CHUNK_SIZE, JOURNAL_BUFFER_SIZE, RECORD_SIZE, HEADER_SIZE, SHADOW_SIZE];

/// Sizes of the buffers the engine programs from.
const WRITE_SIZES: [usize; 2] = [CHUNK_SIZE, RECORD_SIZE];

/// Index of a device in its [FlashRegistry].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceId(u8);

impl DeviceId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A flash device and the name it is known by.
pub struct FlashDevice<T> {
    name: &'static str,
    flash: T,
}

impl<T: NorFlash> FlashDevice<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.flash.capacity()
    }

    pub fn erase_size(&self) -> usize {
        T::ERASE_SIZE
    }

    pub fn flash(&self) -> &T {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut T {
        &mut self.flash
    }

    /// Check the geometry of the device.
    ///
    /// The flash operations themselves are guaranteed by [NorFlash]. Every buffer
    /// the engine transfers has to be a whole number of read or write units.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let capacity = self.capacity();
        if capacity == 0 || !capacity.is_multiple_of(T::ERASE_SIZE) || capacity as u64 > u32::MAX as u64 {
            return Err(ConfigError::BadCapacity(self.name));
        }

        if T::ERASE_SIZE == 0
            || !T::ERASE_SIZE.is_multiple_of(T::WRITE_SIZE)
            || !T::ERASE_SIZE.is_multiple_of(T::READ_SIZE)
            || READ_SIZES.iter().any(|size| !size.is_multiple_of(T::READ_SIZE))
            || WRITE_SIZES.iter().any(|size| !size.is_multiple_of(T::WRITE_SIZE))
        {
            return Err(ConfigError::BadGranularity(self.name));
        }

        Ok(())
    }
}

/// Fixed capacity table of flash devices.
pub struct FlashRegistry<T, const N: usize = MAX_DEVICES> {
    devices: heapless::Vec<FlashDevice<T>, N>,
    initialized: bool,
}

impl<T: NorFlash, const N: usize> Default for FlashRegistry<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: NorFlash, const N: usize> FlashRegistry<T, N> {
    pub const fn new() -> Self {
        Self {
            devices: heapless::Vec::new(),
            initialized: false,
        }
    }

    /// Add a device, only possible before [Self::initialize].
    pub fn register(&mut self, name: &'static str, flash: T) -> Result<DeviceId, ConfigError> {
        if self.initialized {
            return Err(ConfigError::RegistrySealed);
        }

        let id = DeviceId(u8::try_from(self.devices.len()).map_err(|_| ConfigError::TooManyEntries)?);
        self.devices
            .push(FlashDevice { name, flash })
            .map_err(|_| ConfigError::TooManyEntries)?;
        Ok(id)
    }

    /// Validate every registered device exactly once.
    ///
    /// Calling this again after it succeeded does nothing.
    pub fn initialize(&mut self) -> Result<(), ConfigError> {
        if self.initialized {
            return Ok(());
        }

        for (i, device) in self.devices.iter().enumerate() {
            device.validate()?;

            if self.devices[..i].iter().any(|other| other.name == device.name) {
                return Err(ConfigError::DuplicateDevice(device.name));
            }

            debug!(
                "Flash device {} with capacity {} and erase size {}",
                device.name,
                device.capacity(),
                T::ERASE_SIZE
            );
        }

        self.initialized = true;
        info!("Flash registry initialized with {} device(s)", self.devices.len());
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Find a device by exact name.
    pub fn find(&self, name: &str) -> Result<DeviceId, LookupError> {
        self.check_initialized()?;
        self.devices
            .iter()
            .position(|device| device.name == name)
            .map(|i| DeviceId(i as u8))
            .ok_or(LookupError::NotFound)
    }

    pub fn device(&self, id: DeviceId) -> Result<&FlashDevice<T>, LookupError> {
        self.check_initialized()?;
        self.devices.get(id.index()).ok_or(LookupError::NotFound)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Result<&mut FlashDevice<T>, LookupError> {
        self.check_initialized()?;
        self.devices.get_mut(id.index()).ok_or(LookupError::NotFound)
    }

    /// All registered devices, validated or not.
    pub fn devices(&self) -> &[FlashDevice<T>] {
        &self.devices
    }

    fn check_initialized(&self) -> Result<(), LookupError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LookupError::NotInitialized)
        }
    }
}
