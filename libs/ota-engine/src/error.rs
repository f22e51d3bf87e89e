use ota_state::record::UpdateState;

use crate::header::HeaderError;
use crate::partition::StorageError;
use crate::verify::{Mismatch, VerifyError};

/// Errors in the static flash configuration.
///
/// These indicate that the build itself cannot run safely, and are fatal at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// More devices or partitions than the fixed capacity allows.
    TooManyEntries,
    /// A device or partition without a name.
    EmptyName,
    /// Two devices share the same name.
    DuplicateDevice(&'static str),
    /// Devices can not be registered after [crate::FlashRegistry::initialize].
    RegistrySealed,
    /// Device capacity is zero, not a multiple of the erase size or exceeds the 32 bit address space.
    BadCapacity(&'static str),
    /// Read or write size of the device does not divide its erase size or the engine's transfer sizes.
    BadGranularity(&'static str),
    /// The layout was validated against a registry that has not been initialized.
    RegistryNotInitialized,
    /// Two partitions share the same name.
    DuplicatePartition(&'static str),
    /// A partition refers to a device that is not registered.
    UnknownDevice {
        partition: &'static str,
        device: &'static str,
    },
    /// A partition of zero length.
    EmptyPartition(&'static str),
    /// A partition ends beyond the capacity of its device.
    ExceedsCapacity(&'static str),
    /// Two partitions on the same device overlap.
    Overlap(&'static str, &'static str),
    /// A partition the engine requires is not part of the table.
    MissingPartition(&'static str),
    /// A partition that is erased in place does not start and end on an erase boundary.
    Misaligned(&'static str),
    /// The backup partition is smaller than the application partition.
    BackupTooSmall,
    /// Application, download and backup partitions must all be different.
    RolesNotDistinct,
    /// The record partition needs at least two pages whose size is a multiple of the record size.
    RecordRegionTooSmall,
    /// The application partition name does not fit in an update record.
    NameTooLong(&'static str),
}

/// Errors yielded when looking up devices or partitions by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LookupError {
    /// The registry was used before [crate::FlashRegistry::initialize] succeeded.
    NotInitialized,
    NotFound,
}

/// Errors yielded by the [crate::UpdateEngine].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    Config(ConfigError),
    Lookup(LookupError),
    /// The staged image does not match its declared length or digest.
    Integrity(Mismatch),
    /// The image header in the download partition is not usable.
    Header(HeaderError),
    /// The operation is not allowed in the current [UpdateState].
    InvalidState(UpdateState),
    /// The image targets a partition other than the application partition.
    UnsupportedTarget,
    /// The staged image does not start on a read and write boundary.
    UnalignedImage,
    /// Flash contents differ from what was just written to the named partition.
    ReadbackFailed(&'static str),
    /// A rollback was required, but no valid backup is recorded.
    NoBackup,
    /// The update record journal failed.
    Journal(ota_state::flash::Error<StorageError<E>>),
    /// The underlying flash device failed.
    Storage(StorageError<E>),
}

/// Coarse classification of an [Error], loggable without knowing the flash error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    Config,
    Lookup,
    Integrity,
    Header,
    InvalidState,
    UnsupportedTarget,
    UnalignedImage,
    ReadbackFailed,
    NoBackup,
    Journal,
    Storage,
}

impl<E> Error<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Lookup(_) => ErrorKind::Lookup,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Header(_) => ErrorKind::Header,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::UnsupportedTarget => ErrorKind::UnsupportedTarget,
            Error::UnalignedImage => ErrorKind::UnalignedImage,
            Error::ReadbackFailed(_) => ErrorKind::ReadbackFailed,
            Error::NoBackup => ErrorKind::NoBackup,
            Error::Journal(_) => ErrorKind::Journal,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl<E> From<ConfigError> for Error<E> {
    fn from(value: ConfigError) -> Self {
        Error::Config(value)
    }
}

impl<E> From<LookupError> for Error<E> {
    fn from(value: LookupError) -> Self {
        Error::Lookup(value)
    }
}

impl<E> From<Mismatch> for Error<E> {
    fn from(value: Mismatch) -> Self {
        Error::Integrity(value)
    }
}

impl<E> From<HeaderError> for Error<E> {
    fn from(value: HeaderError) -> Self {
        Error::Header(value)
    }
}

impl<E> From<StorageError<E>> for Error<E> {
    fn from(value: StorageError<E>) -> Self {
        Error::Storage(value)
    }
}

impl<E> From<ota_state::flash::Error<StorageError<E>>> for Error<E> {
    fn from(value: ota_state::flash::Error<StorageError<E>>) -> Self {
        Error::Journal(value)
    }
}

impl<E> From<VerifyError<StorageError<E>>> for Error<E> {
    fn from(value: VerifyError<StorageError<E>>) -> Self {
        match value {
            VerifyError::Mismatch(mismatch) => Error::Integrity(mismatch),
            VerifyError::Flash(e) => Error::Storage(e),
        }
    }
}
