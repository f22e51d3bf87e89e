//! Headers stored in flash next to the images they describe.

use ota_state::digest::Digest;
use ota_state::record::{FirmwareVersion, PartitionName, NAME_LEN, VERSION_LEN};

use crate::verify::StagedImage;

/// Size in bytes of a serialized [ImageHeader].
pub const HEADER_SIZE: usize = 64;

pub const HEADER_MAGIC: [u8; 4] = *b"OTA1";

pub const HEADER_VERSION: u16 = 1;

/// Body is encrypted. Not supported by the engine.
pub const ALGORITHM_ENCRYPTED: u16 = 0x0001;

/// Body is compressed. Not supported by the engine.
pub const ALGORITHM_COMPRESSED: u16 = 0x0100;

const CRC_OFFSET: usize = HEADER_SIZE - 4;

/// Size in bytes of a serialized [BootloaderShadow].
pub const SHADOW_SIZE: usize = 8;

/// Errors yielded when parsing an [ImageHeader].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderError {
    BadMagic,
    BadChecksum,
    UnsupportedVersion(u16),
    /// The body is compressed or encrypted.
    UnsupportedAlgorithm(u16),
    /// The target partition name is empty, too long or not UTF-8.
    BadName,
    /// The version string is too long or not UTF-8.
    BadVersionString,
}

/// Header of a packaged firmware image.
///
/// Layout (little endian):
///
/// | offset | field |
/// |--------|-------|
/// | 0..4   | magic `OTA1` |
/// | 4..6   | header format version |
/// | 6..8   | algorithm flags |
/// | 8..12  | build timestamp |
/// | 12..28 | target partition name, NUL padded |
/// | 28..52 | firmware version, NUL padded |
/// | 52..56 | body length |
/// | 56..60 | body CRC32 |
/// | 60..64 | CRC32 over bytes 0..60 |
///
/// The body directly follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageHeader {
    pub algorithm: u16,
    pub timestamp: u32,
    pub target: PartitionName,
    pub version: FirmwareVersion,
    pub body_len: u32,
    pub body_digest: Digest,
}

impl ImageHeader {
    /// Header for a plain body.
    pub fn new(
        target: PartitionName,
        version: &str,
        timestamp: u32,
        body_len: u32,
        body_digest: Digest,
    ) -> Result<Self, HeaderError> {
        let version = FirmwareVersion::new(version).ok_or(HeaderError::BadVersionString)?;

        Ok(Self {
            algorithm: 0,
            timestamp,
            target,
            version,
            body_len,
            body_digest,
        })
    }

    /// Header describing `body`.
    pub fn for_body(target: PartitionName, version: &str, timestamp: u32, body: &[u8]) -> Result<Self, HeaderError> {
        Self::new(target, version, timestamp, body.len() as u32, Digest::of(body))
    }

    pub fn version_str(&self) -> &str {
        self.version.as_str()
    }

    /// The body as seen from the start of the partition holding this header.
    pub fn staged_image(&self) -> StagedImage {
        StagedImage {
            target: self.target,
            offset: HEADER_SIZE as u32,
            len: self.body_len,
            digest: self.body_digest,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut data = [0u8; HEADER_SIZE];
        data[0..4].copy_from_slice(&HEADER_MAGIC);
        data[4..6].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        data[6..8].copy_from_slice(&self.algorithm.to_le_bytes());
        data[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        data[12..28].copy_from_slice(self.target.as_bytes());
        data[28..52].copy_from_slice(self.version.as_bytes());
        data[52..56].copy_from_slice(&self.body_len.to_le_bytes());
        data[56..60].copy_from_slice(&self.body_digest.to_le_bytes());

        let crc = Digest::of(&data[..CRC_OFFSET]);
        data[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        data
    }

    pub fn parse(data: &[u8; HEADER_SIZE]) -> Result<Self, HeaderError> {
        if data[0..4] != HEADER_MAGIC {
            return Err(HeaderError::BadMagic);
        }

        if Digest::of(&data[..CRC_OFFSET]) != Digest::from_le_bytes(word(data, CRC_OFFSET)) {
            return Err(HeaderError::BadChecksum);
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != HEADER_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let algorithm = u16::from_le_bytes([data[6], data[7]]);
        if algorithm != 0 {
            return Err(HeaderError::UnsupportedAlgorithm(algorithm));
        }

        let target = str_field(&data[12..12 + NAME_LEN])
            .and_then(PartitionName::new)
            .ok_or(HeaderError::BadName)?;

        let mut version = [0u8; VERSION_LEN];
        version.copy_from_slice(&data[28..52]);
        let version = FirmwareVersion::try_from_bytes(version).ok_or(HeaderError::BadVersionString)?;

        Ok(Self {
            algorithm,
            timestamp: u32::from_le_bytes(word(data, 8)),
            target,
            version,
            body_len: u32::from_le_bytes(word(data, 52)),
            body_digest: Digest::from_le_bytes(word(data, 56)),
        })
    }
}

/// Length and digest of the bootloader, kept in its own small partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootloaderShadow {
    pub len: u32,
    pub digest: Digest,
}

impl BootloaderShadow {
    pub fn to_bytes(&self) -> [u8; SHADOW_SIZE] {
        let mut data = [0u8; SHADOW_SIZE];
        data[0..4].copy_from_slice(&self.len.to_le_bytes());
        data[4..8].copy_from_slice(&self.digest.to_le_bytes());
        data
    }

    /// Yields `None` for an erased shadow.
    pub fn parse(data: &[u8; SHADOW_SIZE]) -> Option<Self> {
        if data.iter().all(|b| *b == 0xff) {
            return None;
        }

        Some(Self {
            len: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            digest: Digest::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// NUL padded UTF-8 field.
fn str_field(data: &[u8]) -> Option<&str> {
    let len = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    if data[len..].iter().any(|b| *b != 0) {
        return None;
    }
    core::str::from_utf8(&data[..len]).ok()
}

fn word(data: &[u8; HEADER_SIZE], offset: usize) -> [u8; 4] {
    [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]
}
