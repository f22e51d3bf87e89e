use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::digest::Digest;

/// Size in bytes of a serialized [UpdateRecord].
pub const RECORD_SIZE: usize = 128;

/// Format version written into every record.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum length of a partition name stored in a record.
pub const NAME_LEN: usize = 16;

/// Maximum length of a firmware version string.
pub const VERSION_LEN: usize = 24;

const FLAG_BACKUP_VALID: u8 = 0b1;
const CRC_OFFSET: usize = RECORD_SIZE - 4;

/// Position of an update cycle.
///
/// `Committing` is the crash-recovery anchor: it is persisted before the
/// application partition is touched and only replaced once the new image
/// has been read back successfully.
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "_test", derive(arbitrary::Arbitrary))]
#[repr(u8)]
pub enum UpdateState {
    /// No update in progress.
    Idle = 0,
    /// The host application finished writing an image into the staging partition.
    Staged = 1,
    /// The staged image is being checked.
    Verifying = 2,
    /// The staged image matches its declared digest.
    VerifiedOk = 3,
    /// The staged image did not match its declared length or digest.
    VerifyFailed = 4,
    /// The application partition is being overwritten.
    Committing = 5,
    /// The new image is live.
    Committed = 6,
}

/// How the most recent cycle ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "_test", derive(arbitrary::Arbitrary))]
#[repr(u8)]
pub enum Outcome {
    None = 0,
    Committed = 1,
    VerifyFailed = 2,
    /// Preserving the current application into the backup partition failed.
    BackupFailed = 3,
    /// An interrupted commit was undone by restoring the backup.
    RolledBack = 4,
    /// The staged image was cancelled before commit.
    Discarded = 5,
}

#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseResult {
    /// Nor flash entry yet to be written.
    Unset,
    /// Record is torn, corrupted or of an unknown format.
    Invalid,
}

/// Fixed width, NUL padded partition name.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PartitionName([u8; NAME_LEN]);

impl PartitionName {
    /// Yields `None` when the name is empty, too long or contains a NUL byte.
    pub fn new(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_LEN || bytes.contains(&0) {
            return None;
        }

        let mut data = [0u8; NAME_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(PartitionName(data))
    }

    fn try_from_bytes(data: [u8; NAME_LEN]) -> Option<Self> {
        let len = data.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        if len == 0 || data[len..].iter().any(|b| *b != 0) {
            return None;
        }
        core::str::from_utf8(&data[..len]).ok()?;
        Some(PartitionName(data))
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        // Contents are validated as utf-8 on construction.
        core::str::from_utf8(&self.0[..len]).unwrap_or("")
    }

    pub fn as_bytes(&self) -> &[u8; NAME_LEN] {
        &self.0
    }
}

impl core::fmt::Debug for PartitionName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self.as_str(), f)
    }
}

impl core::fmt::Display for PartitionName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PartitionName {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=str}", self.as_str())
    }
}

#[cfg(feature = "_test")]
impl arbitrary::Arbitrary<'_> for PartitionName {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let name = *u.choose(&["app", "download", "backup", "bootloader"])?;
        Ok(PartitionName::new(name).unwrap())
    }
}

/// Fixed width, NUL padded firmware version string. May be empty.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareVersion([u8; VERSION_LEN]);

impl FirmwareVersion {
    /// Yields `None` when the version is too long or contains a NUL byte.
    pub fn new(version: &str) -> Option<Self> {
        let bytes = version.as_bytes();
        if bytes.len() > VERSION_LEN || bytes.contains(&0) {
            return None;
        }

        let mut data = [0u8; VERSION_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(FirmwareVersion(data))
    }

    pub fn try_from_bytes(data: [u8; VERSION_LEN]) -> Option<Self> {
        let len = data.iter().position(|b| *b == 0).unwrap_or(VERSION_LEN);
        if data[len..].iter().any(|b| *b != 0) {
            return None;
        }
        core::str::from_utf8(&data[..len]).ok()?;
        Some(FirmwareVersion(data))
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|b| *b == 0).unwrap_or(VERSION_LEN);
        core::str::from_utf8(&self.0[..len]).unwrap_or("")
    }

    pub fn as_bytes(&self) -> &[u8; VERSION_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl core::fmt::Debug for FirmwareVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self.as_str(), f)
    }
}

impl core::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for FirmwareVersion {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=str}", self.as_str())
    }
}

#[cfg(feature = "_test")]
impl arbitrary::Arbitrary<'_> for FirmwareVersion {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let version = *u.choose(&["", "1.0.0", "2.0.1-rc1", "0123456789abcdef01234567"])?;
        Ok(FirmwareVersion::new(version).unwrap())
    }
}

/// The staged image an update cycle is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "_test", derive(arbitrary::Arbitrary))]
pub struct ImageInfo {
    /// Offset of the image body inside the staging partition.
    pub offset: u32,
    /// Declared image length in bytes.
    pub len: u32,
    /// Declared (and later verified) digest over `len` bytes.
    pub digest: Digest,
    /// Build timestamp from the image header, zero when staged without one.
    pub timestamp: u32,
    /// Firmware version from the image header, empty when staged without one.
    pub version: FirmwareVersion,
}

/// Copy of the previous application image in the backup partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "_test", derive(arbitrary::Arbitrary))]
pub struct BackupInfo {
    pub len: u32,
    pub digest: Digest,
}

/// Update state record as stored in the record journal.
///
/// Layout (little endian):
///
/// | offset | field |
/// |--------|-------|
/// | 0      | format version |
/// | 1      | [UpdateState] |
/// | 2      | flags, bit 0 set if `backup` is valid |
/// | 3      | [Outcome] |
/// | 4..8   | attempt counter |
/// | 8..20  | [ImageInfo] offset, length, digest |
/// | 20..28 | [BackupInfo] length, digest |
/// | 28..44 | target partition name |
/// | 44..48 | [ImageInfo] build timestamp |
/// | 48..72 | [ImageInfo] firmware version, NUL padded |
/// | 72..124 | reserved |
/// | 124..128 | CRC32 over bytes 0..124 |
///
/// An all `0xff` record is never valid, as the version byte would be `0xff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "_test", derive(arbitrary::Arbitrary))]
pub struct UpdateRecord {
    pub state: UpdateState,
    pub outcome: Outcome,
    /// Failed attempts since the last successful commit.
    pub attempts: u32,
    /// Partition the staged image is destined for.
    pub target: PartitionName,
    pub image: ImageInfo,
    pub backup: Option<BackupInfo>,
}

impl UpdateRecord {
    /// An `Idle` record without history.
    pub fn idle(target: PartitionName) -> Self {
        Self {
            state: UpdateState::Idle,
            outcome: Outcome::None,
            attempts: 0,
            target,
            image: ImageInfo::default(),
            backup: None,
        }
    }

    pub fn with_state(&self, state: UpdateState) -> Self {
        Self { state, ..*self }
    }

    pub fn with_outcome(&self, state: UpdateState, outcome: Outcome) -> Self {
        Self {
            state,
            outcome,
            ..*self
        }
    }

    /// Same record with the attempt counter bumped, saturating.
    pub fn with_failed_attempt(&self, state: UpdateState, outcome: Outcome) -> Self {
        Self {
            state,
            outcome,
            attempts: self.attempts.saturating_add(1),
            ..*self
        }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut data = [0u8; RECORD_SIZE];
        data[0] = FORMAT_VERSION;
        data[1] = self.state.into();
        data[2] = if self.backup.is_some() { FLAG_BACKUP_VALID } else { 0 };
        data[3] = self.outcome.into();
        data[4..8].copy_from_slice(&self.attempts.to_le_bytes());
        data[8..12].copy_from_slice(&self.image.offset.to_le_bytes());
        data[12..16].copy_from_slice(&self.image.len.to_le_bytes());
        data[16..20].copy_from_slice(&self.image.digest.to_le_bytes());
        if let Some(backup) = &self.backup {
            data[20..24].copy_from_slice(&backup.len.to_le_bytes());
            data[24..28].copy_from_slice(&backup.digest.to_le_bytes());
        }
        data[28..44].copy_from_slice(self.target.as_bytes());
        data[44..48].copy_from_slice(&self.image.timestamp.to_le_bytes());
        data[48..72].copy_from_slice(self.image.version.as_bytes());

        let crc = Digest::of(&data[..CRC_OFFSET]);
        data[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        data
    }

    pub fn try_from_bytes(data: &[u8; RECORD_SIZE]) -> Result<Self, ParseResult> {
        if data.iter().all(|b| *b == 0xff) {
            return Err(ParseResult::Unset);
        }

        if Digest::of(&data[..CRC_OFFSET]) != Digest::from_le_bytes(word(data, CRC_OFFSET)) {
            return Err(ParseResult::Invalid);
        }

        if data[0] != FORMAT_VERSION || data[2] & !FLAG_BACKUP_VALID != 0 {
            return Err(ParseResult::Invalid);
        }

        let state = UpdateState::try_from(data[1]).map_err(|_| ParseResult::Invalid)?;
        let outcome = Outcome::try_from(data[3]).map_err(|_| ParseResult::Invalid)?;

        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&data[28..44]);
        let target = PartitionName::try_from_bytes(name).ok_or(ParseResult::Invalid)?;

        let mut version = [0u8; VERSION_LEN];
        version.copy_from_slice(&data[48..72]);
        let version = FirmwareVersion::try_from_bytes(version).ok_or(ParseResult::Invalid)?;

        let backup = (data[2] & FLAG_BACKUP_VALID != 0).then(|| BackupInfo {
            len: u32::from_le_bytes(word(data, 20)),
            digest: Digest::from_le_bytes(word(data, 24)),
        });

        Ok(Self {
            state,
            outcome,
            attempts: u32::from_le_bytes(word(data, 4)),
            target,
            image: ImageInfo {
                offset: u32::from_le_bytes(word(data, 8)),
                len: u32::from_le_bytes(word(data, 12)),
                digest: Digest::from_le_bytes(word(data, 16)),
                timestamp: u32::from_le_bytes(word(data, 44)),
                version,
            },
            backup,
        })
    }
}

fn word(data: &[u8; RECORD_SIZE], offset: usize) -> [u8; 4] {
    [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]
}
