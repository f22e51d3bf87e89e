//! CRC32 image digest.
//!
//! The same checksum protects firmware images, the bootloader shadow and each
//! persisted [crate::record::UpdateRecord].

static CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Digest over a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "_test", derive(arbitrary::Arbitrary))]
pub struct Digest(pub u32);

impl Digest {
    /// Digest of a byte slice that is fully in memory.
    pub fn of(bytes: &[u8]) -> Self {
        Digest(CRC32.checksum(bytes))
    }

    pub const fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Digest(u32::from_le_bytes(bytes))
    }
}

impl From<u32> for Digest {
    fn from(value: u32) -> Self {
        Digest(value)
    }
}

impl core::fmt::Display for Digest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Streaming digest computation, fed one chunk at a time.
pub struct Hasher(crc::Digest<'static, u32>);

impl Hasher {
    pub fn new() -> Self {
        Hasher(CRC32.digest())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> Digest {
        Digest(self.0.finalize())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
