//! Test device with the reference layout: a 64 KiB bootloader followed by
//! 512 KiB application, download and backup partitions on one NOR flash.

use core::ops::Range;
use std::vec::Vec;

use ota_state::digest::Digest;
use ota_state::flash::mock::MockFlashBase;
use ota_state::record::{PartitionName, UpdateRecord, RECORD_SIZE};

use crate::partition::{PartitionEntry, PartitionTable};
use crate::registry::FlashRegistry;
use crate::verify::StagedImage;

/// 403 pages of 4 KiB.
pub type Flash = MockFlashBase<403, 4, 1024>;

pub const KIB: u32 = 1024;
pub const BOOTLOADER: u32 = 0x0;
pub const APP: u32 = 0x1_0000;
pub const DOWNLOAD: u32 = 0x9_0000;
pub const BACKUP: u32 = 0x11_0000;
pub const BOOTLOADER_CRC: u32 = 0x19_0000;
pub const RECORD: u32 = 0x19_1000;

pub const BOOTLOADER_LEN: u32 = 64 * KIB;
pub const PARTITION_LEN: u32 = 512 * KIB;
pub const RECORD_LEN: u32 = 0x2000;

pub const ENTRIES: [PartitionEntry; 6] = [
    PartitionEntry::new("bootloader", "spi0", BOOTLOADER, BOOTLOADER_LEN),
    PartitionEntry::new("app", "spi0", APP, PARTITION_LEN),
    PartitionEntry::new("download", "spi0", DOWNLOAD, PARTITION_LEN),
    PartitionEntry::new("backup", "spi0", BACKUP, PARTITION_LEN),
    PartitionEntry::new("bootloader_crc", "spi0", BOOTLOADER_CRC, 0x1000),
    PartitionEntry::new("ota_record", "spi0", RECORD, RECORD_LEN),
];

pub fn range(offset: u32, len: u32) -> Range<usize> {
    offset as usize..(offset + len) as usize
}

/// Deterministic pseudo random bytes.
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Contents of the application partition before any update.
pub fn legacy_app() -> Vec<u8> {
    pattern(2, PARTITION_LEN as usize)
}

pub fn bootloader() -> Vec<u8> {
    pattern(1, 48 * KIB as usize)
}

/// A device with a bootloader and the legacy application, everything else erased.
pub fn flash() -> Flash {
    let mut flash = Flash::new(None, true);
    let bytes = flash.as_bytes_mut();
    let bootloader = bootloader();
    bytes[..bootloader.len()].copy_from_slice(&bootloader);
    bytes[range(APP, PARTITION_LEN)].copy_from_slice(&legacy_app());
    flash
}

/// Place bytes into the download partition, as the host application would.
pub fn write_download(flash: &mut Flash, offset: u32, data: &[u8]) {
    flash.as_bytes_mut()[range(DOWNLOAD + offset, data.len() as u32)].copy_from_slice(data);
}

pub fn registry(flash: Flash) -> FlashRegistry<Flash> {
    let mut registry = FlashRegistry::new();
    registry.register("spi0", flash).unwrap();
    registry.initialize().unwrap();
    registry
}

pub fn table(registry: &FlashRegistry<Flash>) -> PartitionTable {
    PartitionTable::validate_layout(&ENTRIES, registry).unwrap()
}

/// Device with `image` written to the start of the download partition.
pub fn setup(image: &[u8]) -> (FlashRegistry<Flash>, PartitionTable) {
    let mut flash = flash();
    write_download(&mut flash, 0, image);
    let registry = registry(flash);
    let table = table(&registry);
    (registry, table)
}

pub fn mock(registry: &FlashRegistry<Flash>) -> &Flash {
    let id = registry.find("spi0").unwrap();
    registry.device(id).unwrap().flash()
}

pub fn mock_mut(registry: &mut FlashRegistry<Flash>) -> &mut Flash {
    let id = registry.find("spi0").unwrap();
    registry.device_mut(id).unwrap().flash_mut()
}

pub fn staged(offset: u32, image: &[u8]) -> StagedImage {
    StagedImage {
        target: PartitionName::new("app").unwrap(),
        offset,
        len: image.len() as u32,
        digest: Digest::of(image),
    }
}

/// Every valid record in the journal, in the order written.
///
/// Only meaningful as long as the journal has not wrapped around.
pub fn journal(flash: &Flash) -> Vec<UpdateRecord> {
    flash.as_bytes()[range(RECORD, RECORD_LEN)]
        .chunks_exact(RECORD_SIZE)
        .filter_map(|chunk| UpdateRecord::try_from_bytes(chunk.try_into().unwrap()).ok())
        .collect()
}

/// Overwrite the last four bytes of `data` so that its digest becomes `target`.
///
/// A CRC is affine: flipping a bit changes the result by a value that only depends
/// on the distance of that bit to the end of the message. Solve for the tail bits.
pub fn force_digest(data: &mut [u8], target: Digest) {
    let tail = data.len() - 4;
    data[tail..].fill(0);

    let mut wanted = Digest::of(data).0 ^ target.0;
    let zero = Digest::of(&[0u8; 4]).0;

    // (effect on the digest, tail bits to flip)
    let mut rows: Vec<(u32, u32)> = (0..32)
        .map(|bit| {
            let flip = 1u32 << bit;
            (Digest::of(&flip.to_le_bytes()).0 ^ zero, flip)
        })
        .collect();

    let mut solution = 0u32;
    for bit in (0..32).rev() {
        let pivot = rows.iter().position(|(effect, _)| effect >> bit & 1 == 1).unwrap();
        let (effect, flip) = rows.swap_remove(pivot);

        for row in rows.iter_mut() {
            if row.0 >> bit & 1 == 1 {
                row.0 ^= effect;
                row.1 ^= flip;
            }
        }

        if wanted >> bit & 1 == 1 {
            wanted ^= effect;
            solution ^= flip;
        }
    }

    data[tail..].copy_from_slice(&solution.to_le_bytes());
}

mod tests {
    use super::*;

    #[test]
    fn forced_digest() {
        for target in [0xabcd_1234, 0, u32::MAX] {
            let mut data = pattern(7, 1000);
            force_digest(&mut data, Digest(target));
            assert_eq!(Digest::of(&data), Digest(target));
        }
    }
}
