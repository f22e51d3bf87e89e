//! NOR flash simulated in memory, persisted as a plain dump file.

use std::path::Path;

use anyhow::Context;
use ota_state::flash::mock::MockFlashBase;

/// Program unit of every simulated device.
pub const WORD_SIZE: usize = 4;

/// A device with erase pages of `PAGE_WORDS` words, sized by its dump.
///
/// Power cuts latch: once the budget is spent every erase and write fails until
/// [MockFlashBase::remove_shutoff], like a device that lost power for good.
pub type SimFlash<const PAGE_WORDS: usize> = MockFlashBase<0, WORD_SIZE, PAGE_WORDS>;

pub fn erased<const PAGE_WORDS: usize>(capacity: usize) -> SimFlash<PAGE_WORDS> {
    from_bytes(vec![0xFF; capacity])
}

pub fn from_bytes<const PAGE_WORDS: usize>(data: Vec<u8>) -> SimFlash<PAGE_WORDS> {
    let mut flash = SimFlash::from_bytes(data);
    flash.latch_shutoff = true;
    flash.alignment_check = false;
    flash
}

/// Read a dump of exactly `capacity` bytes, or start erased if there is none.
pub fn load<const PAGE_WORDS: usize>(path: &Path, capacity: usize) -> anyhow::Result<SimFlash<PAGE_WORDS>> {
    if !path.exists() {
        log::info!("No dump at {}, starting erased", path.display());
        return Ok(erased(capacity));
    }

    let data = std::fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
    if data.len() != capacity {
        return Err(anyhow::anyhow!(
            "Dump {} has {} bytes, expected {capacity}",
            path.display(),
            data.len()
        ));
    }
    Ok(from_bytes(data))
}

pub fn save<const PAGE_WORDS: usize>(flash: &SimFlash<PAGE_WORDS>, path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, flash.as_bytes()).with_context(|| format!("Could not write {}", path.display()))
}

/// Fail every erase or program after `bytes` more bytes were touched.
pub fn cut_power_after<const PAGE_WORDS: usize>(flash: &mut SimFlash<PAGE_WORDS>, bytes: u64) -> anyhow::Result<()> {
    let budget = u32::try_from(bytes).map_err(|_| anyhow::anyhow!("Cannot cut power after {bytes} bytes"))?;
    flash.bytes_until_shutoff = Some(budget);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_storage_async::nor_flash::{NorFlash, ReadNorFlash};
    use ota_state::flash::mock::MockFlashError;

    /// 4 KiB pages.
    type Flash = SimFlash<1024>;

    #[tokio::test]
    async fn dump_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spi0.bin");

        let mut flash: Flash = load(&path, 2 * 4096).unwrap();
        assert_eq!(flash.capacity(), 2 * 4096);
        flash.write(4096, &[0x12, 0x34, 0x56, 0x78]).await.unwrap();
        save(&flash, &path).unwrap();

        let mut reloaded: Flash = load(&path, 2 * 4096).unwrap();
        assert_eq!(reloaded.as_bytes(), flash.as_bytes());
        // Programmed words stay programmed across a reload.
        assert_eq!(
            reloaded.write(4096, &[0; 4]).await,
            Err(MockFlashError::NotWritable(4096))
        );

        assert!(load::<1024>(&path, 4096).is_err());
    }

    #[tokio::test]
    async fn geometry_is_enforced() {
        let mut flash: Flash = erased(4096);
        assert_eq!(flash.write(2, &[0; 4]).await, Err(MockFlashError::NotAligned));
        assert_eq!(flash.write(4096, &[0; 4]).await, Err(MockFlashError::OutOfBounds));
        assert_eq!(flash.erase(0, 1024).await, Err(MockFlashError::NotAligned));
        assert_eq!(flash.erase(0, 8192).await, Err(MockFlashError::OutOfBounds));
    }

    #[tokio::test]
    async fn power_stays_off_after_cut() {
        let mut flash: Flash = erased(2 * 4096);
        cut_power_after(&mut flash, 6).unwrap();

        assert!(flash.write(0, &[0; 8]).await.is_err());
        assert_eq!(&flash.as_bytes()[..8], &[0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert!(flash.erase(4096, 8192).await.is_err());
        assert_eq!(flash.bytes_touched(), 6);

        flash.remove_shutoff();
        flash.erase(0, 4096).await.unwrap();
        assert_eq!(flash.bytes_touched(), 6 + 4096);

        assert!(cut_power_after(&mut flash, u64::MAX).is_err());
    }
}
