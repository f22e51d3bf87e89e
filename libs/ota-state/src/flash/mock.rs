use core::fmt::Display;
use core::ops::Range;
use std::vec::Vec;

use embedded_storage_async::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

/// In memory NOR flash for tests and simulations.
///
/// Behaves like real NOR: erase sets bytes to `0xff`, a write can only clear bits
/// and every word can be written once between erases. Power loss is simulated
/// by `bytes_until_shutoff`, which counts every byte erased or written.
///
/// `PAGES` is the size of a device made by [Self::new], [Self::from_bytes] takes
/// the size of its contents instead.
#[derive(Debug, Clone)]
pub struct MockFlashBase<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> {
    data: Vec<u8>,
    /// Words written since the last erase of their page.
    programmed: Vec<bool>,
    erases: Vec<u32>,
    /// Bytes erased or written so far.
    touched: u64,
    /// Bytes left before the power is cut. The cut itself clears the countdown
    /// unless `latch_shutoff` is set.
    pub bytes_until_shutoff: Option<u32>,
    /// Keep failing every erase and write after the cut, until [Self::remove_shutoff].
    pub latch_shutoff: bool,
    /// Panic on write buffers that are not 4 byte aligned, like some flash drivers do.
    pub alignment_check: bool,
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> Default
    for MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    fn default() -> Self {
        Self::new(None, true)
    }
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize>
    MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    const PAGE_BYTES: usize = PAGE_WORDS * BYTES_PER_WORD;

    /// A fully erased device of `PAGES` pages.
    pub fn new(bytes_until_shutoff: Option<u32>, alignment_check: bool) -> Self {
        Self {
            bytes_until_shutoff,
            alignment_check,
            ..Self::from_bytes(vec![0xff; PAGES * Self::PAGE_BYTES])
        }
    }

    /// A device holding `data`, such as a dump of another device.
    ///
    /// Every word that is not erased counts as written.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let programmed = data
            .chunks(BYTES_PER_WORD)
            .map(|word| word.iter().any(|b| *b != 0xff))
            .collect();
        let pages = data.len().div_ceil(Self::PAGE_BYTES);

        Self {
            data,
            programmed,
            erases: vec![0; pages],
            touched: 0,
            bytes_until_shutoff: None,
            latch_shutoff: false,
            alignment_check: true,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw access that bypasses the NOR write rules, to preload or corrupt contents.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Number of times `page` has been erased.
    pub fn erase_count(&self, page: usize) -> u32 {
        self.erases[page]
    }

    /// Sum of the erase counts of every page overlapping `range`.
    pub fn erase_count_in(&self, range: Range<usize>) -> u32 {
        let pages = range.start / Self::PAGE_BYTES..range.end.div_ceil(Self::PAGE_BYTES);
        self.erases[pages].iter().sum()
    }

    /// Total bytes erased or written, excluding the ones refused by a power cut.
    pub fn bytes_touched(&self) -> u64 {
        self.touched
    }

    pub fn remove_shutoff(&mut self) {
        self.bytes_until_shutoff = None;
    }

    fn range(&self, offset: u32, len: usize) -> Result<Range<usize>, MockFlashError> {
        let start = offset as usize;
        if !start.is_multiple_of(BYTES_PER_WORD) {
            return Err(MockFlashError::NotAligned);
        }
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(MockFlashError::OutOfBounds),
        }
    }

    /// Spend one byte of the power budget on `address`.
    fn tick(&mut self, address: usize, operation: Operation) -> Result<(), MockFlashError> {
        match self.bytes_until_shutoff {
            None => {}
            Some(0) => {
                if !self.latch_shutoff {
                    self.bytes_until_shutoff = None;
                }
                return Err(MockFlashError::EarlyShutoff(address as u32, operation));
            }
            Some(left) => self.bytes_until_shutoff = Some(left - 1),
        }
        self.touched += 1;
        Ok(())
    }
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> ErrorType
    for MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    type Error = MockFlashError;
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> ReadNorFlash
    for MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    const READ_SIZE: usize = BYTES_PER_WORD;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(
            bytes.len().is_multiple_of(BYTES_PER_WORD),
            "reads must be a multiple of READ_SIZE"
        );

        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<const PAGES: usize, const BYTES_PER_WORD: usize, const PAGE_WORDS: usize> NorFlash
    for MockFlashBase<PAGES, BYTES_PER_WORD, PAGE_WORDS>
{
    const WRITE_SIZE: usize = BYTES_PER_WORD;
    const ERASE_SIZE: usize = Self::PAGE_BYTES;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from <= to);
        let (from, to) = (from as usize, to as usize);

        if to > self.data.len() {
            return Err(MockFlashError::OutOfBounds);
        }
        if !from.is_multiple_of(Self::PAGE_BYTES) || !to.is_multiple_of(Self::PAGE_BYTES) {
            return Err(MockFlashError::NotAligned);
        }

        for page in from / Self::PAGE_BYTES..to / Self::PAGE_BYTES {
            self.erases[page] += 1;

            let start = page * Self::PAGE_BYTES;
            for address in start..start + Self::PAGE_BYTES {
                self.tick(address, Operation::Erase)?;
                self.data[address] = 0xff;
                self.programmed[address / BYTES_PER_WORD] = false;
            }
        }

        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;

        if self.alignment_check {
            assert!(
                (bytes.as_ptr() as usize).is_multiple_of(4),
                "write buffers must be aligned to 4 bytes"
            );
        }
        assert!(
            bytes.len().is_multiple_of(BYTES_PER_WORD),
            "writes must be a multiple of WRITE_SIZE"
        );

        for (address, byte) in range.zip(bytes) {
            self.tick(address, Operation::Write)?;

            if address.is_multiple_of(BYTES_PER_WORD) {
                let word = address / BYTES_PER_WORD;
                if self.programmed[word] {
                    return Err(MockFlashError::NotWritable(address as u32));
                }
                self.programmed[word] = true;
            }

            self.data[address] &= byte;
        }

        Ok(())
    }
}

/// Errors reported by mock flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFlashError {
    OutOfBounds,
    NotAligned,
    /// The word at this address was already written since its last erase.
    NotWritable(u32),
    /// The power was cut while touching this address.
    EarlyShutoff(u32, Operation),
}

impl Display for MockFlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl NorFlashError for MockFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            MockFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            MockFlashError::NotAligned => NorFlashErrorKind::NotAligned,
            MockFlashError::NotWritable(_) | MockFlashError::EarlyShutoff(..) => NorFlashErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Write,
    Erase,
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flash = MockFlashBase<2, 4, 16>;

    #[test]
    fn word_is_written_once_per_erase() {
        let mut flash = Flash::new(None, false);
        embassy_futures::block_on(async {
            flash.write(8, &[0xf0; 4]).await.unwrap();
            assert_eq!(flash.write(8, &[0x0f; 4]).await, Err(MockFlashError::NotWritable(8)));
            assert_eq!(&flash.as_bytes()[8..12], &[0xf0; 4]);

            // Neighbouring words and other pages are unaffected.
            flash.write(12, &[0x0f; 4]).await.unwrap();
            flash.write(64, &[0x00; 4]).await.unwrap();

            flash.erase(0, 64).await.unwrap();
            flash.write(8, &[0x0f; 4]).await.unwrap();
            assert_eq!(&flash.as_bytes()[8..12], &[0x0f; 4]);
            assert_eq!(flash.erase_count(0), 1);
            assert_eq!(flash.erase_count(1), 0);
        });
    }

    #[test]
    fn power_cut_stops_at_budget() {
        let mut flash = Flash::new(Some(6), false);
        embassy_futures::block_on(async {
            assert_eq!(
                flash.write(0, &[0x00; 8]).await,
                Err(MockFlashError::EarlyShutoff(6, Operation::Write))
            );
            assert_eq!(&flash.as_bytes()[..8], &[0, 0, 0, 0, 0, 0, 0xff, 0xff]);

            // The cut clears the countdown.
            assert_eq!(flash.bytes_until_shutoff, None);
            flash.erase(0, 64).await.unwrap();
            assert_eq!(flash.bytes_touched(), 6 + 64);
        });
    }

    #[test]
    fn latched_power_cut_lasts() {
        let mut flash = Flash::new(Some(4), false);
        flash.latch_shutoff = true;
        embassy_futures::block_on(async {
            flash.write(0, &[0x00; 4]).await.unwrap();
            assert!(flash.write(4, &[0x00; 4]).await.is_err());
            assert!(flash.erase(64, 128).await.is_err());
            assert_eq!(flash.bytes_touched(), 4);

            flash.remove_shutoff();
            flash.erase(64, 128).await.unwrap();
        });
    }

    #[test]
    fn contents_count_as_written() {
        let mut data = std::vec![0xff; 128];
        data[4] = 0x7f;
        let mut flash = Flash::from_bytes(data);
        flash.alignment_check = false;
        assert_eq!(flash.capacity(), 128);

        embassy_futures::block_on(async {
            assert_eq!(flash.write(4, &[0x00; 4]).await, Err(MockFlashError::NotWritable(4)));
            flash.write(0, &[0x00; 4]).await.unwrap();
        });
    }
}
