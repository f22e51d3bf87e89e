#[cfg(any(test, feature = "_test"))]
pub mod mock;

use core::ops::Range;

use embedded_storage_async::nor_flash::NorFlash;

use crate::record::{ParseResult, UpdateRecord, RECORD_SIZE};

/// Errors yielded by the [FlashJournal].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// A storage medium has been passed that does not contain at least two pages.
    NotEnoughPages,

    /// The erase size of the storage medium is not a multiple of [RECORD_SIZE],
    /// which would let records straddle pages.
    PageNotRecordAligned,

    /// After writing the record a readback does not yield the same record.
    ///
    /// This indicates that something went wrong in the writing process, either on the bus
    /// or in the storage medium itself.
    ReadbackFailed,

    /// The underlying storage medium yielded an error.
    Other(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Error::Other(value)
    }
}

/// Byte buffer aligned to 4 bytes.
///
/// Some flash drivers require the source buffer of a write to be word aligned.
#[derive(Clone)]
#[repr(C, align(4))]
pub struct Aligned<const N: usize>(pub [u8; N]);

impl<const N: usize> Aligned<N> {
    pub const fn new() -> Self {
        Aligned([0u8; N])
    }
}

impl<const N: usize> Default for Aligned<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct RecordWithAddr {
    /// Actual value of the [UpdateRecord].
    record: UpdateRecord,
    /// Address of the [UpdateRecord].
    address: usize,
}

#[derive(Default)]
struct Cache {
    /// A copy of the last valid [UpdateRecord] on-disk.
    last_valid_record: Option<RecordWithAddr>,

    /// Address of the first empty slot for a record after the last valid one, containing only 0xff bytes.
    first_empty_slot: Option<usize>,
}

/// [UpdateRecord] journal backed by Non-Volatile Memory.
///
/// Records are appended; the last one that parses wins. A torn write therefore
/// never replaces the previous record.
pub struct FlashJournal<T> {
    /// Inner flash storage.
    inner: T,
    /// A in-ram cache of the record on disk and where to write the next record to.
    cache: Cache,
}

impl<T: NorFlash> FlashJournal<T> {
    const PAGE_SIZE: usize = T::ERASE_SIZE;

    /// Construct the FlashJournal given a storage device (or a partition).
    ///
    /// Will yield [Error::NotEnoughPages] if the partition does not contain at least 2 pages.
    pub async fn new<const N: usize>(mut inner: T) -> Result<Self, Error<T::Error>> {
        if Self::page_count(&inner) < 2 {
            return Err(Error::NotEnoughPages);
        }

        if !Self::PAGE_SIZE.is_multiple_of(RECORD_SIZE) {
            return Err(Error::PageNotRecordAligned);
        }

        let cache = Self::compute_cache::<N>(&mut inner).await?;
        Ok(Self { inner, cache })
    }

    /// Number of pages in the backing storage medium.
    fn page_count(inner: &T) -> usize {
        inner.capacity().div_ceil(Self::PAGE_SIZE)
    }

    /// Convert a memory address in the inner NVM to a page index number.
    fn address_to_page_i(address: usize) -> usize {
        address / Self::PAGE_SIZE
    }

    /// Walk through the entire NVM range, and find the last valid [UpdateRecord]
    /// and the first empty slot after it, if any.
    ///
    /// `BLOCK_SIZE` denotes the number of bytes that are read in a single batch
    /// and are analysed, before reading the next block.
    /// It needs to be a non-zero multiple of [RECORD_SIZE].
    async fn compute_cache<const BLOCK_SIZE: usize>(inner: &mut T) -> Result<Cache, T::Error> {
        defmt_or_log::assert!(BLOCK_SIZE >= RECORD_SIZE);
        defmt_or_log::assert!(BLOCK_SIZE.is_multiple_of(RECORD_SIZE));

        let mut buf = [0u8; BLOCK_SIZE];
        let block_count = inner.capacity().div_ceil(BLOCK_SIZE);

        let mut result = Cache::default();
        for block_i in 0..block_count {
            let block_start = block_i * BLOCK_SIZE;
            let block_end = (block_start + BLOCK_SIZE).min(inner.capacity());

            let slice = &mut buf[0..block_end - block_start];
            inner.read(block_start as u32, slice).await?;

            for (chunk_i, chunk) in slice.chunks_exact(RECORD_SIZE).enumerate() {
                let Ok(chunk) = <&[u8; RECORD_SIZE]>::try_from(chunk) else {
                    continue;
                };
                let address = block_start + chunk_i * RECORD_SIZE;
                match UpdateRecord::try_from_bytes(chunk) {
                    Ok(record) => {
                        result = Cache {
                            last_valid_record: Some(RecordWithAddr { record, address }),
                            first_empty_slot: None, // Reset if any.
                        };
                    }
                    Err(ParseResult::Unset) => {
                        // If not found an empty entry yet, we can record this one as the first one free.
                        if result.first_empty_slot.is_none() {
                            result.first_empty_slot = Some(address);
                        }
                    }
                    Err(ParseResult::Invalid) => {} // Torn or broken.
                }
            }
        }
        Ok(result)
    }

    /// Get the latest [UpdateRecord] contained in the [FlashJournal], if any.
    pub fn get(&self) -> Option<&UpdateRecord> {
        self.cache
            .last_valid_record
            .as_ref()
            .map(|RecordWithAddr { record, address: _ }| record)
    }

    /// Give back the storage medium.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Erase a range of pages as a single erase instruction to [NorFlash].
    async fn erase_pages(&mut self, page_range: Range<usize>) -> Result<(), T::Error> {
        let start = page_range.start * Self::PAGE_SIZE;
        let end = (page_range.end * Self::PAGE_SIZE).min(self.inner.capacity());
        self.inner.erase(start as u32, end as u32).await
    }

    async fn write_record(&mut self, address: usize, record: &UpdateRecord) -> Result<(), T::Error> {
        let buf = Aligned(record.to_bytes());
        self.inner.write(address as u32, &buf.0).await
    }

    /// Synchronize the latest [UpdateRecord] to the [FlashJournal].
    pub async fn set<const N: usize>(&mut self, record: &UpdateRecord) -> Result<(), Error<T::Error>> {
        // Check if the current record is identical.
        if self.get() == Some(record) {
            return Ok(());
        }

        // Write the new record somewhere.
        if let Some(first_empty_slot) = self.cache.first_empty_slot {
            // An empty slot is all `0xff`, so as [NorFlash] we can write to it directly.
            self.write_record(first_empty_slot, record).await?;
        } else if let Some(last_valid_record) = &self.cache.last_valid_record {
            // No empty slot left, so all pages have been written, or we are in a partially valid state.

            let page_i = Self::address_to_page_i(last_valid_record.address);
            if page_i > 0 {
                // Last valid record is not in the first page, so we can erase it freely. (typical happy flow)
                self.erase_pages(0..1).await?;

                self.write_record(0, record).await?;

                // Erase rest of pages, and the erasure of the page holding the old record validates the new one.
                // If this gets interrupted, the old record will remain the newest valid one.
                self.erase_pages(1..Self::page_count(&self.inner)).await?;
            } else {
                // Last valid record is in the first page, but the rest of the pages contain no free slot.

                // Erase the last pages, which is safe as our last record lives in the first page.
                let second_page_i = 1;
                self.erase_pages(second_page_i..Self::page_count(&self.inner)).await?;

                // Write the record to the first address in the second page, immediately becoming the newest valid one.
                let address = second_page_i * Self::PAGE_SIZE;
                self.write_record(address, record).await?;
            }
        } else {
            // No record is stored anywhere, and there are no empty slots, clear everything, write.
            self.inner.erase(0, self.inner.capacity() as u32).await?;
            self.write_record(0, record).await?;
        }

        // Re-compute the cache to check if the journal is valid.
        self.cache = Self::compute_cache::<N>(&mut self.inner).await?;

        // Check if the readback is successful.
        if self.get() == Some(record) {
            Ok(())
        } else {
            Err(Error::ReadbackFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::flash::mock::MockFlashBase;
    use crate::record::{BackupInfo, ImageInfo, Outcome, PartitionName, UpdateState};

    const STATES: [UpdateState; 7] = [
        UpdateState::Idle,
        UpdateState::Staged,
        UpdateState::Verifying,
        UpdateState::VerifiedOk,
        UpdateState::VerifyFailed,
        UpdateState::Committing,
        UpdateState::Committed,
    ];

    fn record(state: UpdateState, i: u32) -> UpdateRecord {
        UpdateRecord {
            state,
            outcome: Outcome::None,
            attempts: i % 3,
            target: PartitionName::new("app").unwrap(),
            image: ImageInfo {
                offset: 0,
                len: 1024 + i,
                digest: Digest(i.wrapping_mul(0x9e37_79b9)),
                ..ImageInfo::default()
            },
            backup: (i % 2 == 0).then_some(BackupInfo {
                len: 4096,
                digest: Digest(i),
            }),
        }
    }

    async fn test_journal(nvm: impl NorFlash, assert_empty: bool) -> Option<usize> {
        let mut journal = FlashJournal::new::<128>(nvm).await.unwrap();

        if assert_empty {
            assert!(journal.get().is_none());
        }

        {
            let record = record(UpdateState::Staged, 1);
            journal.set::<128>(&record).await.unwrap();
            assert_eq!(journal.get(), Some(&record));

            // Re-do the same operation.
            journal.set::<128>(&record).await.unwrap();
            assert_eq!(journal.get(), Some(&record));
        }

        // Write enough records to wrap around the journal several times.
        for i in 0..40 {
            for state in STATES {
                let record = record(state, i);
                journal.set::<128>(&record).await.unwrap();
                assert_eq!(journal.get(), Some(&record));
            }
        }

        journal.cache.first_empty_slot
    }

    #[test]
    fn journal_normal() {
        let mut mock: MockFlashBase<3, 4, 64> = MockFlashBase::new(None, true);
        embassy_futures::block_on(test_journal(&mut mock, true));
    }

    #[test]
    fn journal_garbage() {
        let mut mock: MockFlashBase<3, 4, 64> = MockFlashBase::new(None, true);
        embassy_futures::block_on(async {
            // Write garbage to pages 1 and 2.
            let bytes = Aligned([0xaa; 64]);
            mock.write(320, &bytes.0).await.unwrap();
            let valid_address = test_journal(&mut mock, true).await;

            // Insert broken record into what happens to be the next free slot.
            mock.write(valid_address.unwrap() as u32, &bytes.0).await.unwrap();

            test_journal(&mut mock, false).await;
        });
    }

    #[test]
    fn journal_too_small() {
        let mut mock: MockFlashBase<1, 4, 64> = MockFlashBase::new(None, true);
        embassy_futures::block_on(async {
            assert!(matches!(
                FlashJournal::new::<RECORD_SIZE>(&mut mock).await,
                Err(Error::NotEnoughPages)
            ));
        });
    }

    #[test]
    fn journal_page_not_record_aligned() {
        // 3 words of 4 bytes per page.
        let mut mock: MockFlashBase<2, 4, 3> = MockFlashBase::new(None, true);
        embassy_futures::block_on(async {
            assert!(matches!(
                FlashJournal::new::<RECORD_SIZE>(&mut mock).await,
                Err(Error::PageNotRecordAligned)
            ));
        });
    }

    #[test]
    fn journal_realistic() {
        // Use a realistic page count and size.
        let mut mock: MockFlashBase<2, 4, 1024> = MockFlashBase::new(None, true);
        embassy_futures::block_on(async {
            for i in 0..200 {
                for state in STATES {
                    let record = record(state, i);

                    // In practice the journal is re-opened on every boot.
                    let mut journal = FlashJournal::new::<1024>(&mut mock).await.unwrap();
                    journal.set::<128>(&record).await.unwrap();
                    assert_eq!(journal.get(), Some(&record));
                }
            }
        });
    }

    /// Cut the power at every possible byte of a sequence of writes, and check that after
    /// re-opening the journal either the old or the new record is current.
    #[test]
    fn journal_power_cut() {
        embassy_futures::block_on(async {
            for fail_at in 0..1500u32 {
                let mut mock: MockFlashBase<2, 4, 64> = MockFlashBase::new(Some(fail_at), true);
                let mut prev = None;

                for i in 0..12 {
                    let new = record(STATES[i as usize % STATES.len()], i);
                    let mut journal = FlashJournal::new::<RECORD_SIZE>(&mut mock).await.unwrap();

                    match journal.set::<RECORD_SIZE>(&new).await {
                        Ok(()) => prev = Some(new),
                        Err(Error::Other(_)) => {
                            drop(journal);
                            mock.remove_shutoff();

                            let journal = FlashJournal::new::<RECORD_SIZE>(&mut mock).await.unwrap();
                            let current = journal.get().copied();
                            assert!(current == prev || current == Some(new), "fail_at {fail_at}");
                            break;
                        }
                        Err(e) => panic!("Unexpected error {:?}", e),
                    }
                }
            }
        });
    }
}
