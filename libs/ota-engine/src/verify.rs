//! Image integrity checks over flash ranges.

use embedded_storage_async::nor_flash::ReadNorFlash;
use ota_state::digest::{Digest, Hasher};
use ota_state::flash::Aligned;
use ota_state::record::PartitionName;

/// Working buffer size for streaming flash contents.
///
/// Needs to be a multiple of the read and write size of every device used.
pub const CHUNK_SIZE: usize = 256;

/// An image the host application wrote into the download partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StagedImage {
    /// Partition the image is destined for.
    pub target: PartitionName,
    /// Start of the image inside the download partition.
    pub offset: u32,
    /// Declared length in bytes.
    pub len: u32,
    /// Declared digest over exactly `len` bytes.
    pub digest: Digest,
}

/// The flash contents do not match what was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mismatch {
    /// Declared length is zero or exceeds the bytes available in the partition.
    Length { declared: u32, available: u32 },
    Digest { expected: Digest, computed: Digest },
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerifyError<E> {
    Mismatch(Mismatch),
    /// The underlying flash yielded an error.
    Flash(E),
}

impl<E> From<Mismatch> for VerifyError<E> {
    fn from(value: Mismatch) -> Self {
        VerifyError::Mismatch(value)
    }
}

/// Compute the digest over `[offset, offset + len)`, one chunk at a time.
///
/// Reads are rounded up to the read size of the flash, but only `len` bytes are hashed.
pub async fn compute_digest<F: ReadNorFlash>(flash: &mut F, offset: u32, len: u32) -> Result<Digest, F::Error> {
    defmt_or_log::assert!(CHUNK_SIZE.is_multiple_of(F::READ_SIZE));

    let mut buf = Aligned::<CHUNK_SIZE>::new();
    let mut hasher = Hasher::new();

    let mut done = 0u32;
    while done < len {
        let n = ((len - done) as usize).min(CHUNK_SIZE);
        flash
            .read(offset + done, &mut buf.0[..n.next_multiple_of(F::READ_SIZE)])
            .await?;
        hasher.update(&buf.0[..n]);
        done += n as u32;
    }

    Ok(hasher.finalize())
}

/// Compare the digest over `[offset, offset + len)` to `expected`.
pub async fn check_digest<F: ReadNorFlash>(
    flash: &mut F,
    offset: u32,
    len: u32,
    expected: Digest,
) -> Result<(), VerifyError<F::Error>> {
    let computed = compute_digest(flash, offset, len).await.map_err(VerifyError::Flash)?;
    if computed != expected {
        return Err(Mismatch::Digest { expected, computed }.into());
    }
    Ok(())
}

/// Check a staged image against its declared length and digest.
///
/// The length is checked against the partition before anything is read,
/// so an oversized declaration never reads past the partition.
pub async fn verify<F: ReadNorFlash>(staging: &mut F, image: &StagedImage) -> Result<(), VerifyError<F::Error>> {
    let available = (staging.capacity() as u64).saturating_sub(image.offset as u64) as u32;
    if image.len == 0 || image.len > available {
        return Err(Mismatch::Length {
            declared: image.len,
            available,
        }
        .into());
    }

    check_digest(staging, image.offset, image.len, image.digest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionStorage, Region, StorageError};
    use crate::registry::FlashRegistry;
    use embedded_storage_async::nor_flash::NorFlash;
    use ota_state::flash::mock::MockFlashBase;

    type Flash = MockFlashBase<8, 4, 256>;

    fn region(offset: u32, len: u32) -> Region {
        let mut registry: FlashRegistry<Flash> = FlashRegistry::new();
        let device = registry.register("spi0", Flash::default()).unwrap();
        Region {
            name: "download",
            device,
            offset,
            len,
            erase_size: 1024,
        }
    }

    fn image(len: u32, digest: Digest) -> StagedImage {
        StagedImage {
            target: PartitionName::new("app").unwrap(),
            offset: 0,
            len,
            digest,
        }
    }

    fn data(len: usize) -> std::vec::Vec<u8> {
        (0..len).map(|i| (i * 31 + i / 7) as u8).collect()
    }

    #[test]
    fn digest_covers_exact_range() {
        let mut flash = Flash::default();
        let contents = data(1001);
        flash.as_bytes_mut()[..1001].copy_from_slice(&contents);

        embassy_futures::block_on(async {
            // Unaligned length, trailing erased bytes must not be hashed.
            assert_eq!(compute_digest(&mut flash, 0, 1001).await.unwrap(), Digest::of(&contents));
            assert_eq!(compute_digest(&mut flash, 4, 997).await.unwrap(), Digest::of(&contents[4..]));
            assert_eq!(compute_digest(&mut flash, 0, 0).await.unwrap(), Digest::of(&[]));
        });
    }

    #[test]
    fn flipped_byte_is_mismatch() {
        let contents = data(3000);
        let digest = Digest::of(&contents);

        embassy_futures::block_on(async {
            let mut flash = Flash::default();
            flash.as_bytes_mut()[1024..4024].copy_from_slice(&contents);
            let mut storage = PartitionStorage::new(&mut flash, region(1024, 4096));
            verify(&mut storage, &image(3000, digest)).await.unwrap();

            for i in [0, 1, 255, 256, 1500, 2999] {
                let mut flash = Flash::default();
                flash.as_bytes_mut()[1024..4024].copy_from_slice(&contents);
                flash.as_bytes_mut()[1024 + i] ^= 0x80;

                let mut storage = PartitionStorage::new(&mut flash, region(1024, 4096));
                assert!(
                    matches!(
                        verify(&mut storage, &image(3000, digest)).await,
                        Err(VerifyError::Mismatch(Mismatch::Digest { .. }))
                    ),
                    "byte {i}"
                );
            }
        });
    }

    #[test]
    fn length_boundary() {
        let contents = data(4096);
        let digest = Digest::of(&contents);

        embassy_futures::block_on(async {
            let mut flash = Flash::default();
            flash.as_bytes_mut()[2048..6144].copy_from_slice(&contents);

            // Image fills the partition exactly.
            let mut storage = PartitionStorage::new(&mut flash, region(2048, 4096));
            verify(&mut storage, &image(4096, digest)).await.unwrap();

            // One byte over is rejected before any read, so it is not an out of bounds error.
            assert!(matches!(
                verify(&mut storage, &image(4097, digest)).await,
                Err(VerifyError::Mismatch(Mismatch::Length {
                    declared: 4097,
                    available: 4096
                }))
            ));

            // Offset reduces the available space.
            let shifted = StagedImage {
                offset: 64,
                ..image(4096 - 63, digest)
            };
            assert!(matches!(
                verify(&mut storage, &shifted).await,
                Err(VerifyError::Mismatch(Mismatch::Length {
                    declared: 4033,
                    available: 4032
                }))
            ));

            assert!(matches!(
                verify(&mut storage, &image(0, digest)).await,
                Err(VerifyError::Mismatch(Mismatch::Length { declared: 0, .. }))
            ));
        });
    }

    #[test]
    fn flash_errors_are_not_mismatches() {
        embassy_futures::block_on(async {
            let mut flash = Flash::default();
            let mut storage = PartitionStorage::new(&mut flash, region(0, 1024));
            storage.erase(0, 1024).await.unwrap();

            assert!(matches!(
                compute_digest(&mut storage, 1000, 100).await,
                Err(StorageError::OutOfBounds)
            ));
        });
    }
}
