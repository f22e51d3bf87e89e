use ota_engine::Digest;
use ota_engine::header::{BootloaderShadow, HEADER_SIZE, ImageHeader, SHADOW_SIZE};
use ota_state::record::PartitionName;

/// Prefix `body` with an image header for the `target` partition.
pub fn package(body: &[u8], target: &str, version: &str, timestamp: u32) -> anyhow::Result<Vec<u8>> {
    if body.is_empty() {
        return Err(anyhow::anyhow!("Refusing to package an empty image"));
    }
    let len = u32::try_from(body.len()).map_err(|_| anyhow::anyhow!("Image of {} bytes is too large", body.len()))?;

    let target = PartitionName::new(target).ok_or_else(|| anyhow::anyhow!("Invalid target partition name {target:?}"))?;
    let header = ImageHeader::new(target, version, timestamp, len, Digest::of(body))
        .map_err(|e| anyhow::anyhow!("Could not build header: {e:?}"))?;

    let mut package = Vec::with_capacity(HEADER_SIZE + body.len());
    package.extend_from_slice(&header.to_bytes());
    package.extend_from_slice(body);
    Ok(package)
}

#[derive(Debug)]
pub struct Inspection {
    pub header: ImageHeader,
    /// Bytes present after the header.
    pub available: usize,
    /// Digest over the declared body, if the package holds all of it.
    pub computed: Option<Digest>,
}

impl Inspection {
    pub fn is_intact(&self) -> bool {
        self.computed == Some(self.header.body_digest)
    }
}

pub fn inspect(package: &[u8]) -> anyhow::Result<Inspection> {
    let Some((header, body)) = package.split_first_chunk::<HEADER_SIZE>() else {
        return Err(anyhow::anyhow!("Package of {} bytes is shorter than its header", package.len()));
    };
    let header = ImageHeader::parse(header).map_err(|e| anyhow::anyhow!("Invalid image header: {e:?}"))?;

    let computed = body.get(..header.body_len as usize).map(Digest::of);
    Ok(Inspection {
        header,
        available: body.len(),
        computed,
    })
}

/// Reference length and digest of a bootloader, for the bootloader check partition.
pub fn shadow(bootloader: &[u8]) -> [u8; SHADOW_SIZE] {
    BootloaderShadow {
        len: bootloader.len() as u32,
        digest: Digest::of(bootloader),
    }
    .to_bytes()
}
