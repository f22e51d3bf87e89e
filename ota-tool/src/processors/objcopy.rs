use anyhow::Context;
use object::read::elf::{ElfFile32, ProgramHeader};
use object::{Object, ObjectSegment};

const ELF_MAGIC: &[u8] = b"\x7fELF";

/// Flatten the loadable segments of an ELF file into a binary image.
///
/// Returns the image and the physical address it starts at.
pub fn objcopy(file: &ElfFile32) -> anyhow::Result<(Vec<u8>, u32)> {
    let mut last_paddr = 0;
    let mut segments = vec![];
    for segment in file.segments() {
        let filesz = segment.elf_program_header().p_filesz(file.endianness());
        let memsz = segment.elf_program_header().p_memsz(file.endianness());

        if filesz == 0 {
            // bss is cleared during startup.
            continue;
        }

        if filesz > memsz {
            return Err(anyhow::anyhow!("p_filesz larger than p_memsz"));
        }
        if memsz > filesz {
            return Err(anyhow::anyhow!("Segment only partially a bss segment"));
        }

        let paddr = segment.elf_program_header().p_paddr(file.endianness());
        if paddr < last_paddr {
            return Err(anyhow::anyhow!(
                "Segments not in order of physical address or overlapping segments"
            ));
        }
        last_paddr = paddr + memsz;

        segments.push(segment);
    }

    let Some(base_addr) = segments
        .iter()
        .map(|segment| segment.elf_program_header().p_paddr(file.endianness()))
        .min()
    else {
        return Err(anyhow::anyhow!("ELF file has no loadable segments"));
    };
    let output_size = last_paddr - base_addr;

    log::debug!("Image base address: 0x{base_addr:0x}");
    log::debug!("Image entry address: 0x{:0x}", file.entry());
    log::debug!("Image output size: 0x{output_size:0x}");

    // Gaps between segments are left erased.
    let mut image = vec![0xFF; output_size as usize];
    for segment in segments {
        let start = (segment.elf_program_header().p_paddr(file.endianness()) - base_addr) as usize;
        let data = segment.data().context("Could not read segment data")?;
        image[start..start + data.len()].copy_from_slice(data);
    }

    Ok((image, base_addr))
}

/// Binary contents of `data`, which is either an ELF file or already a flat binary.
pub fn flatten(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    if !data.starts_with(ELF_MAGIC) {
        return Ok(data.to_vec());
    }

    let file = ElfFile32::parse(data).context("Could not parse ELF")?;
    let (image, base_addr) = objcopy(&file)?;
    log::info!("Converted ELF to {} byte binary at 0x{base_addr:08x}", image.len());
    Ok(image)
}
