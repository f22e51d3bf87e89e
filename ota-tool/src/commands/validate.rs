use ota_engine::header::HEADER_SIZE;
use ota_engine::{Layout, PartitionTable};

use crate::config::Config;
use crate::processors::simulate::{Devices, config_error};
use crate::util::format_size;

pub fn process(config: &Config) -> anyhow::Result<()> {
    match config.erase_size()? {
        4096 => validate::<1024>(config),
        65536 => validate::<16384>(config),
        other => Err(anyhow::anyhow!("Unsupported erase size {other}, expected 4096 or 65536")),
    }
}

fn validate<const W: usize>(config: &Config) -> anyhow::Result<()> {
    let entries = config.entries();
    let roles = config.roles();

    let mut registry = Devices::<W>::erased(config).into_registry()?;
    registry.initialize().map_err(config_error)?;

    let table: PartitionTable = PartitionTable::validate_layout(&entries, &registry).map_err(config_error)?;
    let layout = Layout::resolve(&table, &roles).map_err(config_error)?;

    for region in table.regions() {
        let device = registry.device(region.device).map_err(|e| anyhow::anyhow!("{e:?}"))?;
        log::info!(
            "{:<16} {:<8} 0x{:08x}..0x{:08x} {}",
            region.name,
            device.name(),
            region.offset,
            region.end(),
            format_size(region.len)
        );
    }

    let max_image = layout.download.len.saturating_sub(HEADER_SIZE as u32).min(layout.app.len);
    println!(
        "Configuration valid: images up to {} for {}, backed up in {}",
        format_size(max_image),
        layout.app.name,
        layout.backup.name
    );
    Ok(())
}
