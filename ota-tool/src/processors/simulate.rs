//! Drive the update engine against simulated flash devices, the way a board would.

use std::fmt::Debug;
use std::path::Path;

use anyhow::Context;
use embedded_storage_async::nor_flash::NorFlash;
use ota_engine::boot::prepare;
use ota_engine::header::HEADER_SIZE;
use ota_engine::{
    ConfigError, Error, FlashRegistry, ImageInfo, Layout, PartitionStorage, PartitionTable, UpdateEngine, UpdateRecord,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::flash::{self, SimFlash, WORD_SIZE};

/// Registry of simulated devices with erase pages of `W` words.
pub type Registry<const W: usize> = FlashRegistry<SimFlash<W>>;

pub fn config_error(e: ConfigError) -> anyhow::Error {
    anyhow::anyhow!("Invalid flash configuration: {e:?}")
}

fn engine_error<E: Debug>(e: Error<E>) -> anyhow::Error {
    anyhow::anyhow!("Update engine failed: {e:?}")
}

/// Contents of every configured flash device, in configuration order.
#[derive(Debug, Clone)]
pub struct Devices<const W: usize>(Vec<(&'static str, SimFlash<W>)>);

impl<const W: usize> Devices<W> {
    pub fn erased(config: &Config) -> Self {
        Self(
            config
                .devices
                .iter()
                .map(|device| (leak(&device.name), flash::erased(device.capacity as usize)))
                .collect(),
        )
    }

    /// Read `<device>.bin` from `dir` for every device.
    pub fn load(config: &Config, dir: &Path) -> anyhow::Result<Self> {
        let devices = config
            .devices
            .iter()
            .map(|device| {
                let dump = flash::load(&dump_path(dir, &device.name), device.capacity as usize)?;
                Ok((leak(&device.name), dump))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self(devices))
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("Could not create {}", dir.display()))?;
        for (name, device) in &self.0 {
            flash::save(device, &dump_path(dir, name))?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SimFlash<W>> {
        self.0.iter().find(|(device, _)| *device == name).map(|(_, flash)| flash)
    }

    /// Bytes of the partition called `name`.
    pub fn partition(&self, config: &Config, name: &str) -> anyhow::Result<&[u8]> {
        let partition = config.partition(name)?;
        let flash = self
            .get(&partition.device)
            .with_context(|| format!("No device named {}", partition.device))?;
        flash
            .as_bytes()
            .get(partition.offset as usize..partition.offset as usize + partition.len as usize)
            .with_context(|| format!("Partition {name} exceeds its device"))
    }

    pub fn into_registry(self) -> anyhow::Result<Registry<W>> {
        let mut registry = FlashRegistry::new();
        for (name, flash) in self.0 {
            registry.register(name, flash).map_err(config_error)?;
        }
        Ok(registry)
    }

    fn from_registry(registry: &Registry<W>) -> Self {
        Self(
            registry
                .devices()
                .iter()
                .map(|device| (device.name(), device.flash().clone()))
                .collect(),
        )
    }
}

fn leak(name: &str) -> &'static str {
    Box::leak(name.to_owned().into_boxed_str())
}

fn dump_path(dir: &Path, device: &str) -> std::path::PathBuf {
    dir.join(format!("{device}.bin"))
}

#[derive(Debug, Clone)]
pub struct Report {
    /// Whether the package differed from the application and was staged.
    pub staged: bool,
    /// Whether the power was cut during the first boot.
    pub interrupted: bool,
    /// Partition chosen by the last boot.
    pub target: &'static str,
    pub fallback: Option<&'static str>,
    pub record: Option<UpdateRecord>,
    /// Image installed by the last completed commit.
    pub installed: Option<ImageInfo>,
    /// Bytes erased or programmed on the application device during the first boot.
    pub consumed: u64,
}

/// Download `package`, boot once, and when the power was cut, boot again.
pub async fn run<const W: usize>(
    config: &Config,
    devices: Devices<W>,
    package: &[u8],
    cut_at: Option<u64>,
) -> anyhow::Result<(Devices<W>, Report)> {
    let entries = config.entries();
    let roles = config.roles();

    let mut registry = devices.into_registry()?;
    registry.initialize().map_err(config_error)?;
    let table: PartitionTable = PartitionTable::validate_layout(&entries, &registry).map_err(config_error)?;
    let layout = Layout::resolve(&table, &roles).map_err(config_error)?;

    download(&mut registry, &layout, package).await?;

    let staged = {
        let mut engine = UpdateEngine::new(&mut registry, &table, roles).await.map_err(engine_error)?;
        let header = engine.read_header().await.map_err(engine_error)?;
        if engine.check_upgrade(&header.staged_image()) {
            engine.stage_from_header().await.map_err(engine_error)?;
            log::info!("Staged {} version {}", header.target, header.version_str());
            true
        } else {
            log::info!("Version {} is already installed", header.version_str());
            false
        }
    };

    let app_device = layout.app.device;
    let before = {
        let device = registry.device_mut(app_device).map_err(|e| anyhow::anyhow!("{e:?}"))?.flash_mut();
        if let Some(bytes) = cut_at {
            flash::cut_power_after(device, bytes)?;
        }
        device.bytes_touched()
    };

    let mut plan = prepare(&mut registry, &entries, roles, true).await.map_err(config_error)?;

    let device = registry.device_mut(app_device).map_err(|e| anyhow::anyhow!("{e:?}"))?.flash_mut();
    let consumed = device.bytes_touched() - before;
    let interrupted = cut_at.is_some_and(|bytes| consumed >= bytes);
    device.remove_shutoff();

    if interrupted {
        log::warn!("Power cut after {consumed} bytes, rebooting");
        plan = prepare(&mut registry, &entries, roles, true).await.map_err(config_error)?;
    }

    let engine = UpdateEngine::new(&mut registry, &table, roles).await.map_err(engine_error)?;
    let record = engine.record().copied();
    let installed = engine.installed().copied();

    let report = Report {
        staged,
        interrupted,
        target: plan.target.name,
        fallback: plan.fallback.map(|region| region.name),
        record,
        installed,
        consumed,
    };
    Ok((Devices::from_registry(&registry), report))
}

/// Write the package to the start of the download partition, as the application would.
async fn download<const W: usize>(registry: &mut Registry<W>, layout: &Layout, package: &[u8]) -> anyhow::Result<()> {
    let region = layout.download;
    if package.len() < HEADER_SIZE || package.len() > region.len as usize {
        return Err(anyhow::anyhow!(
            "Package of {} bytes does not fit download partition {} of {} bytes",
            package.len(),
            region.name,
            region.len
        ));
    }

    let mut padded = package.to_vec();
    padded.resize(package.len().next_multiple_of(WORD_SIZE), 0xFF);

    let device = registry
        .device_mut(region.device)
        .map_err(|e| anyhow::anyhow!("{e:?}"))?
        .flash_mut();
    let mut storage = PartitionStorage::new(device, region);
    storage
        .erase(0, region.erase_len(padded.len() as u32))
        .await
        .map_err(|e| anyhow::anyhow!("Could not erase {}: {e:?}", region.name))?;
    storage
        .write(0, &padded)
        .await
        .map_err(|e| anyhow::anyhow!("Could not program {}: {e:?}", region.name))?;
    Ok(())
}

/// Check that the application partition holds either the old or the new image,
/// and that the last boot chose it.
pub fn check<const W: usize>(
    config: &Config,
    before: &Devices<W>,
    after: &Devices<W>,
    package: &[u8],
    report: &Report,
) -> anyhow::Result<()> {
    let app_name = &config.roles.app;
    if report.target != app_name.as_str() {
        return Err(anyhow::anyhow!("Booted {} instead of {app_name}", report.target));
    }

    let body = package.get(HEADER_SIZE..).context("Package is shorter than its header")?;
    let app = after.partition(config, app_name)?;
    let updated = app.get(..body.len()) == Some(body);
    let untouched = app == before.partition(config, app_name)?;

    if !updated && !untouched {
        return Err(anyhow::anyhow!("{app_name} holds neither the old nor the new image"));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct SweepReport {
    /// Bytes touched by an uninterrupted update.
    pub total: u64,
    pub runs: usize,
    pub updated: usize,
    pub rolled_back: usize,
    /// Power cut positions that left the device in a bad state.
    pub failures: Vec<(u64, String)>,
}

/// Repeat the update from the same starting point with random power cuts.
pub async fn sweep<const W: usize>(
    config: &Config,
    devices: &Devices<W>,
    package: &[u8],
    runs: usize,
    seed: u64,
    mut progress: impl FnMut(u64),
) -> anyhow::Result<SweepReport> {
    let (_, full) = run(config, devices.clone(), package, None).await?;
    let mut report = SweepReport {
        total: full.consumed,
        ..Default::default()
    };
    if !full.staged {
        log::warn!("Package is already installed, nothing to interrupt");
        return Ok(report);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let body = &package[HEADER_SIZE..];
    for _ in 0..runs {
        let cut = rng.random_range(0..report.total.max(1));
        let (after, result) = run(config, devices.clone(), package, Some(cut)).await?;

        let updated = after.partition(config, &config.roles.app)?.starts_with(body);
        match check(config, devices, &after, package, &result) {
            Ok(()) if updated => report.updated += 1,
            Ok(()) => report.rolled_back += 1,
            Err(e) => report.failures.push((cut, e.to_string())),
        }
        report.runs += 1;
        progress(cut);
    }

    Ok(report)
}
