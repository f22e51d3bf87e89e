use defmt_or_log::{error, info, warn};
use embedded_storage_async::nor_flash::NorFlash;
use ota_state::record::UpdateState;

use crate::error::{ConfigError, Error};
use crate::partition::{PartitionEntry, PartitionTable, Region};
use crate::registry::FlashRegistry;
use crate::update::{Layout, UpdateEngine};
use crate::Roles;

/// A trait for application specific configurations.
pub trait BootPolicy {
    /// Names of the partitions the engine works with.
    fn roles() -> Roles {
        Roles::DEFAULT
    }

    /// Whether a staged image is verified and committed by the bootloader.
    ///
    /// When `false` the bootloader only recovers interrupted cycles, and the
    /// application is expected to drive the update itself.
    fn update_at_boot() -> bool {
        true
    }
}

/// A board that can boot an application image.
///
/// Typically a board needs to support the intrinsics for some microcontroller and
/// contain non volatile memory that stores the images and the update record.
#[allow(async_fn_in_trait)]
pub trait Board {
    /// Type used to instantiate a [Board] implementation.
    type Config: BootPolicy;

    /// Flash device type of the registry.
    type Flash: NorFlash;

    /// Initialize the [Board], can only be called once.
    async fn init(config: Self::Config) -> Self;

    /// Give the registry with all devices registered, and the partitions on them.
    fn flash(&mut self) -> (&mut FlashRegistry<Self::Flash>, &'static [PartitionEntry]);

    /// Check the image in the partition for integrity, and try to boot.
    ///
    /// Does not return if the boot is successful.
    /// Yields [BootError] if at any stage the boot is aborted.
    async fn check_and_boot(&mut self, region: &Region) -> BootError;

    /// Give up booting into an application.
    ///
    /// Either shut down the device or go into an infinite loop.
    fn abort(&mut self) -> !;
}

/// Why a [Board] did not boot a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootError {
    /// Partition does not contain an image.
    Empty,
    /// Image failed the board's own checks.
    Integrity,
    /// The underlying NVM threw an error.
    IO,
}

/// Partitions to try booting, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootPlan {
    pub target: Region,
    pub fallback: Option<Region>,
}

/// Validate the configuration, settle the update state and decide what to boot.
///
/// Only configuration errors are returned. Flash and integrity errors during the
/// update are logged, after which the boot selector decides on what is left.
pub async fn prepare<T: NorFlash, const N: usize>(
    registry: &mut FlashRegistry<T, N>,
    entries: &[PartitionEntry],
    roles: Roles,
    update_at_boot: bool,
) -> Result<BootPlan, ConfigError> {
    registry.initialize()?;
    let table: PartitionTable = PartitionTable::validate_layout(entries, registry)?;
    let layout = Layout::resolve(&table, &roles)?;

    let mut engine = match UpdateEngine::with_layout(registry, &table, layout).await {
        Ok(engine) => engine,
        Err(Error::Config(e)) => return Err(e),
        Err(e) => {
            warn!("Update record unavailable ({:?}), booting {}", e.kind(), layout.app.name);
            return Ok(BootPlan {
                target: layout.app,
                fallback: Some(layout.backup),
            });
        }
    };

    match engine.check_bootloader().await {
        Ok(true) => info!("Bootloader matches its shadow"),
        Ok(false) => {}
        Err(e) => warn!("Bootloader check failed: {:?}", e.kind()),
    }

    match engine.recover().await {
        Ok(recovery) => info!("Recovery: {:?}", recovery),
        Err(e) => error!("Recovery failed: {:?}", e.kind()),
    }

    if update_at_boot && engine.status() == Some(UpdateState::Staged) {
        match engine.run().await {
            Ok(()) => info!("Update installed"),
            Err(e) => warn!("Update not installed: {:?}", e.kind()),
        }
    }

    Ok(BootPlan {
        target: engine.boot_region(),
        fallback: engine.fallback_region(),
    })
}

pub async fn start<B: Board>(config: B::Config) -> ! {
    let mut board = B::init(config).await;

    let (registry, entries) = board.flash();
    let plan = match prepare(registry, entries, B::Config::roles(), B::Config::update_at_boot()).await {
        Ok(plan) => plan,
        Err(e) => {
            error!("Invalid flash configuration: {:?}", e);
            board.abort()
        }
    };

    info!("Attempting to boot {}", plan.target.name);
    let error = board.check_and_boot(&plan.target).await; // If this function returns, it implies that the boot has failed.
    warn!("Failed to boot {} because {:?}", plan.target.name, error);

    if let Some(fallback) = plan.fallback {
        info!("Attempting to boot fallback {}", fallback.name);
        let error = board.check_and_boot(&fallback).await;
        warn!("Failed to boot fallback {} because {:?}", fallback.name, error);
    }

    error!("No candidates booted successfully, giving up...");
    board.abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, Flash, ENTRIES, KIB};
    use crate::partition::PartitionStorage;
    use embassy_futures::block_on;
    use embedded_storage_async::nor_flash::ReadNorFlash;
    use ota_state::flash::mock::MockFlashBase;
    use std::panic::{catch_unwind, panic_any, AssertUnwindSafe};
    use std::vec::Vec;

    fn unsealed(flash: Flash) -> FlashRegistry<Flash> {
        let mut registry = FlashRegistry::new();
        registry.register("spi0", flash).unwrap();
        registry
    }

    #[test]
    fn boots_app_without_record() {
        let mut registry = unsealed(fixture::flash());
        let plan = block_on(prepare(&mut registry, &ENTRIES, Roles::default(), true)).unwrap();

        assert_eq!(plan.target.name, "app");
        assert_eq!(plan.fallback, None);
        assert!(registry.is_initialized());
    }

    #[test]
    fn installs_staged_image() {
        let image = fixture::pattern(20, 32 * KIB as usize);
        let (mut staged, table) = fixture::setup(&image);

        block_on(async {
            let mut engine = UpdateEngine::new(&mut staged, &table, Roles::default()).await.unwrap();
            engine.stage(fixture::staged(0, &image)).await.unwrap();
        });

        let untouched = fixture::mock(&staged).clone();

        // Already initialized, which `prepare` accepts.
        let plan = block_on(prepare(&mut staged, &ENTRIES, Roles::default(), true)).unwrap();
        assert_eq!(plan.target.name, "app");
        assert_eq!(plan.fallback.map(|region| region.name), Some("backup"));

        let app = &fixture::mock(&staged).as_bytes()[fixture::range(fixture::APP, image.len() as u32)];
        assert_eq!(app, &image[..]);

        // Without updating at boot the image stays staged.
        let mut registry = unsealed(untouched);
        let plan = block_on(prepare(&mut registry, &ENTRIES, Roles::default(), false)).unwrap();
        assert_eq!(plan.target.name, "app");
        assert_eq!(plan.fallback, None);
        assert_eq!(
            fixture::journal(fixture::mock(&registry)).last().map(|record| record.state),
            Some(UpdateState::Staged)
        );
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let mut overlapping = ENTRIES;
        overlapping[2] = PartitionEntry::new("download", "spi0", 0x8_0000, 0x8_0000);

        let mut registry = unsealed(fixture::flash());
        assert_eq!(
            block_on(prepare(&mut registry, &overlapping, Roles::default(), true)),
            Err(ConfigError::Overlap("app", "download"))
        );

        let mut registry = registry_with_duplicate();
        assert_eq!(
            block_on(prepare(&mut registry, &ENTRIES, Roles::default(), true)),
            Err(ConfigError::DuplicateDevice("spi0"))
        );

        let mut registry = unsealed(fixture::flash());
        assert_eq!(
            block_on(prepare(&mut registry, &ENTRIES[..5], Roles::default(), true)),
            Err(ConfigError::MissingPartition("ota_record"))
        );
    }

    fn registry_with_duplicate() -> FlashRegistry<Flash> {
        let mut registry = unsealed(fixture::flash());
        registry.register("spi0", fixture::flash()).unwrap();
        registry
    }

    /// 403 pages of 4 KiB, programmed in units of 512 bytes.
    type CoarseFlash = MockFlashBase<403, 512, 8>;

    #[test]
    fn coarse_program_unit_is_a_configuration_error() {
        let mut registry: FlashRegistry<CoarseFlash> = FlashRegistry::new();
        registry.register("spi0", CoarseFlash::default()).unwrap();
        assert_eq!(
            block_on(prepare(&mut registry, &ENTRIES, Roles::default(), true)),
            Err(ConfigError::BadGranularity("spi0"))
        );
    }

    /// How [start] ended on a [TestBoard], and the boot errors seen on the way.
    #[derive(Debug, PartialEq)]
    enum Exit {
        Booted(&'static str, Vec<(&'static str, BootError)>),
        Aborted(Vec<(&'static str, BootError)>),
    }

    struct TestConfig {
        registry: FlashRegistry<Flash>,
        /// Partitions whose image the board refuses.
        rejected: &'static [&'static str],
    }

    impl BootPolicy for TestConfig {}

    /// Boots a partition by unwinding out of [start] with [Exit::Booted].
    struct TestBoard {
        registry: FlashRegistry<Flash>,
        rejected: &'static [&'static str],
        failures: Vec<(&'static str, BootError)>,
    }

    impl TestBoard {
        async fn check(&mut self, region: &Region) -> Result<(), BootError> {
            let device = self.registry.device_mut(region.device).map_err(|_| BootError::IO)?;
            let mut word = [0u8; 4];
            PartitionStorage::new(device.flash_mut(), *region)
                .read(0, &mut word)
                .await
                .map_err(|_| BootError::IO)?;

            if word == [0xff; 4] {
                return Err(BootError::Empty);
            }
            if self.rejected.contains(&region.name) {
                return Err(BootError::Integrity);
            }
            Ok(())
        }
    }

    impl Board for TestBoard {
        type Config = TestConfig;
        type Flash = Flash;

        async fn init(config: TestConfig) -> Self {
            Self {
                registry: config.registry,
                rejected: config.rejected,
                failures: Vec::new(),
            }
        }

        fn flash(&mut self) -> (&mut FlashRegistry<Flash>, &'static [PartitionEntry]) {
            (&mut self.registry, &ENTRIES)
        }

        async fn check_and_boot(&mut self, region: &Region) -> BootError {
            match self.check(region).await {
                Ok(()) => panic_any(Exit::Booted(region.name, core::mem::take(&mut self.failures))),
                Err(e) => {
                    self.failures.push((region.name, e));
                    e
                }
            }
        }

        fn abort(&mut self) -> ! {
            panic_any(Exit::Aborted(core::mem::take(&mut self.failures)))
        }
    }

    fn boot(registry: FlashRegistry<Flash>, rejected: &'static [&'static str]) -> Exit {
        let config = TestConfig { registry, rejected };
        let payload = catch_unwind(AssertUnwindSafe(|| {
            block_on(start::<TestBoard>(config));
        }))
        .unwrap_err();
        *payload.downcast::<Exit>().unwrap()
    }

    /// Device with a committed update, so that the backup holds the legacy application.
    fn updated() -> FlashRegistry<Flash> {
        let image = fixture::pattern(22, 16 * KIB as usize);
        let (mut registry, table) = fixture::setup(&image);
        block_on(async {
            let mut engine = UpdateEngine::new(&mut registry, &table, Roles::default()).await.unwrap();
            engine.stage(fixture::staged(0, &image)).await.unwrap();
            engine.run().await.unwrap();
        });
        registry
    }

    #[test]
    fn start_boots_target() {
        assert_eq!(boot(updated(), &[]), Exit::Booted("app", Vec::new()));
        assert_eq!(boot(unsealed(fixture::flash()), &[]), Exit::Booted("app", Vec::new()));
    }

    #[test]
    fn start_falls_back_then_aborts() {
        assert_eq!(
            boot(updated(), &["app"]),
            Exit::Booted("backup", std::vec![("app", BootError::Integrity)])
        );
        assert_eq!(
            boot(updated(), &["app", "backup"]),
            Exit::Aborted(std::vec![("app", BootError::Integrity), ("backup", BootError::Integrity)])
        );
    }

    #[test]
    fn start_aborts_without_fallback() {
        let mut flash = fixture::flash();
        flash.as_bytes_mut()[fixture::range(fixture::APP, 4)].fill(0xff);
        assert_eq!(
            boot(unsealed(flash), &[]),
            Exit::Aborted(std::vec![("app", BootError::Empty)])
        );
    }

    #[test]
    fn start_aborts_on_configuration_error() {
        assert_eq!(boot(registry_with_duplicate(), &[]), Exit::Aborted(Vec::new()));
    }
}
