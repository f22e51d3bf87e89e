//! Update state machine.
//!
//! The [UpdateEngine] owns the [UpdateRecord] exclusively. Every transition is persisted
//! to the record journal before the next flash mutation starts, so that after a power
//! loss [UpdateEngine::recover] knows exactly which step was interrupted.

use defmt_or_log::{debug, error, info, warn};
use embedded_storage_async::nor_flash::{NorFlash, ReadNorFlash};
use ota_state::digest::Digest;
use ota_state::flash::{Aligned, FlashJournal};
use ota_state::record::{
    BackupInfo, FirmwareVersion, ImageInfo, Outcome, PartitionName, UpdateRecord, UpdateState, RECORD_SIZE,
};

use crate::error::{ConfigError, Error, LookupError};
use crate::header::{BootloaderShadow, ImageHeader, HEADER_SIZE, SHADOW_SIZE};
use crate::partition::{PartitionStorage, PartitionTable, Region};
use crate::registry::FlashRegistry;
use crate::select::{boot_target, BootTarget};
use crate::verify::{self, Mismatch, StagedImage, CHUNK_SIZE};
use crate::{Roles, MAX_DEVICES, MAX_PARTITIONS};

/// Bytes read at once when scanning the record journal.
pub const JOURNAL_BUFFER_SIZE: usize = 256;

/// The partitions the engine works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layout {
    pub bootloader: Region,
    pub bootloader_crc: Option<Region>,
    pub app: Region,
    pub download: Region,
    pub backup: Region,
    pub record: Region,
}

impl Layout {
    /// Look up every role in the table and check the constraints the engine relies on.
    pub fn resolve<const M: usize>(table: &PartitionTable<M>, roles: &Roles) -> Result<Self, ConfigError> {
        let get = |name: &'static str| table.resolve(name).map_err(|_| ConfigError::MissingPartition(name));

        let layout = Self {
            bootloader: get(roles.bootloader)?,
            bootloader_crc: table.resolve(roles.bootloader_crc).ok(),
            app: get(roles.app)?,
            download: get(roles.download)?,
            backup: get(roles.backup)?,
            record: get(roles.record)?,
        };

        let names = [
            Some(layout.bootloader.name),
            layout.bootloader_crc.map(|region| region.name),
            Some(layout.app.name),
            Some(layout.download.name),
            Some(layout.backup.name),
            Some(layout.record.name),
        ];
        for (i, name) in names.iter().enumerate() {
            if name.is_some() && names[..i].contains(name) {
                return Err(ConfigError::RolesNotDistinct);
            }
        }

        for region in [&layout.app, &layout.download, &layout.backup, &layout.record] {
            if !region.is_erase_aligned() {
                return Err(ConfigError::Misaligned(region.name));
            }
        }

        if layout.backup.len < layout.app.len {
            return Err(ConfigError::BackupTooSmall);
        }

        let record = &layout.record;
        if record.len / record.erase_size < 2 || !(record.erase_size as usize).is_multiple_of(RECORD_SIZE) {
            return Err(ConfigError::RecordRegionTooSmall);
        }

        if PartitionName::new(layout.app.name).is_none() {
            return Err(ConfigError::NameTooLong(layout.app.name));
        }

        Ok(layout)
    }
}

/// What [UpdateEngine::recover] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recovery {
    /// Nothing was interrupted.
    Clean,
    /// A failed verification was settled to `Idle`.
    Settled,
    /// An interrupted verification was undone, the image is `Staged` again.
    Restaged,
    /// An interrupted commit had already written the full image.
    Completed,
    /// An interrupted commit was undone by restoring the backup.
    RolledBack,
}

/// Drives an update cycle over the partitions of a [FlashRegistry].
pub struct UpdateEngine<'r, T, const N: usize = MAX_DEVICES, const M: usize = MAX_PARTITIONS> {
    registry: &'r mut FlashRegistry<T, N>,
    table: &'r PartitionTable<M>,
    layout: Layout,
    /// The application partition, the only supported target.
    target: PartitionName,
    /// Last record in the journal, if any.
    record: Option<UpdateRecord>,
}

impl<'r, T: NorFlash, const N: usize, const M: usize> UpdateEngine<'r, T, N, M> {
    /// Resolve the layout and load the latest record from the journal.
    pub async fn new(
        registry: &'r mut FlashRegistry<T, N>,
        table: &'r PartitionTable<M>,
        roles: Roles,
    ) -> Result<Self, Error<T::Error>> {
        let layout = Layout::resolve(table, &roles)?;
        Self::with_layout(registry, table, layout).await
    }

    /// Load the latest record from the journal, for a layout already resolved from `table`.
    pub async fn with_layout(
        registry: &'r mut FlashRegistry<T, N>,
        table: &'r PartitionTable<M>,
        layout: Layout,
    ) -> Result<Self, Error<T::Error>> {
        if !registry.is_initialized() {
            return Err(LookupError::NotInitialized.into());
        }

        let target = PartitionName::new(layout.app.name).ok_or(ConfigError::NameTooLong(layout.app.name))?;

        let mut engine = Self {
            registry,
            table,
            layout,
            target,
            record: None,
        };

        let record = engine.journal().await?.get().copied();
        match &record {
            Some(record) => info!("Latest update record fetched from journal: {:?}", record),
            None => info!("No update record in journal"),
        }
        engine.record = record;

        Ok(engine)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn record(&self) -> Option<&UpdateRecord> {
        self.record.as_ref()
    }

    /// The image installed by the last commit, as long as no new cycle was started.
    pub fn installed(&self) -> Option<&ImageInfo> {
        self.record
            .as_ref()
            .filter(|record| record.state == UpdateState::Committed)
            .map(|record| &record.image)
    }

    /// Current state tag, `None` if no cycle was ever started.
    pub fn status(&self) -> Option<UpdateState> {
        self.record.map(|record| record.state)
    }

    /// Name of the partition to boot, see [boot_target].
    pub fn select_boot_target(&self) -> &'static str {
        self.boot_region().name
    }

    pub fn boot_region(&self) -> Region {
        match boot_target(self.record.as_ref()) {
            BootTarget::Application => self.layout.app,
            BootTarget::Backup => self.layout.backup,
        }
    }

    /// Partition to boot when [Self::boot_region] fails to boot, if it holds a recorded image.
    pub fn fallback_region(&self) -> Option<Region> {
        match boot_target(self.record.as_ref()) {
            BootTarget::Application => self.record.and_then(|record| record.backup).map(|_| self.layout.backup),
            BootTarget::Backup => None,
        }
    }

    /// Signal that the host application wrote a complete image into the download partition.
    ///
    /// Records the declared length and digest before anything else is touched.
    /// A staged image that was not verified yet may be replaced.
    pub async fn stage(&mut self, image: StagedImage) -> Result<(), Error<T::Error>> {
        self.stage_image(image, 0, FirmwareVersion::default()).await
    }

    async fn stage_image(
        &mut self,
        image: StagedImage,
        timestamp: u32,
        version: FirmwareVersion,
    ) -> Result<(), Error<T::Error>> {
        let current = self.current();
        if !matches!(
            current.state,
            UpdateState::Idle | UpdateState::Staged | UpdateState::Committed
        ) {
            return Err(Error::InvalidState(current.state));
        }

        if image.target != self.target {
            return Err(match self.table.resolve(image.target.as_str()) {
                Ok(_) => Error::UnsupportedTarget,
                Err(e) => e.into(),
            });
        }

        if !(image.offset as usize).is_multiple_of(T::READ_SIZE) {
            return Err(Error::UnalignedImage);
        }

        self.persist(UpdateRecord {
            state: UpdateState::Staged,
            outcome: Outcome::None,
            target: image.target,
            image: ImageInfo {
                offset: image.offset,
                len: image.len,
                digest: image.digest,
                timestamp,
                version,
            },
            ..current
        })
        .await?;

        info!(
            "Staged {} bytes with digest {:?} for {}",
            image.len, image.digest, image.target
        );
        Ok(())
    }

    /// Parse the [ImageHeader] at the start of the download partition.
    pub async fn read_header(&mut self) -> Result<ImageHeader, Error<T::Error>> {
        let download = self.layout.download;
        let mut buf = Aligned::<HEADER_SIZE>::new();
        self.storage(download)?.read(0, &mut buf.0).await?;
        Ok(ImageHeader::parse(&buf.0)?)
    }

    /// Stage the body following the [ImageHeader] in the download partition.
    pub async fn stage_from_header(&mut self) -> Result<ImageHeader, Error<T::Error>> {
        let header = self.read_header().await?;
        debug!("Image header for {} version {}", header.target, header.version_str());
        self.stage_image(header.staged_image(), header.timestamp, header.version)
            .await?;
        Ok(header)
    }

    /// Whether `image` differs from the image the record says is committed.
    ///
    /// Only a `Committed` record for the same target, length and digest makes it redundant.
    pub fn check_upgrade(&self, image: &StagedImage) -> bool {
        !self.record.is_some_and(|record| {
            record.state == UpdateState::Committed
                && record.target == image.target
                && record.image.len == image.len
                && record.image.digest == image.digest
        })
    }

    /// Check the staged image against its declared length and digest.
    ///
    /// A mismatch returns the engine to `Idle` and counts as a failed attempt,
    /// the application partition is never touched.
    pub async fn verify(&mut self) -> Result<(), Error<T::Error>> {
        let record = self.current();
        if record.state != UpdateState::Staged {
            return Err(Error::InvalidState(record.state));
        }

        self.persist(record.with_state(UpdateState::Verifying)).await?;

        let image = StagedImage {
            target: record.target,
            offset: record.image.offset,
            len: record.image.len,
            digest: record.image.digest,
        };

        match self.check_staged(&image).await {
            Ok(()) => {
                self.persist(record.with_state(UpdateState::VerifiedOk)).await?;
                info!("Staged image verified");
                Ok(())
            }
            Err(Error::Integrity(mismatch)) => {
                warn!("Staged image rejected: {:?}", mismatch);
                let failed = record.with_failed_attempt(UpdateState::VerifyFailed, Outcome::VerifyFailed);
                self.persist(failed).await?;
                self.persist(failed.with_state(UpdateState::Idle)).await?;
                Err(Error::Integrity(mismatch))
            }
            Err(e) => Err(e),
        }
    }

    /// Make the verified image live.
    ///
    /// Preserves the application into the backup partition first, unless the backup
    /// already holds this exact application. `Committing` is persisted before the
    /// application partition is erased, and only replaced by `Committed` once the
    /// written image reads back with the verified digest.
    pub async fn commit(&mut self) -> Result<(), Error<T::Error>> {
        let record = self.current();
        if record.state != UpdateState::VerifiedOk {
            return Err(Error::InvalidState(record.state));
        }

        let backup = match self.preserve_app(record).await {
            Ok(backup) => backup,
            Err(e) => {
                warn!("Failed to back up the application: {:?}", e.kind());
                let failed = self.current().with_failed_attempt(UpdateState::Idle, Outcome::BackupFailed);
                if self.persist(failed).await.is_err() {
                    error!("Failed to record the backup failure");
                }
                return Err(e);
            }
        };

        let record = UpdateRecord {
            backup: Some(backup),
            ..record.with_state(UpdateState::Committing)
        };
        self.persist(record).await?;

        let (app, download) = (self.layout.app, self.layout.download);
        info!("Writing {} bytes into {}", record.image.len, app.name);
        self.erase(app, record.image.len).await?;
        self.copy(download, record.image.offset, app, record.image.len).await?;

        if self.digest_of(app, 0, record.image.len).await? != record.image.digest {
            error!("Read-back of {} does not match the verified image", app.name);
            return Err(Error::ReadbackFailed(app.name));
        }

        self.persist(UpdateRecord {
            attempts: 0,
            ..record.with_outcome(UpdateState::Committed, Outcome::Committed)
        })
        .await?;

        info!("Update committed");
        Ok(())
    }

    /// Verify and commit the staged image.
    pub async fn run(&mut self) -> Result<(), Error<T::Error>> {
        self.verify().await?;
        self.commit().await
    }

    /// Discard a staged image.
    ///
    /// Refused once `Committing` is persisted, the only ways out of that state are
    /// the ones taken by [Self::recover].
    pub async fn cancel(&mut self) -> Result<(), Error<T::Error>> {
        let record = self.current();
        match record.state {
            UpdateState::Idle | UpdateState::Committed => Ok(()),
            UpdateState::Committing => Err(Error::InvalidState(record.state)),
            _ => {
                self.persist(record.with_outcome(UpdateState::Idle, Outcome::Discarded))
                    .await?;
                info!("Staged image discarded");
                Ok(())
            }
        }
    }

    /// Settle whatever state a previous boot left behind.
    pub async fn recover(&mut self) -> Result<Recovery, Error<T::Error>> {
        let Some(record) = self.record else {
            return Ok(Recovery::Clean);
        };

        match record.state {
            UpdateState::Idle | UpdateState::Staged | UpdateState::Committed => Ok(Recovery::Clean),
            UpdateState::Verifying | UpdateState::VerifiedOk => {
                warn!("Interrupted verification, image staged again");
                self.persist(record.with_state(UpdateState::Staged)).await?;
                Ok(Recovery::Restaged)
            }
            UpdateState::VerifyFailed => {
                self.persist(record.with_state(UpdateState::Idle)).await?;
                Ok(Recovery::Settled)
            }
            UpdateState::Committing => self.recover_commit(record).await,
        }
    }

    /// Check the bootloader against the length and digest in its shadow partition.
    ///
    /// Yields `false` when there is no shadow to check against.
    pub async fn check_bootloader(&mut self) -> Result<bool, Error<T::Error>> {
        let Some(shadow) = self.layout.bootloader_crc else {
            return Ok(false);
        };

        let mut buf = Aligned::<SHADOW_SIZE>::new();
        self.storage(shadow)?.read(0, &mut buf.0).await?;
        let Some(shadow) = BootloaderShadow::parse(&buf.0) else {
            debug!("Bootloader shadow is erased");
            return Ok(false);
        };

        let bootloader = self.layout.bootloader;
        if shadow.len == 0 || shadow.len > bootloader.len {
            return Err(Mismatch::Length {
                declared: shadow.len,
                available: bootloader.len,
            }
            .into());
        }

        let computed = self.digest_of(bootloader, 0, shadow.len).await?;
        if computed != shadow.digest {
            return Err(Mismatch::Digest {
                expected: shadow.digest,
                computed,
            }
            .into());
        }

        Ok(true)
    }

    async fn recover_commit(&mut self, record: UpdateRecord) -> Result<Recovery, Error<T::Error>> {
        let app = self.layout.app;
        warn!("Interrupted commit, checking {}", app.name);

        if self.digest_of(app, 0, record.image.len).await? == record.image.digest {
            self.persist(UpdateRecord {
                attempts: 0,
                ..record.with_outcome(UpdateState::Committed, Outcome::Committed)
            })
            .await?;
            info!("Interrupted commit had completed writing {}", app.name);
            return Ok(Recovery::Completed);
        }

        let Some(info) = record.backup else {
            error!("No backup to restore {} from", app.name);
            return Err(Error::NoBackup);
        };

        let backup = self.layout.backup;
        let computed = self.digest_of(backup, 0, info.len).await?;
        if computed != info.digest {
            error!("Backup in {} is corrupt", backup.name);
            return Err(Mismatch::Digest {
                expected: info.digest,
                computed,
            }
            .into());
        }

        warn!("Restoring {} from {}", app.name, backup.name);
        self.erase(app, info.len).await?;
        self.copy(backup, 0, app, info.len).await?;

        if self.digest_of(app, 0, info.len).await? != info.digest {
            error!("Read-back of restored {} failed", app.name);
            return Err(Error::ReadbackFailed(app.name));
        }

        self.persist(record.with_failed_attempt(UpdateState::Idle, Outcome::RolledBack))
            .await?;
        Ok(Recovery::RolledBack)
    }

    async fn check_staged(&mut self, image: &StagedImage) -> Result<(), Error<T::Error>> {
        let app = self.layout.app;
        if image.len > app.len {
            return Err(Mismatch::Length {
                declared: image.len,
                available: app.len,
            }
            .into());
        }

        let download = self.layout.download;
        Ok(verify::verify(&mut self.storage(download)?, image).await?)
    }

    /// Copy the full application partition into the backup partition, if needed.
    async fn preserve_app(&mut self, record: UpdateRecord) -> Result<BackupInfo, Error<T::Error>> {
        let (app, backup) = (self.layout.app, self.layout.backup);
        let info = BackupInfo {
            len: app.len,
            digest: self.digest_of(app, 0, app.len).await?,
        };

        if record.backup == Some(info) && self.digest_of(backup, 0, info.len).await? == info.digest {
            info!("Backup of {} is up to date", app.name);
            return Ok(info);
        }

        if record.backup.is_some() {
            // The backup is about to be overwritten.
            self.persist(UpdateRecord { backup: None, ..record }).await?;
        }

        info!("Backing up {} into {}", app.name, backup.name);
        self.erase(backup, info.len).await?;
        self.copy(app, 0, backup, info.len).await?;

        if self.digest_of(backup, 0, info.len).await? != info.digest {
            error!("Read-back of {} failed", backup.name);
            return Err(Error::ReadbackFailed(backup.name));
        }

        Ok(info)
    }

    fn current(&self) -> UpdateRecord {
        self.record.unwrap_or(UpdateRecord::idle(self.target))
    }

    fn storage(&mut self, region: Region) -> Result<PartitionStorage<'_, T>, Error<T::Error>> {
        let device = self.registry.device_mut(region.device)?;
        Ok(PartitionStorage::new(device.flash_mut(), region))
    }

    async fn journal(&mut self) -> Result<FlashJournal<PartitionStorage<'_, T>>, Error<T::Error>> {
        let record = self.layout.record;
        Ok(FlashJournal::new::<JOURNAL_BUFFER_SIZE>(self.storage(record)?).await?)
    }

    /// Append a record to the journal and make it current.
    async fn persist(&mut self, record: UpdateRecord) -> Result<(), Error<T::Error>> {
        self.journal().await?.set::<JOURNAL_BUFFER_SIZE>(&record).await?;
        debug!("Stored new record in journal: {:?}", record);
        self.record = Some(record);
        Ok(())
    }

    async fn digest_of(&mut self, region: Region, offset: u32, len: u32) -> Result<Digest, Error<T::Error>> {
        Ok(verify::compute_digest(&mut self.storage(region)?, offset, len).await?)
    }

    /// Erase the blocks covering the first `len` bytes of `region`.
    async fn erase(&mut self, region: Region, len: u32) -> Result<(), Error<T::Error>> {
        let end = region.erase_len(len);
        Ok(self.storage(region)?.erase(0, end).await?)
    }

    /// Copy `len` bytes starting at `offset` in `from` to the start of `to`.
    ///
    /// A final partial write is padded with the erased value.
    async fn copy(&mut self, from: Region, offset: u32, to: Region, len: u32) -> Result<(), Error<T::Error>> {
        defmt_or_log::assert!(CHUNK_SIZE.is_multiple_of(T::READ_SIZE) && CHUNK_SIZE.is_multiple_of(T::WRITE_SIZE));

        let mut buf = Aligned::<CHUNK_SIZE>::new();
        let mut done = 0u32;
        while done < len {
            let n = ((len - done) as usize).min(CHUNK_SIZE);
            let write_len = n.next_multiple_of(T::WRITE_SIZE);

            self.storage(from)?
                .read(offset + done, &mut buf.0[..n.next_multiple_of(T::READ_SIZE)])
                .await?;
            buf.0[n..write_len].fill(0xff);
            self.storage(to)?.write(done, &buf.0[..write_len]).await?;

            done += n as u32;
        }

        Ok(())
    }
}
