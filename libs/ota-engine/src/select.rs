use ota_state::record::{UpdateRecord, UpdateState};

/// Partition to execute on the next boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootTarget {
    Application,
    Backup,
}

/// Decide which partition holds the last known good image.
///
/// Only an interrupted commit makes the application partition untrustworthy;
/// in every other state it was either never touched or fully written and verified.
/// This is a pure function of the record, calling it repeatedly is harmless.
pub fn boot_target(record: Option<&UpdateRecord>) -> BootTarget {
    match record.map(|record| record.state) {
        Some(UpdateState::Committing) => BootTarget::Backup,
        _ => BootTarget::Application,
    }
}
