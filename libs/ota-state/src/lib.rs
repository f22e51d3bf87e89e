//! Persisted update state for the OTA engine: the [record::UpdateRecord] and the
//! power-loss safe [flash::FlashJournal] it lives in.
#![cfg_attr(not(feature = "_test"), no_std)]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod digest;
pub mod flash;
pub mod record;
