//! # Driftsync Store
//!
//! Embedded local store for Driftsync.
//!
//! This crate provides:
//! - Synced entity tables with atomic closure transactions
//! - Synchronous change capture into a durable outbox, with echo
//!   suppression for writes that originate from the sync engine
//! - Device cursor and tombstone tables beside the entity tables
//! - Durable device identity and hybrid-logical-clock state
//! - Snapshot persistence with an exclusive directory lock
//!
//! ## Key Invariants
//!
//! - A user-visible write and its pending operation commit in one
//!   transaction; a crash cannot separate them
//! - Record clocks only increase
//! - Cursors never regress
//! - The outbox never silently drops an operation

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod device;
mod dir;
mod error;
mod snapshot;
mod store;
mod types;

pub use config::StoreConfig;
pub use device::{DeviceIdentity, HlcClock};
pub use dir::StoreDir;
pub use error::{StoreError, StoreResult};
pub use store::{LocalStore, Transaction, WorkspaceState};
pub use types::{StoreStats, Tombstone, TombstoneKey};
