//! # Driftsync Protocol
//!
//! Sync protocol types for Driftsync.
//!
//! This crate provides:
//! - `Hlc` hybrid logical clock timestamps with a total order across devices
//! - `EntityEnvelope` for synced records
//! - `PendingOperation` for outbox entries (tagged upsert/delete union)
//! - `ChangeLogEntry` and paging types for the remote change stream
//! - Wire field-name normalization (accept either casing, emit one)
//! - The pure last-writer-wins conflict resolver
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod feed;
mod hlc;
mod op;
mod record;
mod resolve;
mod wire;

pub use feed::{ChangeBatch, ChangeLogEntry, Cursor, PushReceipt, RejectedOp};
pub use hlc::{DeviceId, Hlc, HlcParseError};
pub use op::{OperationKind, OperationStatus, PendingOperation};
pub use record::{EntityEnvelope, SyncScope, VersionStamp, WorkspaceId};
pub use resolve::{order_key, resolve, Resolution};
pub use wire::{envelope_from_wire, envelope_to_wire, normalize_keys, reject_reason, WireError};
