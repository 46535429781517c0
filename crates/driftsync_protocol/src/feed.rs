//! Remote change stream types.

use crate::hlc::Hlc;
use crate::record::EntityEnvelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Position in a workspace's remote change stream.
///
/// Cursors are per-device watermarks: created on first sync, advanced
/// monotonically after each applied batch, never regressed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    /// The position before any change.
    pub const ZERO: Cursor = Cursor(0);

    /// Creates a cursor at the given stream position.
    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    /// Returns the raw position.
    pub const fn position(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor:{}", self.0)
    }
}

/// One entry of the remote change log, as consumed via pull.
///
/// Appended on every accepted push, read-only to pull consumers, and
/// eligible for retention pruning once all known device cursors have
/// advanced past it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Strictly increasing position within the workspace stream.
    pub server_version: u64,
    /// Table the record lives in.
    pub table: String,
    /// Primary key of the record.
    pub primary_key: String,
    /// Idempotency key of the originating operation, for echo suppression.
    pub op_id: Uuid,
    /// Record clock of the originating operation.
    pub clock: u64,
    /// Causal timestamp of the originating operation.
    pub hlc: Hlc,
    /// The record version, or `None` for a tombstone marker.
    pub envelope: Option<EntityEnvelope>,
}

impl ChangeLogEntry {
    /// Returns true if this entry marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        match &self.envelope {
            Some(envelope) => envelope.deleted,
            None => true,
        }
    }

    /// Returns the ordering stamp of the change.
    pub fn stamp(&self) -> crate::record::VersionStamp {
        crate::record::VersionStamp {
            clock: self.clock,
            hlc: self.hlc,
            op_id: self.op_id,
        }
    }
}

/// One page of pulled changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Changes in strictly increasing `server_version` order.
    pub changes: Vec<ChangeLogEntry>,
    /// Cursor to resume from after applying this page.
    pub next_cursor: Cursor,
    /// Whether more changes are immediately available.
    pub has_more: bool,
}

impl ChangeBatch {
    /// An empty page at the given cursor.
    pub fn empty(cursor: Cursor) -> Self {
        Self {
            changes: Vec::new(),
            next_cursor: cursor,
            has_more: false,
        }
    }
}

/// A push that the remote refused to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedOp {
    /// The refused operation.
    pub op_id: Uuid,
    /// Machine-readable reason, see [`crate::reject_reason`].
    pub reason: String,
}

/// Outcome of pushing a batch.
///
/// Every pushed operation appears in exactly one of the two lists; an
/// operation in neither was not received and stays pending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushReceipt {
    /// Operations applied (or already applied earlier) by the remote.
    pub acked: Vec<Uuid>,
    /// Operations refused, with reasons.
    pub rejected: Vec<RejectedOp>,
}

impl PushReceipt {
    /// A receipt acknowledging every listed operation.
    pub fn all_acked(op_ids: Vec<Uuid>) -> Self {
        Self {
            acked: op_ids,
            rejected: Vec::new(),
        }
    }
}
