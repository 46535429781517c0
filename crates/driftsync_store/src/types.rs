//! Store-local type definitions.

use driftsync_protocol::{Hlc, VersionStamp, WorkspaceId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key identifying one tombstone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TombstoneKey {
    /// Isolation scope.
    pub workspace_id: WorkspaceId,
    /// Table the record lived in.
    pub table: String,
    /// Primary key of the deleted record.
    pub primary_key: String,
}

/// Durable proof that a record was deleted.
///
/// Upserted, never duplicated: repeated deletes of the same record do not
/// grow storage. Its presence blocks resurrection of the record by any
/// out-of-order or replayed upsert with an older stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    /// When the deletion happened, milliseconds since the Unix epoch.
    pub deleted_at_ms: u64,
    /// Record clock at deletion time.
    pub clock: u64,
    /// Causal timestamp of the deletion.
    pub hlc: Hlc,
    /// Idempotency key of the deleting operation.
    pub op_id: Uuid,
    /// Position of the deletion in the remote change log, once known.
    ///
    /// `None` until the remote acknowledges the deletion; GC never purges
    /// an unacknowledged tombstone.
    pub server_version: Option<u64>,
}

impl Tombstone {
    /// Returns the tombstone's ordering stamp.
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            clock: self.clock,
            hlc: self.hlc,
            op_id: self.op_id,
        }
    }
}

/// Point-in-time observability snapshot of the store.
///
/// Not part of correctness; consumed by status surfaces only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of entity tables.
    pub tables: usize,
    /// Total records across tables, deleted markers included.
    pub records: usize,
    /// Operations waiting in the outbox.
    pub pending_ops: usize,
    /// Operations marked failed and awaiting caller attention.
    pub failed_ops: usize,
    /// Tombstones retained.
    pub tombstones: usize,
}
