//! Outbox operations.

use crate::hlc::{DeviceId, Hlc};
use crate::record::{EntityEnvelope, VersionStamp, WorkspaceId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a pending operation does, discriminated by kind.
///
/// Operations are a closed tagged union, not an open dictionary: every
/// outbox entry is either a whole-record upsert or a deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    /// Write the full record version.
    Upsert {
        /// The record version to write.
        envelope: EntityEnvelope,
    },
    /// Delete the record, stamped so deletion participates in ordering.
    Delete {
        /// Per-record write counter at deletion time.
        clock: u64,
        /// Causal timestamp of the deletion.
        hlc: Hlc,
    },
}

/// Transmission state of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Awaiting transmission.
    Pending,
    /// Handed to the provider, acknowledgment outstanding.
    Sending,
    /// Exhausted retries or rejected; surfaced to the caller, never dropped.
    Failed,
}

/// One not-yet-acknowledged local mutation.
///
/// Created in the same local transaction as the user-visible write it
/// represents, and removed from the outbox only after the remote confirms
/// receipt of this exact `op_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Idempotency key for this mutation.
    pub op_id: Uuid,
    /// Device that produced the mutation.
    pub device_id: DeviceId,
    /// Isolation scope of the mutation.
    pub workspace_id: WorkspaceId,
    /// Table the record lives in.
    pub table: String,
    /// Primary key of the record.
    pub primary_key: String,
    /// Upsert or delete.
    pub kind: OperationKind,
    /// Wall-clock milliseconds at enqueue time.
    pub enqueued_at_ms: u64,
    /// Transmission attempts so far.
    pub attempts: u32,
    /// Transmission state.
    pub status: OperationStatus,
    /// Backoff gate: not eligible for transmission before this time.
    pub not_before_ms: u64,
}

impl PendingOperation {
    /// Creates a pending upsert for the given record version.
    pub fn upsert(device_id: DeviceId, table: impl Into<String>, envelope: EntityEnvelope) -> Self {
        Self {
            op_id: envelope.op_id,
            device_id,
            workspace_id: envelope.workspace_id.clone(),
            table: table.into(),
            primary_key: envelope.id.clone(),
            enqueued_at_ms: envelope.hlc.physical_ms,
            kind: OperationKind::Upsert { envelope },
            attempts: 0,
            status: OperationStatus::Pending,
            not_before_ms: 0,
        }
    }

    /// Creates a pending deletion.
    pub fn delete(
        op_id: Uuid,
        device_id: DeviceId,
        workspace_id: WorkspaceId,
        table: impl Into<String>,
        primary_key: impl Into<String>,
        clock: u64,
        hlc: Hlc,
    ) -> Self {
        Self {
            op_id,
            device_id,
            workspace_id,
            table: table.into(),
            primary_key: primary_key.into(),
            kind: OperationKind::Delete { clock, hlc },
            enqueued_at_ms: hlc.physical_ms,
            attempts: 0,
            status: OperationStatus::Pending,
            not_before_ms: 0,
        }
    }

    /// Returns the ordering stamp of the version this operation writes.
    pub fn stamp(&self) -> VersionStamp {
        match &self.kind {
            OperationKind::Upsert { envelope } => envelope.stamp(),
            OperationKind::Delete { clock, hlc } => VersionStamp {
                clock: *clock,
                hlc: *hlc,
                op_id: self.op_id,
            },
        }
    }

    /// Returns the causal timestamp of this operation.
    pub fn hlc(&self) -> Hlc {
        match &self.kind {
            OperationKind::Upsert { envelope } => envelope.hlc,
            OperationKind::Delete { hlc, .. } => *hlc,
        }
    }

    /// Returns true if this operation deletes its record.
    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OperationKind::Delete { .. })
    }

    /// Returns true if the operation is eligible for transmission at `now_ms`.
    ///
    /// Failed operations are out of the retry cycle until the caller
    /// intervenes; `Sending` operations await an acknowledgment.
    pub fn is_ready(&self, now_ms: u64) -> bool {
        self.status == OperationStatus::Pending && self.not_before_ms <= now_ms
    }
}
