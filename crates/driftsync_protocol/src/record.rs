//! Synced record envelope and scope types.

use crate::hlc::{DeviceId, Hlc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Isolation scope for synced data.
///
/// All records, operations, and cursors are partitioned by workspace; no
/// engine component ever crosses workspace boundaries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Creates a workspace ID from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The opaque scope token handed to sync providers.
///
/// Workspace membership resolution is an external collaborator; the engine
/// treats the pair as an opaque partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncScope {
    /// Workspace being synced.
    pub workspace_id: WorkspaceId,
    /// Device doing the syncing.
    pub device_id: DeviceId,
}

impl SyncScope {
    /// Creates a new scope.
    pub fn new(workspace_id: WorkspaceId, device_id: DeviceId) -> Self {
        Self {
            workspace_id,
            device_id,
        }
    }
}

/// The ordering key of one record version.
///
/// Comparison is lexicographic over `(clock, hlc, op_id)`; the resolver
/// declares whichever version has the greater stamp the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionStamp {
    /// Per-record monotonic write counter.
    pub clock: u64,
    /// Causal timestamp of the write.
    pub hlc: Hlc,
    /// Idempotency key of the write, as a final deterministic tie-break.
    pub op_id: Uuid,
}

/// A synced entity record.
///
/// The envelope is the fixed field set shared between local storage and
/// the remote schema; table-specific fields ride in `fields` and are
/// opaque to the engine. Invariant: for a given `(workspace_id, id)` at
/// most one live value is authoritative at any point, and `clock` only
/// increases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEnvelope {
    /// Stable primary key.
    pub id: String,
    /// Isolation scope.
    pub workspace_id: WorkspaceId,
    /// Per-record monotonic write counter, incremented on every local write.
    pub clock: u64,
    /// Causal timestamp, tie-breaker after `clock`.
    pub hlc: Hlc,
    /// Idempotency key of the write that produced this version.
    pub op_id: Uuid,
    /// Whether this version is a deletion marker.
    pub deleted: bool,
    /// Wall-clock milliseconds of the last write.
    pub updated_at_ms: u64,
    /// Table-specific payload, opaque to the engine.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntityEnvelope {
    /// Creates a live record version.
    pub fn new(
        id: impl Into<String>,
        workspace_id: WorkspaceId,
        clock: u64,
        hlc: Hlc,
        op_id: Uuid,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id,
            clock,
            hlc,
            op_id,
            deleted: false,
            updated_at_ms: hlc.physical_ms,
            fields,
        }
    }

    /// Creates a deletion marker version.
    ///
    /// Deletions participate in the same ordering as upserts: a later
    /// delete beats an earlier upsert and vice versa.
    pub fn deletion(
        id: impl Into<String>,
        workspace_id: WorkspaceId,
        clock: u64,
        hlc: Hlc,
        op_id: Uuid,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id,
            clock,
            hlc,
            op_id,
            deleted: true,
            updated_at_ms: hlc.physical_ms,
            fields: Map::new(),
        }
    }

    /// Returns this version's ordering stamp.
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            clock: self.clock,
            hlc: self.hlc,
            op_id: self.op_id,
        }
    }
}
