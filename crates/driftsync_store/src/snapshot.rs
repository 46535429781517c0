//! Snapshot persistence for the store state.

use crate::error::StoreResult;
use crate::store::StoreState;
use crate::types::{Tombstone, TombstoneKey};
use driftsync_protocol::{Cursor, DeviceId, EntityEnvelope, PendingOperation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of the whole store state.
///
/// One JSON document: entity tables partitioned by workspace, the outbox,
/// device cursors, and tombstones. Written atomically via a temp file
/// rename so a crash never leaves a torn snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoreSnapshot {
    /// Format version for forward compatibility.
    pub version: u32,
    /// workspace -> table -> primary key -> record.
    pub workspaces: BTreeMap<String, BTreeMap<String, BTreeMap<String, EntityEnvelope>>>,
    /// Pending operations in insertion order.
    pub outbox: Vec<PendingOperation>,
    /// workspace -> device UUID -> cursor position.
    pub cursors: BTreeMap<String, BTreeMap<String, u64>>,
    /// Tombstones with their keys.
    pub tombstones: Vec<(TombstoneKey, Tombstone)>,
}

impl StoreSnapshot {
    /// Captures the in-memory state.
    pub fn capture(state: &StoreState) -> Self {
        let mut cursors: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for ((workspace, device), cursor) in &state.cursors {
            cursors
                .entry(workspace.clone())
                .or_default()
                .insert(device.as_uuid().simple().to_string(), cursor.position());
        }

        Self {
            version: SNAPSHOT_VERSION,
            workspaces: state.workspaces.clone(),
            outbox: state.outbox.clone(),
            cursors,
            tombstones: state
                .tombstones
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Rebuilds in-memory state from the snapshot.
    pub fn restore(self) -> StoreState {
        let mut cursors = BTreeMap::new();
        for (workspace, devices) in self.cursors {
            for (device, position) in devices {
                if let Ok(uuid) = Uuid::parse_str(&device) {
                    cursors.insert(
                        (workspace.clone(), DeviceId::from_uuid(uuid)),
                        Cursor::new(position),
                    );
                }
            }
        }

        StoreState {
            workspaces: self.workspaces,
            outbox: self.outbox,
            cursors,
            tombstones: self.tombstones.into_iter().collect(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes from bytes.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
