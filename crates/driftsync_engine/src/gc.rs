//! Tombstone garbage collection.
//!
//! Conservative, idle-scheduled reclamation. A tombstone is purged only
//! when its age exceeds the retention window AND every known device
//! cursor has advanced past its change-log position. A lagging or offline
//! device that has not yet observed a deletion keeps it alive.

use driftsync_protocol::WorkspaceId;
use driftsync_store::{LocalStore, TombstoneKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of one GC pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcOutcome {
    /// Tombstones purged.
    pub purged: usize,
    /// Tombstones retained for safety.
    pub retained: usize,
}

/// Reclaims tombstones once they are safe to forget.
pub struct TombstoneGc {
    store: Arc<LocalStore>,
    retention: Duration,
}

impl TombstoneGc {
    /// Creates a collector with the given retention window.
    pub fn new(store: Arc<LocalStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Runs one pass over a workspace's tombstones.
    pub fn run(&self, workspace: &WorkspaceId, now_ms: u64) -> GcOutcome {
        let cursors = self.store.known_cursors(workspace);
        // With no known cursors nothing is provably observed; purge nothing
        let min_cursor = cursors
            .iter()
            .map(|(_, cursor)| cursor.position())
            .min()
            .unwrap_or(0);

        let retention_ms = self.retention.as_millis() as u64;
        let mut purgeable: Vec<TombstoneKey> = Vec::new();
        let mut retained = 0usize;

        for (key, tombstone) in self.store.tombstones(workspace) {
            let old_enough = now_ms.saturating_sub(tombstone.deleted_at_ms) > retention_ms;
            // An unacknowledged tombstone has no change-log position yet
            // and is never purged
            let observed_everywhere = tombstone
                .server_version
                .map(|version| version <= min_cursor)
                .unwrap_or(false);

            if old_enough && observed_everywhere {
                purgeable.push(key);
            } else {
                retained += 1;
            }
        }

        let purged = self.store.purge_tombstones(&purgeable);
        if purged > 0 {
            debug!(workspace = %workspace, purged, retained, "gc pass complete");
        }
        GcOutcome { purged, retained }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_protocol::Cursor;
    use serde_json::Map;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn ws() -> WorkspaceId {
        WorkspaceId::new("ws1")
    }

    /// Creates a store holding one synced tombstone at change-log
    /// position 5, deleted at time zero.
    fn store_with_tombstone() -> (Arc<LocalStore>, TombstoneKey) {
        let store = Arc::new(LocalStore::open_in_memory());
        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", Map::new())?;
                txn.delete(&ws(), "threads", "t1")?;
                Ok(())
            })
            .unwrap();
        let key = TombstoneKey {
            workspace_id: ws(),
            table: "threads".into(),
            primary_key: "t1".into(),
        };
        store.note_tombstone_version(&key, 5);
        (store, key)
    }

    fn far_future(store: &LocalStore, key: &TombstoneKey) -> u64 {
        store.tombstone(key).unwrap().deleted_at_ms + 30 * DAY_MS
    }

    #[test]
    fn purges_old_observed_tombstones() {
        let (store, key) = store_with_tombstone();
        store.advance_cursor(&ws(), store.device_id(), Cursor::new(10));

        let gc = TombstoneGc::new(Arc::clone(&store), Duration::from_millis(DAY_MS));
        let outcome = gc.run(&ws(), far_future(&store, &key));

        assert_eq!(outcome, GcOutcome { purged: 1, retained: 0 });
        assert!(store.tombstone(&key).is_none());
    }

    #[test]
    fn young_tombstones_survive() {
        let (store, key) = store_with_tombstone();
        store.advance_cursor(&ws(), store.device_id(), Cursor::new(10));

        let gc = TombstoneGc::new(Arc::clone(&store), Duration::from_millis(DAY_MS));
        let now = store.tombstone(&key).unwrap().deleted_at_ms + 1;
        let outcome = gc.run(&ws(), now);

        assert_eq!(outcome.purged, 0);
        assert!(store.tombstone(&key).is_some());
    }

    #[test]
    fn lagging_cursor_keeps_tombstones_alive() {
        let (store, key) = store_with_tombstone();
        // A device is still behind the tombstone's position
        store.advance_cursor(&ws(), store.device_id(), Cursor::new(3));

        let gc = TombstoneGc::new(Arc::clone(&store), Duration::from_millis(DAY_MS));
        let outcome = gc.run(&ws(), far_future(&store, &key));

        assert_eq!(outcome.purged, 0);
        assert!(store.tombstone(&key).is_some());
    }

    #[test]
    fn unacknowledged_tombstones_are_never_purged() {
        let store = Arc::new(LocalStore::open_in_memory());
        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", Map::new())?;
                txn.delete(&ws(), "threads", "t1")?;
                Ok(())
            })
            .unwrap();
        store.advance_cursor(&ws(), store.device_id(), Cursor::new(100));

        let gc = TombstoneGc::new(Arc::clone(&store), Duration::from_millis(DAY_MS));
        // server_version is still None: purge nothing, ever
        let outcome = gc.run(&ws(), u64::MAX / 2);

        assert_eq!(outcome.purged, 0);
        assert_eq!(outcome.retained, 1);
    }
}
