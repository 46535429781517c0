//! Server facade: workspaces, cursors, subscribers.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::log::WorkspaceLog;
use driftsync_protocol::{
    ChangeBatch, Cursor, DeviceId, PendingOperation, PushReceipt, SyncScope,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Callback invoked with each accepted change batch.
pub type ServerChangeCallback = Arc<dyn Fn(ChangeBatch) + Send + Sync>;

/// Handle identifying one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    workspace: String,
    callback: ServerChangeCallback,
}

/// The authoritative remote store.
///
/// Holds one change log per workspace, a registry of the cursors devices
/// have been served (which bounds safe pruning), and realtime
/// subscribers.
pub struct SyncServer {
    config: ServerConfig,
    logs: RwLock<HashMap<String, WorkspaceLog>>,
    /// (workspace, device) -> last served cursor.
    cursors: RwLock<HashMap<(String, DeviceId), u64>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: Mutex<u64>,
}

impl SyncServer {
    /// Creates a server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            logs: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: Mutex::new(1),
        }
    }

    /// Accepts a push batch.
    ///
    /// Accepted operations are appended to the workspace log and fanned
    /// out to subscribers; replayed `op_id`s are re-acked without effect;
    /// stale versions are rejected.
    pub fn handle_push(
        &self,
        scope: &SyncScope,
        ops: &[PendingOperation],
    ) -> ServerResult<PushReceipt> {
        let (receipt, accepted) = {
            let mut logs = self.logs.write();
            let log = logs
                .entry(scope.workspace_id.as_str().to_string())
                .or_default();
            log.append(ops, now_ms())
        };

        if !accepted.is_empty() {
            debug!(
                workspace = %scope.workspace_id,
                accepted = accepted.len(),
                "push accepted"
            );
            let next_cursor = accepted
                .last()
                .map(|entry| Cursor::new(entry.server_version))
                .unwrap_or(Cursor::ZERO);
            let batch = ChangeBatch {
                changes: accepted,
                next_cursor,
                has_more: false,
            };
            for subscriber in self.subscribers.lock().iter() {
                if subscriber.workspace == scope.workspace_id.as_str() {
                    (subscriber.callback)(batch.clone());
                }
            }
        }

        Ok(receipt)
    }

    /// Serves a pull.
    ///
    /// With a cursor: one page of changes after it, or `CursorExpired`
    /// once retention has pruned past it. Without a cursor: the complete
    /// current state, for rescans. Either way the device's served cursor
    /// is recorded in the registry.
    pub fn handle_pull(
        &self,
        scope: &SyncScope,
        cursor: Option<Cursor>,
        table_filter: Option<&[String]>,
    ) -> ServerResult<ChangeBatch> {
        let logs = self.logs.read();
        let Some(log) = logs.get(scope.workspace_id.as_str()) else {
            return Ok(ChangeBatch::empty(cursor.unwrap_or(Cursor::ZERO)));
        };

        let (mut changes, next_cursor, has_more) = match cursor {
            Some(cursor) => log.page_after(cursor.position(), self.config.page_limit)?,
            None => {
                let (entries, head) = log.snapshot();
                (entries, head, false)
            }
        };
        drop(logs);

        if let Some(filter) = table_filter {
            changes.retain(|entry| filter.iter().any(|table| *table == entry.table));
        }

        self.record_cursor(scope, next_cursor);
        Ok(ChangeBatch {
            changes,
            next_cursor: Cursor::new(next_cursor),
            has_more,
        })
    }

    /// Registers a realtime subscriber for a workspace.
    pub fn subscribe(&self, scope: &SyncScope, callback: ServerChangeCallback) -> SubscriberId {
        let mut next = self.next_subscriber.lock();
        let id = SubscriberId(*next);
        *next += 1;

        self.subscribers.lock().push(Subscriber {
            id,
            workspace: scope.workspace_id.as_str().to_string(),
            callback,
        });
        id
    }

    /// Removes a subscriber.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Prunes one workspace's change log.
    ///
    /// A row is removed only once every known device cursor has passed it
    /// and the retention window elapsed. With no registered cursors
    /// nothing is pruned.
    pub fn prune(&self, workspace: &str) -> usize {
        let min_cursor = {
            let cursors = self.cursors.read();
            let known: Vec<u64> = cursors
                .iter()
                .filter(|((ws, _), _)| ws == workspace)
                .map(|(_, cursor)| *cursor)
                .collect();
            match known.iter().min() {
                Some(min) => *min,
                None => return 0,
            }
        };

        let retention_ms = self.config.retention.as_millis() as u64;
        let mut logs = self.logs.write();
        match logs.get_mut(workspace) {
            Some(log) => log.prune(min_cursor, now_ms(), retention_ms),
            None => 0,
        }
    }

    /// Number of retained change-log rows for a workspace.
    pub fn change_count(&self, workspace: &str) -> usize {
        self.logs
            .read()
            .get(workspace)
            .map(|log| log.len())
            .unwrap_or(0)
    }

    /// Head version of a workspace's log.
    pub fn head_version(&self, workspace: &str) -> u64 {
        self.logs
            .read()
            .get(workspace)
            .map(|log| log.head_version())
            .unwrap_or(0)
    }

    /// The registry's view of a device's cursor.
    pub fn device_cursor(&self, scope: &SyncScope) -> u64 {
        self.cursors
            .read()
            .get(&(scope.workspace_id.as_str().to_string(), scope.device_id))
            .copied()
            .unwrap_or(0)
    }

    fn record_cursor(&self, scope: &SyncScope, cursor: u64) {
        let mut cursors = self.cursors.write();
        let entry = cursors
            .entry((scope.workspace_id.as_str().to_string(), scope.device_id))
            .or_insert(0);
        if cursor > *entry {
            *entry = cursor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use driftsync_protocol::{DeviceId, EntityEnvelope, Hlc, WorkspaceId};
    use serde_json::Map;
    use std::time::Duration;
    use uuid::Uuid;

    fn device(byte: u8) -> DeviceId {
        DeviceId::from_uuid(Uuid::from_bytes([byte; 16]))
    }

    fn scope(dev: u8) -> SyncScope {
        SyncScope::new(WorkspaceId::new("ws1"), device(dev))
    }

    fn upsert(pk: &str, clock: u64, dev: u8) -> PendingOperation {
        let envelope = EntityEnvelope::new(
            pk,
            WorkspaceId::new("ws1"),
            clock,
            Hlc::new(100 * clock, device(dev)),
            Uuid::new_v4(),
            Map::new(),
        );
        PendingOperation::upsert(device(dev), "threads", envelope)
    }

    #[test]
    fn push_then_pull_roundtrip() {
        let server = SyncServer::new(ServerConfig::default());
        let receipt = server
            .handle_push(&scope(1), &[upsert("a", 1, 1), upsert("b", 1, 1)])
            .unwrap();
        assert_eq!(receipt.acked.len(), 2);

        let batch = server.handle_pull(&scope(2), Some(Cursor::ZERO), None).unwrap();
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.next_cursor, Cursor::new(2));
        assert!(!batch.has_more);
    }

    #[test]
    fn pull_records_device_cursor() {
        let server = SyncServer::new(ServerConfig::default());
        server.handle_push(&scope(1), &[upsert("a", 1, 1)]).unwrap();

        server.handle_pull(&scope(2), Some(Cursor::ZERO), None).unwrap();
        assert_eq!(server.device_cursor(&scope(2)), 1);
    }

    #[test]
    fn table_filter_limits_results() {
        let server = SyncServer::new(ServerConfig::default());
        server.handle_push(&scope(1), &[upsert("a", 1, 1)]).unwrap();

        let batch = server
            .handle_pull(
                &scope(2),
                Some(Cursor::ZERO),
                Some(&["projects".to_string()]),
            )
            .unwrap();
        assert!(batch.changes.is_empty());
    }

    #[test]
    fn subscribers_receive_accepted_batches() {
        let server = SyncServer::new(ServerConfig::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let id = server.subscribe(
            &scope(2),
            Arc::new(move |batch| {
                sink.lock().push(batch.changes.len());
            }),
        );

        server.handle_push(&scope(1), &[upsert("a", 1, 1)]).unwrap();
        assert_eq!(*received.lock(), vec![1]);

        server.unsubscribe(id);
        server.handle_push(&scope(1), &[upsert("b", 1, 1)]).unwrap();
        assert_eq!(*received.lock(), vec![1]);
        assert_eq!(server.subscriber_count(), 0);
    }

    #[test]
    fn prune_waits_for_every_cursor() {
        let server = SyncServer::new(
            ServerConfig::new().with_retention(Duration::ZERO),
        );
        server.handle_push(&scope(1), &[upsert("a", 1, 1)]).unwrap();
        server.handle_push(&scope(1), &[upsert("a", 2, 1)]).unwrap();

        // No cursors registered yet: nothing is provably observed
        assert_eq!(server.prune("ws1"), 0);

        server.handle_pull(&scope(2), Some(Cursor::ZERO), None).unwrap();
        assert_eq!(server.device_cursor(&scope(2)), 2);

        // Both registered devices have been served everything
        server.handle_pull(&scope(3), Some(Cursor::ZERO), None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(server.prune("ws1"), 1);

        // A fresh device pulling from zero is now behind retention
        let stale = server.handle_pull(&scope(4), Some(Cursor::ZERO), None);
        assert!(matches!(stale, Err(ServerError::CursorExpired { .. })));

        // Rescan path still serves the full current state
        let snapshot = server.handle_pull(&scope(4), None, None).unwrap();
        assert_eq!(snapshot.changes.len(), 1);
        assert_eq!(snapshot.next_cursor, Cursor::new(2));
    }

    #[test]
    fn snapshot_pull_on_unknown_workspace_is_empty() {
        let server = SyncServer::new(ServerConfig::default());
        let batch = server.handle_pull(&scope(1), None, None).unwrap();
        assert!(batch.changes.is_empty());
        assert_eq!(batch.next_cursor, Cursor::ZERO);
    }
}
