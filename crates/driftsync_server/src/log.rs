//! Per-workspace change log.

use crate::error::{ServerError, ServerResult};
use driftsync_protocol::{
    reject_reason, ChangeLogEntry, OperationKind, PendingOperation, PushReceipt, RejectedOp,
    VersionStamp,
};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A retained change-log row.
#[derive(Debug, Clone)]
struct LogRow {
    /// Wall-clock milliseconds when the row was appended.
    appended_at_ms: u64,
    /// The change itself.
    entry: ChangeLogEntry,
}

/// The authoritative, append-only change log of one workspace.
///
/// # Invariants
///
/// - `server_version` is strictly increasing, assigned at append
/// - An `op_id` is applied at most once; replays re-ack without effect
/// - A push that is not strictly newer than the stored head for its key
///   is rejected as stale, never silently applied
/// - Pruning never removes the current head entry of a live key, so a
///   full-state snapshot is always possible
#[derive(Debug, Default)]
pub struct WorkspaceLog {
    rows: Vec<LogRow>,
    next_version: u64,
    /// Highest version removed by pruning; cursors below it are expired.
    base_version: u64,
    /// Latest accepted stamp and version per (table, primary key).
    heads: HashMap<(String, String), (VersionStamp, u64)>,
    /// Every op_id ever applied, for idempotent replay.
    applied_ops: HashSet<Uuid>,
}

impl WorkspaceLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            next_version: 1,
            base_version: 0,
            heads: HashMap::new(),
            applied_ops: HashSet::new(),
        }
    }

    /// Highest assigned version.
    pub fn head_version(&self) -> u64 {
        self.next_version - 1
    }

    /// Lowest version still served.
    pub fn oldest_retained(&self) -> u64 {
        self.base_version + 1
    }

    /// Number of retained rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if no rows are retained.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends a batch of client operations.
    ///
    /// Returns the receipt and the entries that were newly accepted, in
    /// assignment order, for subscriber fan-out.
    pub fn append(
        &mut self,
        ops: &[PendingOperation],
        now_ms: u64,
    ) -> (PushReceipt, Vec<ChangeLogEntry>) {
        let mut receipt = PushReceipt::default();
        let mut accepted = Vec::new();

        for op in ops {
            // Idempotent replay: already applied, re-ack without effect
            if self.applied_ops.contains(&op.op_id) {
                receipt.acked.push(op.op_id);
                continue;
            }

            let key = (op.table.clone(), op.primary_key.clone());
            let incoming = op.stamp();
            if let Some((head, _)) = self.heads.get(&key) {
                if incoming <= *head {
                    receipt.rejected.push(RejectedOp {
                        op_id: op.op_id,
                        reason: reject_reason::STALE_VERSION.into(),
                    });
                    continue;
                }
            }

            let server_version = self.next_version;
            self.next_version += 1;

            let entry = ChangeLogEntry {
                server_version,
                table: op.table.clone(),
                primary_key: op.primary_key.clone(),
                op_id: op.op_id,
                clock: incoming.clock,
                hlc: incoming.hlc,
                envelope: match &op.kind {
                    OperationKind::Upsert { envelope } => Some(envelope.clone()),
                    OperationKind::Delete { .. } => None,
                },
            };

            self.heads.insert(key, (incoming, server_version));
            self.applied_ops.insert(op.op_id);
            self.rows.push(LogRow {
                appended_at_ms: now_ms,
                entry: entry.clone(),
            });
            accepted.push(entry);
            receipt.acked.push(op.op_id);
        }

        (receipt, accepted)
    }

    /// Returns one page of changes after `cursor`.
    ///
    /// Errors with `CursorExpired` when retention has pruned past the
    /// requested position.
    pub fn page_after(
        &self,
        cursor: u64,
        limit: usize,
    ) -> ServerResult<(Vec<ChangeLogEntry>, u64, bool)> {
        if cursor < self.base_version {
            return Err(ServerError::CursorExpired {
                oldest_retained: self.oldest_retained(),
            });
        }

        let mut page: Vec<ChangeLogEntry> = Vec::new();
        let mut remaining = false;
        for row in &self.rows {
            if row.entry.server_version <= cursor {
                continue;
            }
            if page.len() == limit {
                remaining = true;
                break;
            }
            page.push(row.entry.clone());
        }

        let next_cursor = page
            .last()
            .map(|entry| entry.server_version)
            .unwrap_or(cursor);
        Ok((page, next_cursor, remaining))
    }

    /// Returns the complete current state: the head entry of every key.
    ///
    /// Used by rescans after a cursor expiry. Entries come back in
    /// `server_version` order; the accompanying cursor is the head.
    pub fn snapshot(&self) -> (Vec<ChangeLogEntry>, u64) {
        let mut entries: Vec<ChangeLogEntry> = self
            .rows
            .iter()
            .filter(|row| {
                let key = (row.entry.table.clone(), row.entry.primary_key.clone());
                self.heads
                    .get(&key)
                    .map(|(_, version)| *version == row.entry.server_version)
                    .unwrap_or(false)
            })
            .map(|row| row.entry.clone())
            .collect();
        entries.sort_by_key(|entry| entry.server_version);
        (entries, self.head_version())
    }

    /// Prunes rows every known device cursor has passed.
    ///
    /// A row is removed only when it is older than `retention_ms`, at or
    /// below `min_cursor`, and not the current head of its key. Returns
    /// how many rows were pruned.
    pub fn prune(&mut self, min_cursor: u64, now_ms: u64, retention_ms: u64) -> usize {
        let heads = &self.heads;
        let mut pruned_max = self.base_version;
        let before = self.rows.len();

        self.rows.retain(|row| {
            let key = (row.entry.table.clone(), row.entry.primary_key.clone());
            let is_head = heads
                .get(&key)
                .map(|(_, version)| *version == row.entry.server_version)
                .unwrap_or(false);
            let observed = row.entry.server_version <= min_cursor;
            let aged = now_ms.saturating_sub(row.appended_at_ms) > retention_ms;

            if !is_head && observed && aged {
                pruned_max = pruned_max.max(row.entry.server_version);
                false
            } else {
                true
            }
        });

        self.base_version = pruned_max;
        before - self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_protocol::{DeviceId, EntityEnvelope, Hlc, WorkspaceId};
    use serde_json::Map;

    fn device(byte: u8) -> DeviceId {
        DeviceId::from_uuid(Uuid::from_bytes([byte; 16]))
    }

    fn upsert(pk: &str, clock: u64, physical_ms: u64, op: u8) -> PendingOperation {
        let envelope = EntityEnvelope::new(
            pk,
            WorkspaceId::new("ws1"),
            clock,
            Hlc::new(physical_ms, device(1)),
            Uuid::from_bytes([op; 16]),
            Map::new(),
        );
        PendingOperation::upsert(device(1), "threads", envelope)
    }

    fn delete(pk: &str, clock: u64, physical_ms: u64, op: u8) -> PendingOperation {
        PendingOperation::delete(
            Uuid::from_bytes([op; 16]),
            device(1),
            WorkspaceId::new("ws1"),
            "threads",
            pk,
            clock,
            Hlc::new(physical_ms, device(1)),
        )
    }

    #[test]
    fn append_assigns_increasing_versions() {
        let mut log = WorkspaceLog::new();
        let (receipt, accepted) =
            log.append(&[upsert("a", 1, 100, 1), upsert("b", 1, 101, 2)], 0);

        assert_eq!(receipt.acked.len(), 2);
        assert_eq!(accepted[0].server_version, 1);
        assert_eq!(accepted[1].server_version, 2);
        assert_eq!(log.head_version(), 2);
    }

    #[test]
    fn replayed_op_ids_reack_without_effect() {
        let mut log = WorkspaceLog::new();
        let op = upsert("a", 1, 100, 1);

        log.append(std::slice::from_ref(&op), 0);
        let before = log.len();

        let (receipt, accepted) = log.append(std::slice::from_ref(&op), 0);
        assert_eq!(receipt.acked, vec![op.op_id]);
        assert!(accepted.is_empty());
        assert_eq!(log.len(), before);
        assert_eq!(log.head_version(), 1);
    }

    #[test]
    fn stale_push_is_rejected() {
        let mut log = WorkspaceLog::new();
        log.append(&[upsert("a", 2, 200, 1)], 0);

        // Another device pushes clock 1 for the same key
        let (receipt, accepted) = log.append(&[upsert("a", 1, 300, 2)], 0);
        assert!(accepted.is_empty());
        assert_eq!(receipt.rejected.len(), 1);
        assert_eq!(receipt.rejected[0].reason, reject_reason::STALE_VERSION);
    }

    #[test]
    fn deletes_append_tombstone_entries() {
        let mut log = WorkspaceLog::new();
        log.append(&[upsert("a", 1, 100, 1)], 0);
        let (receipt, accepted) = log.append(&[delete("a", 2, 200, 2)], 0);

        assert_eq!(receipt.acked.len(), 1);
        assert!(accepted[0].envelope.is_none());
        assert_eq!(accepted[0].clock, 2);
    }

    #[test]
    fn paging_after_cursor() {
        let mut log = WorkspaceLog::new();
        for i in 0..5u8 {
            log.append(&[upsert(&format!("r{i}"), 1, 100 + u64::from(i), i + 1)], 0);
        }

        let (page, next, has_more) = log.page_after(0, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(next, 2);
        assert!(has_more);

        let (page, next, has_more) = log.page_after(next, 10).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(next, 5);
        assert!(!has_more);

        let (page, next, _) = log.page_after(5, 10).unwrap();
        assert!(page.is_empty());
        assert_eq!(next, 5);
    }

    #[test]
    fn snapshot_returns_heads_only() {
        let mut log = WorkspaceLog::new();
        log.append(&[upsert("a", 1, 100, 1)], 0);
        log.append(&[upsert("a", 2, 200, 2)], 0);
        log.append(&[upsert("b", 1, 300, 3)], 0);

        let (entries, cursor) = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(cursor, 3);
        // The superseded version of "a" is absent
        assert!(entries.iter().all(|e| e.server_version != 1));
    }

    #[test]
    fn prune_respects_cursor_retention_and_heads() {
        let mut log = WorkspaceLog::new();
        log.append(&[upsert("a", 1, 100, 1)], 0);
        log.append(&[upsert("a", 2, 200, 2)], 0);
        log.append(&[upsert("b", 1, 300, 3)], 0);

        // Cursor has not passed version 1: nothing prunable
        assert_eq!(log.prune(0, u64::MAX / 2, 1000), 0);

        // Cursor passed everything, but heads survive
        let pruned = log.prune(3, u64::MAX / 2, 1000);
        assert_eq!(pruned, 1);
        assert_eq!(log.len(), 2);

        // Pulling from before the pruned range now signals expiry
        assert!(matches!(
            log.page_after(0, 10),
            Err(ServerError::CursorExpired { .. })
        ));
        assert!(log.page_after(1, 10).is_ok());
    }

    #[test]
    fn young_rows_survive_pruning() {
        let mut log = WorkspaceLog::new();
        log.append(&[upsert("a", 1, 100, 1)], 1_000);
        log.append(&[upsert("a", 2, 200, 2)], 1_000);

        // Aged check fails: appended too recently
        assert_eq!(log.prune(2, 1_500, 1_000), 0);
        assert_eq!(log.len(), 2);
    }
}
