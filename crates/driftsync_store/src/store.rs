//! Local store facade and transactions.

use crate::config::StoreConfig;
use crate::device::{now_ms, DeviceIdentity, HlcClock};
use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::snapshot::StoreSnapshot;
use crate::types::{StoreStats, Tombstone, TombstoneKey};
use driftsync_protocol::{
    Cursor, DeviceId, EntityEnvelope, OperationKind, OperationStatus, PendingOperation,
    VersionStamp, WorkspaceId,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// In-memory state behind the store lock.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    /// workspace -> table -> primary key -> record.
    pub(crate) workspaces: BTreeMap<String, BTreeMap<String, BTreeMap<String, EntityEnvelope>>>,
    /// Pending operations in insertion order.
    pub(crate) outbox: Vec<PendingOperation>,
    /// (workspace, device) -> cursor.
    pub(crate) cursors: BTreeMap<(String, DeviceId), Cursor>,
    /// Tombstones by key.
    pub(crate) tombstones: BTreeMap<TombstoneKey, Tombstone>,
}

/// Staged replacement state for one workspace, swapped in atomically.
///
/// Built off to the side during a rescan so readers never observe a
/// partially reconciled view.
#[derive(Debug, Default)]
pub struct WorkspaceState {
    /// table -> primary key -> record.
    pub tables: BTreeMap<String, BTreeMap<String, EntityEnvelope>>,
    /// Tombstones for the workspace.
    pub tombstones: Vec<(TombstoneKey, Tombstone)>,
    /// Cursor watermark the state corresponds to.
    pub cursor: Cursor,
}

/// The embedded local store.
///
/// `LocalStore` holds the synced entity tables together with the persisted
/// sync state: the outbox, device cursors, and tombstones. All writes go
/// through closure transactions; a transaction's effects commit atomically
/// or not at all, so a crash cannot separate an entity write from its
/// pending operation or tombstone.
///
/// # Example
///
/// ```rust,ignore
/// use driftsync_store::{LocalStore, StoreConfig};
///
/// let store = LocalStore::open(Path::new("device_db"), StoreConfig::default())?;
/// let ws = WorkspaceId::new("ws1");
/// store.transaction(|txn| {
///     txn.put(&ws, "threads", "t1", fields)?;
///     Ok(())
/// })?;
/// ```
pub struct LocalStore {
    config: StoreConfig,
    dir: Option<StoreDir>,
    identity: DeviceIdentity,
    clock: HlcClock,
    /// Serializes whole transactions; commit takes the inner write lock.
    txn_lock: Mutex<()>,
    inner: RwLock<StoreState>,
}

impl LocalStore {
    /// Opens a store from a directory path.
    pub fn open(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let identity = DeviceIdentity::load_or_create(&dir)?;

        let mut state = match dir.read_snapshot()? {
            Some(bytes) => StoreSnapshot::from_bytes(&bytes)?.restore(),
            None => StoreState::default(),
        };
        // A crash mid-push leaves operations marked sending; they were
        // never acknowledged, so they go back to pending.
        requeue_in_flight(&mut state);
        info!(
            path = %path.display(),
            pending = state.outbox.len(),
            "store opened"
        );

        Ok(Self {
            config,
            dir: Some(dir),
            clock: HlcClock::new(identity.last_hlc),
            identity,
            txn_lock: Mutex::new(()),
            inner: RwLock::new(state),
        })
    }

    /// Opens an in-memory store with default configuration.
    pub fn open_in_memory() -> Self {
        Self::open_in_memory_with_config(StoreConfig::default())
    }

    /// Opens an in-memory store with the given configuration.
    pub fn open_in_memory_with_config(config: StoreConfig) -> Self {
        let identity = DeviceIdentity::generate();
        Self {
            config,
            dir: None,
            clock: HlcClock::new(identity.last_hlc),
            identity,
            txn_lock: Mutex::new(()),
            inner: RwLock::new(StoreState::default()),
        }
    }

    /// Returns this device's stable identity.
    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id
    }

    /// Returns the device's hybrid logical clock.
    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    /// Runs a closure inside an atomic transaction.
    ///
    /// Effects staged by the closure commit together when it returns `Ok`;
    /// on `Err` nothing is applied. Transactions are serialized.
    pub fn transaction<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> StoreResult<T>,
    {
        let _serial = self.txn_lock.lock();
        let mut txn = Transaction::new(self);
        let value = f(&mut txn)?;
        self.commit(txn)?;
        Ok(value)
    }

    fn commit(&self, txn: Transaction<'_>) -> StoreResult<()> {
        let mut state = self.inner.write();

        // Plan outbox changes against a scratch copy first so a capacity
        // refusal leaves the whole transaction unapplied.
        let mut outbox = state.outbox.clone();
        for op in txn.staged_ops {
            if let Some(slot) = coalesce_slot(&mut outbox, &op) {
                // Latest payload at the earliest op's queue position.
                if let OperationKind::Upsert { envelope } = op.kind {
                    slot.kind = OperationKind::Upsert { envelope };
                }
                continue;
            }
            if outbox.len() >= self.config.outbox_capacity {
                return Err(StoreError::OutboxFull {
                    capacity: self.config.outbox_capacity,
                });
            }
            outbox.push(op);
        }
        state.outbox = outbox;

        for (workspace, table, primary_key) in txn.staged_removals {
            if let Some(tables) = state.workspaces.get_mut(workspace.as_str()) {
                if let Some(records) = tables.get_mut(&table) {
                    records.remove(&primary_key);
                }
            }
        }

        for (table, envelope) in txn.staged_records {
            state
                .workspaces
                .entry(envelope.workspace_id.as_str().to_string())
                .or_default()
                .entry(table)
                .or_default()
                .insert(envelope.id.clone(), envelope);
        }

        for key in txn.staged_tombstone_removals {
            state.tombstones.remove(&key);
        }
        for (key, tombstone) in txn.staged_tombstones {
            state.tombstones.insert(key, tombstone);
        }

        for (workspace, device, cursor) in txn.staged_cursors {
            let entry = state
                .cursors
                .entry((workspace.as_str().to_string(), device))
                .or_insert(Cursor::ZERO);
            // Cursors never regress
            if cursor > *entry {
                *entry = cursor;
            }
        }

        if self.config.persist_on_commit {
            self.persist(&state)?;
        }
        Ok(())
    }

    fn persist(&self, state: &StoreState) -> StoreResult<()> {
        if let Some(dir) = &self.dir {
            let bytes = StoreSnapshot::capture(state).to_bytes()?;
            dir.write_snapshot(&bytes)?;

            let mut identity = self.identity.clone();
            identity.last_hlc = self.clock.last();
            identity.save(dir)?;
        }
        Ok(())
    }

    /// Writes the current state to disk, if the store is file-backed.
    pub fn save(&self) -> StoreResult<()> {
        let state = self.inner.read();
        self.persist(&state)
    }

    // ---- records ----------------------------------------------------

    /// Reads a record.
    pub fn get(
        &self,
        workspace: &WorkspaceId,
        table: &str,
        primary_key: &str,
    ) -> Option<EntityEnvelope> {
        self.inner
            .read()
            .workspaces
            .get(workspace.as_str())
            .and_then(|tables| tables.get(table))
            .and_then(|records| records.get(primary_key))
            .cloned()
    }

    /// Lists all records of a table within a workspace.
    pub fn list(&self, workspace: &WorkspaceId, table: &str) -> Vec<EntityEnvelope> {
        self.inner
            .read()
            .workspaces
            .get(workspace.as_str())
            .and_then(|tables| tables.get(table))
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Lists the workspaces with any local records.
    pub fn workspaces(&self) -> Vec<WorkspaceId> {
        self.inner
            .read()
            .workspaces
            .keys()
            .map(|ws| WorkspaceId::new(ws.clone()))
            .collect()
    }

    /// Lists the table names present in a workspace.
    pub fn tables(&self, workspace: &WorkspaceId) -> Vec<String> {
        self.inner
            .read()
            .workspaces
            .get(workspace.as_str())
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    // ---- outbox ------------------------------------------------------

    /// Returns the number of operations waiting in the outbox.
    pub fn pending_count(&self) -> usize {
        self.inner
            .read()
            .outbox
            .iter()
            .filter(|op| op.status != OperationStatus::Failed)
            .count()
    }

    /// Returns a copy of every outbox operation, in insertion order.
    pub fn outbox_ops(&self) -> Vec<PendingOperation> {
        self.inner.read().outbox.clone()
    }

    /// Returns up to `limit` transmission-ready operations for a workspace,
    /// in insertion order.
    pub fn ready_ops(
        &self,
        workspace: &WorkspaceId,
        limit: usize,
        now_ms: u64,
    ) -> Vec<PendingOperation> {
        self.inner
            .read()
            .outbox
            .iter()
            .filter(|op| op.workspace_id == *workspace && op.is_ready(now_ms))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Marks operations as handed to the provider.
    pub fn mark_sending(&self, op_ids: &[Uuid]) {
        let mut state = self.inner.write();
        for op in &mut state.outbox {
            if op_ids.contains(&op.op_id) && op.status == OperationStatus::Pending {
                op.status = OperationStatus::Sending;
            }
        }
    }

    /// Returns in-flight operations to pending, e.g. after a cancelled push.
    pub fn requeue_in_flight(&self) {
        let mut state = self.inner.write();
        requeue_in_flight(&mut state);
    }

    /// Removes acknowledged operations from the outbox.
    ///
    /// Returns how many were removed. Only an explicit acknowledgment of
    /// the exact `op_id` removes an operation.
    pub fn remove_ops(&self, op_ids: &[Uuid]) -> usize {
        let mut state = self.inner.write();
        let before = state.outbox.len();
        state.outbox.retain(|op| !op_ids.contains(&op.op_id));
        before - state.outbox.len()
    }

    /// Records a failed transmission attempt.
    ///
    /// Increments the attempt counter and gates the operation behind
    /// `not_before_ms`. With `terminal` the operation is marked failed and
    /// leaves the retry cycle; it stays in the outbox for the caller.
    pub fn record_failure(&self, op_id: Uuid, not_before_ms: u64, terminal: bool) {
        let mut state = self.inner.write();
        if let Some(op) = state.outbox.iter_mut().find(|op| op.op_id == op_id) {
            op.attempts += 1;
            op.not_before_ms = not_before_ms;
            op.status = if terminal {
                OperationStatus::Failed
            } else {
                OperationStatus::Pending
            };
        }
    }

    /// Delays an operation without counting an attempt (rate limiting).
    pub fn record_backoff(&self, op_id: Uuid, not_before_ms: u64) {
        let mut state = self.inner.write();
        if let Some(op) = state.outbox.iter_mut().find(|op| op.op_id == op_id) {
            op.not_before_ms = not_before_ms;
            op.status = OperationStatus::Pending;
        }
    }

    // ---- cursors -----------------------------------------------------

    /// Returns the cursor for a (workspace, device) pair.
    pub fn cursor(&self, workspace: &WorkspaceId, device: DeviceId) -> Cursor {
        self.inner
            .read()
            .cursors
            .get(&(workspace.as_str().to_string(), device))
            .copied()
            .unwrap_or(Cursor::ZERO)
    }

    /// Advances a cursor monotonically; regressions are ignored.
    pub fn advance_cursor(&self, workspace: &WorkspaceId, device: DeviceId, cursor: Cursor) {
        let mut state = self.inner.write();
        let entry = state
            .cursors
            .entry((workspace.as_str().to_string(), device))
            .or_insert(Cursor::ZERO);
        if cursor > *entry {
            *entry = cursor;
        }
    }

    /// Returns every known device cursor for a workspace.
    pub fn known_cursors(&self, workspace: &WorkspaceId) -> Vec<(DeviceId, Cursor)> {
        self.inner
            .read()
            .cursors
            .iter()
            .filter(|((ws, _), _)| ws == workspace.as_str())
            .map(|((_, device), cursor)| (*device, *cursor))
            .collect()
    }

    // ---- tombstones --------------------------------------------------

    /// Looks up a tombstone.
    pub fn tombstone(&self, key: &TombstoneKey) -> Option<Tombstone> {
        self.inner.read().tombstones.get(key).cloned()
    }

    /// Returns all tombstones in a workspace.
    pub fn tombstones(&self, workspace: &WorkspaceId) -> Vec<(TombstoneKey, Tombstone)> {
        self.inner
            .read()
            .tombstones
            .iter()
            .filter(|(key, _)| key.workspace_id == *workspace)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Removes the given tombstones. Returns how many were removed.
    pub fn purge_tombstones(&self, keys: &[TombstoneKey]) -> usize {
        let mut state = self.inner.write();
        let before = state.tombstones.len();
        for key in keys {
            state.tombstones.remove(key);
        }
        before - state.tombstones.len()
    }

    /// Records the change-log position of an acknowledged deletion.
    pub fn note_tombstone_version(&self, key: &TombstoneKey, server_version: u64) {
        let mut state = self.inner.write();
        if let Some(tombstone) = state.tombstones.get_mut(key) {
            tombstone.server_version = Some(server_version);
        }
    }

    // ---- rescan ------------------------------------------------------

    /// Atomically replaces one workspace's records, tombstones, and cursor.
    ///
    /// Readers observe either the old view or the new one, never a mix.
    pub fn swap_workspace(&self, workspace: &WorkspaceId, staged: WorkspaceState) {
        let mut state = self.inner.write();
        debug!(
            workspace = %workspace,
            tables = staged.tables.len(),
            "swapping in reconciled workspace state"
        );

        state
            .workspaces
            .insert(workspace.as_str().to_string(), staged.tables);

        state
            .tombstones
            .retain(|key, _| key.workspace_id != *workspace);
        for (key, tombstone) in staged.tombstones {
            state.tombstones.insert(key, tombstone);
        }

        let device = self.identity.device_id;
        let entry = state
            .cursors
            .entry((workspace.as_str().to_string(), device))
            .or_insert(Cursor::ZERO);
        if staged.cursor > *entry {
            *entry = staged.cursor;
        }
    }

    // ---- observability ----------------------------------------------

    /// Returns a point-in-time stats snapshot.
    pub fn stats(&self) -> StoreStats {
        let state = self.inner.read();
        StoreStats {
            tables: state
                .workspaces
                .values()
                .flat_map(|tables| tables.keys())
                .collect::<std::collections::BTreeSet<_>>()
                .len(),
            records: state
                .workspaces
                .values()
                .flat_map(|tables| tables.values())
                .map(|records| records.len())
                .sum(),
            pending_ops: state
                .outbox
                .iter()
                .filter(|op| op.status != OperationStatus::Failed)
                .count(),
            failed_ops: state
                .outbox
                .iter()
                .filter(|op| op.status == OperationStatus::Failed)
                .count(),
            tombstones: state.tombstones.len(),
        }
    }
}

fn requeue_in_flight(state: &mut StoreState) {
    for op in &mut state.outbox {
        if op.status == OperationStatus::Sending {
            op.status = OperationStatus::Pending;
        }
    }
}

/// Finds the pending upsert an incoming capture upsert coalesces into.
fn coalesce_slot<'a>(
    outbox: &'a mut [PendingOperation],
    incoming: &PendingOperation,
) -> Option<&'a mut PendingOperation> {
    if incoming.is_delete() {
        return None;
    }
    outbox.iter_mut().find(|op| {
        op.status == OperationStatus::Pending
            && !op.is_delete()
            && op.workspace_id == incoming.workspace_id
            && op.table == incoming.table
            && op.primary_key == incoming.primary_key
    })
}

/// A staged set of writes applied atomically on commit.
///
/// Change capture happens here: `put` and `delete` stage both the entity
/// effect and its pending operation, so the two commit together. Writes
/// that originate from applying a remote change go through the
/// `apply_remote_*` methods, which never capture, or set the
/// suppress-capture flag for the transaction.
pub struct Transaction<'a> {
    store: &'a LocalStore,
    device_id: DeviceId,
    suppressed: bool,
    staged_records: Vec<(String, EntityEnvelope)>,
    staged_removals: Vec<(WorkspaceId, String, String)>,
    staged_tombstones: Vec<(TombstoneKey, Tombstone)>,
    staged_tombstone_removals: Vec<TombstoneKey>,
    staged_ops: Vec<PendingOperation>,
    staged_cursors: Vec<(WorkspaceId, DeviceId, Cursor)>,
}

impl<'a> Transaction<'a> {
    fn new(store: &'a LocalStore) -> Self {
        Self {
            store,
            device_id: store.device_id(),
            suppressed: false,
            staged_records: Vec::new(),
            staged_removals: Vec::new(),
            staged_tombstones: Vec::new(),
            staged_tombstone_removals: Vec::new(),
            staged_ops: Vec::new(),
            staged_cursors: Vec::new(),
        }
    }

    /// Suppresses change capture for the rest of this transaction.
    ///
    /// Set when the writes originate from the sync engine applying remote
    /// changes, so they do not echo back into the outbox.
    pub fn suppress_capture(&mut self) {
        self.suppressed = true;
    }

    /// Reads a record, observing this transaction's staged writes.
    pub fn get(
        &self,
        workspace: &WorkspaceId,
        table: &str,
        primary_key: &str,
    ) -> Option<EntityEnvelope> {
        for (staged_table, envelope) in self.staged_records.iter().rev() {
            if staged_table == table
                && envelope.workspace_id == *workspace
                && envelope.id == primary_key
            {
                return Some(envelope.clone());
            }
        }
        if self.staged_removals.iter().any(|(ws, t, pk)| {
            ws == workspace && t == table && pk == primary_key
        }) {
            return None;
        }
        self.store.get(workspace, table, primary_key)
    }

    fn tombstone_stamp(&self, key: &TombstoneKey) -> Option<VersionStamp> {
        for (staged_key, tombstone) in self.staged_tombstones.iter().rev() {
            if staged_key == key {
                return Some(tombstone.stamp());
            }
        }
        if self.staged_tombstone_removals.contains(key) {
            return None;
        }
        self.store.tombstone(key).map(|t| t.stamp())
    }

    /// Writes a record and captures the corresponding pending operation.
    ///
    /// The record's clock continues from the highest clock seen for the
    /// key, tombstones included, so a write over a tombstone revives the
    /// record with a winning stamp.
    pub fn put(
        &mut self,
        workspace: &WorkspaceId,
        table: &str,
        primary_key: &str,
        fields: Map<String, Value>,
    ) -> StoreResult<EntityEnvelope> {
        let key = TombstoneKey {
            workspace_id: workspace.clone(),
            table: table.to_string(),
            primary_key: primary_key.to_string(),
        };

        let current_clock = self
            .get(workspace, table, primary_key)
            .map(|record| record.clock)
            .unwrap_or(0);
        let tombstone_clock = self.tombstone_stamp(&key).map(|s| s.clock).unwrap_or(0);

        let hlc = self.store.clock.tick();
        let envelope = EntityEnvelope::new(
            primary_key,
            workspace.clone(),
            current_clock.max(tombstone_clock) + 1,
            hlc,
            Uuid::new_v4(),
            fields,
        );

        self.staged_removals
            .retain(|(ws, t, pk)| !(ws == workspace && t == table && pk == primary_key));
        self.staged_records
            .push((table.to_string(), envelope.clone()));
        // A newer local write supersedes any tombstone for the key
        self.staged_tombstones.retain(|(k, _)| k != &key);
        self.staged_tombstone_removals.push(key);

        if !self.suppressed {
            self.staged_ops.push(PendingOperation::upsert(
                self.device_id,
                table,
                envelope.clone(),
            ));
        }
        Ok(envelope)
    }

    /// Writes a streaming, not-yet-finalized record state without capture.
    ///
    /// Intermediate states stay visible to local readers but never reach
    /// the outbox; the finalizing `put` captures the state transition.
    pub fn put_partial(
        &mut self,
        workspace: &WorkspaceId,
        table: &str,
        primary_key: &str,
        fields: Map<String, Value>,
    ) -> StoreResult<EntityEnvelope> {
        let envelope = match self.get(workspace, table, primary_key) {
            Some(current) => EntityEnvelope {
                updated_at_ms: now_ms(),
                fields,
                ..current
            },
            None => EntityEnvelope::new(
                primary_key,
                workspace.clone(),
                0,
                self.store.clock.tick(),
                Uuid::new_v4(),
                fields,
            ),
        };
        self.staged_records
            .push((table.to_string(), envelope.clone()));
        Ok(envelope)
    }

    /// Deletes a record: removes it, writes the tombstone, and captures
    /// the deletion, all in this transaction.
    ///
    /// Deleting an already-deleted or absent record is a no-op; the
    /// existing tombstone is not regrown and no operation is enqueued.
    pub fn delete(
        &mut self,
        workspace: &WorkspaceId,
        table: &str,
        primary_key: &str,
    ) -> StoreResult<Option<EntityEnvelope>> {
        let Some(current) = self.get(workspace, table, primary_key) else {
            return Ok(None);
        };

        let key = TombstoneKey {
            workspace_id: workspace.clone(),
            table: table.to_string(),
            primary_key: primary_key.to_string(),
        };
        let hlc = self.store.clock.tick();
        let clock = current.clock + 1;
        let op_id = Uuid::new_v4();

        self.staged_records
            .retain(|(t, env)| !(t == table && env.workspace_id == *workspace && env.id == primary_key));
        self.staged_removals
            .push((workspace.clone(), table.to_string(), primary_key.to_string()));
        self.staged_tombstone_removals.retain(|k| k != &key);
        self.staged_tombstones.push((
            key,
            Tombstone {
                deleted_at_ms: hlc.physical_ms,
                clock,
                hlc,
                op_id,
                server_version: None,
            },
        ));

        if !self.suppressed {
            self.staged_ops.push(PendingOperation::delete(
                op_id,
                self.device_id,
                workspace.clone(),
                table,
                primary_key,
                clock,
                hlc,
            ));
        }
        Ok(Some(current))
    }

    /// Applies a remote record version as-is, without capture.
    ///
    /// The caller has already resolved the conflict; the envelope keeps
    /// its remote stamp. Any tombstone for the key is superseded.
    pub fn apply_remote_upsert(&mut self, table: &str, envelope: EntityEnvelope) {
        let key = TombstoneKey {
            workspace_id: envelope.workspace_id.clone(),
            table: table.to_string(),
            primary_key: envelope.id.clone(),
        };
        self.staged_removals.retain(|(ws, t, pk)| {
            !(ws == &envelope.workspace_id && t == table && pk == &envelope.id)
        });
        self.staged_records.push((table.to_string(), envelope));
        self.staged_tombstones.retain(|(k, _)| k != &key);
        self.staged_tombstone_removals.push(key);
    }

    /// Applies a remote deletion as-is, without capture.
    pub fn apply_remote_delete(
        &mut self,
        workspace: &WorkspaceId,
        table: &str,
        primary_key: &str,
        stamp: VersionStamp,
        server_version: u64,
    ) {
        let key = TombstoneKey {
            workspace_id: workspace.clone(),
            table: table.to_string(),
            primary_key: primary_key.to_string(),
        };
        self.staged_records
            .retain(|(t, env)| !(t == table && env.workspace_id == *workspace && env.id == primary_key));
        self.staged_removals
            .push((workspace.clone(), table.to_string(), primary_key.to_string()));
        self.staged_tombstone_removals.retain(|k| k != &key);
        self.staged_tombstones.push((
            key,
            Tombstone {
                deleted_at_ms: stamp.hlc.physical_ms,
                clock: stamp.clock,
                hlc: stamp.hlc,
                op_id: stamp.op_id,
                server_version: Some(server_version),
            },
        ));
    }

    /// Stages a monotonic cursor advance for this device.
    pub fn advance_cursor(&mut self, workspace: &WorkspaceId, device: DeviceId, cursor: Cursor) {
        self.staged_cursors
            .push((workspace.clone(), device, cursor));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn ws() -> WorkspaceId {
        WorkspaceId::new("ws1")
    }

    fn fields(title: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("title".into(), json!(title));
        map
    }

    #[test]
    fn write_and_capture_commit_together() {
        let store = LocalStore::open_in_memory();

        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", fields("hello"))?;
                Ok(())
            })
            .unwrap();

        let record = store.get(&ws(), "threads", "t1").unwrap();
        assert_eq!(record.clock, 1);
        assert_eq!(record.fields["title"], "hello");

        let ops = store.outbox_ops();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].primary_key, "t1");
        assert_eq!(ops[0].op_id, record.op_id);
    }

    #[test]
    fn failed_transaction_applies_nothing() {
        let store = LocalStore::open_in_memory();

        let result: StoreResult<()> = store.transaction(|txn| {
            txn.put(&ws(), "threads", "t1", fields("doomed"))?;
            Err(StoreError::aborted("test"))
        });

        assert!(result.is_err());
        assert!(store.get(&ws(), "threads", "t1").is_none());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn clock_increments_on_every_write() {
        let store = LocalStore::open_in_memory();

        for expected in 1..=3u64 {
            store
                .transaction(|txn| {
                    txn.put(&ws(), "threads", "t1", fields("v"))?;
                    Ok(())
                })
                .unwrap();
            assert_eq!(store.get(&ws(), "threads", "t1").unwrap().clock, expected);
        }
    }

    #[test]
    fn suppressed_writes_skip_the_outbox() {
        let store = LocalStore::open_in_memory();

        store
            .transaction(|txn| {
                txn.suppress_capture();
                txn.put(&ws(), "threads", "t1", fields("from-remote"))?;
                Ok(())
            })
            .unwrap();

        assert!(store.get(&ws(), "threads", "t1").is_some());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn partial_writes_are_visible_but_not_captured() {
        let store = LocalStore::open_in_memory();

        for chunk in ["stream", "streaming", "streaming done"] {
            store
                .transaction(|txn| {
                    txn.put_partial(&ws(), "messages", "m1", fields(chunk))?;
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(
            store.get(&ws(), "messages", "m1").unwrap().fields["title"],
            "streaming done"
        );
        assert_eq!(store.pending_count(), 0);

        // Finalizing captures exactly once
        store
            .transaction(|txn| {
                txn.put(&ws(), "messages", "m1", fields("final"))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn rapid_upserts_coalesce_to_one_operation() {
        let store = LocalStore::open_in_memory();
        let mut first_op_id = None;

        for i in 0..5 {
            store
                .transaction(|txn| {
                    let env = txn.put(&ws(), "threads", "t1", fields(&format!("v{i}")))?;
                    Ok(env)
                })
                .map(|env| {
                    first_op_id.get_or_insert(env.op_id);
                })
                .unwrap();
        }

        let ops = store.outbox_ops();
        assert_eq!(ops.len(), 1);
        // Earliest op keeps the queue slot and idempotency key
        assert_eq!(Some(ops[0].op_id), first_op_id);
        // ...with the latest payload
        match &ops[0].kind {
            OperationKind::Upsert { envelope } => {
                assert_eq!(envelope.fields["title"], "v4");
                assert_eq!(envelope.clock, 5);
            }
            OperationKind::Delete { .. } => panic!("expected upsert"),
        }
    }

    #[test]
    fn sending_ops_do_not_coalesce() {
        let store = LocalStore::open_in_memory();
        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", fields("v1"))?;
                Ok(())
            })
            .unwrap();

        let in_flight: Vec<Uuid> = store.outbox_ops().iter().map(|op| op.op_id).collect();
        store.mark_sending(&in_flight);

        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", fields("v2"))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.outbox_ops().len(), 2);
    }

    #[test]
    fn outbox_capacity_is_enforced() {
        let store =
            LocalStore::open_in_memory_with_config(StoreConfig::new().outbox_capacity(2));

        for i in 0..2 {
            store
                .transaction(|txn| {
                    txn.put(&ws(), "threads", &format!("t{i}"), fields("x"))?;
                    Ok(())
                })
                .unwrap();
        }

        let result = store.transaction(|txn| {
            txn.put(&ws(), "threads", "t9", fields("overflow"))?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::OutboxFull { capacity: 2 })));
        // Refused, not dropped: the record did not commit either
        assert!(store.get(&ws(), "threads", "t9").is_none());
        assert_eq!(store.pending_count(), 2);
    }

    #[test]
    fn delete_writes_tombstone_and_captures() {
        let store = LocalStore::open_in_memory();
        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", fields("x"))?;
                Ok(())
            })
            .unwrap();

        store
            .transaction(|txn| {
                let deleted = txn.delete(&ws(), "threads", "t1")?;
                assert!(deleted.is_some());
                Ok(())
            })
            .unwrap();

        assert!(store.get(&ws(), "threads", "t1").is_none());
        let key = TombstoneKey {
            workspace_id: ws(),
            table: "threads".into(),
            primary_key: "t1".into(),
        };
        let tombstone = store.tombstone(&key).unwrap();
        assert_eq!(tombstone.clock, 2);
        assert_eq!(tombstone.server_version, None);

        let ops = store.outbox_ops();
        assert_eq!(ops.len(), 2);
        assert!(ops[1].is_delete());
    }

    #[test]
    fn repeated_delete_is_a_noop() {
        let store = LocalStore::open_in_memory();
        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", fields("x"))?;
                txn.delete(&ws(), "threads", "t1")?;
                Ok(())
            })
            .unwrap();
        let ops_before = store.outbox_ops().len();

        store
            .transaction(|txn| {
                assert!(txn.delete(&ws(), "threads", "t1")?.is_none());
                Ok(())
            })
            .unwrap();

        assert_eq!(store.outbox_ops().len(), ops_before);
        assert_eq!(store.stats().tombstones, 1);
    }

    #[test]
    fn put_over_tombstone_revives_with_winning_clock() {
        let store = LocalStore::open_in_memory();
        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", fields("x"))?;
                Ok(())
            })
            .unwrap();
        store
            .transaction(|txn| {
                txn.delete(&ws(), "threads", "t1")?;
                Ok(())
            })
            .unwrap();

        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", fields("revived"))?;
                Ok(())
            })
            .unwrap();

        // Clock continues past the tombstone's, and the tombstone is gone
        assert_eq!(store.get(&ws(), "threads", "t1").unwrap().clock, 3);
        assert_eq!(store.stats().tombstones, 0);
    }

    #[test]
    fn cursors_never_regress() {
        let store = LocalStore::open_in_memory();
        let device = store.device_id();

        store.advance_cursor(&ws(), device, Cursor::new(10));
        store.advance_cursor(&ws(), device, Cursor::new(5));

        assert_eq!(store.cursor(&ws(), device), Cursor::new(10));
    }

    #[test]
    fn failure_accounting() {
        let store = LocalStore::open_in_memory();
        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "t1", fields("x"))?;
                Ok(())
            })
            .unwrap();
        let op_id = store.outbox_ops()[0].op_id;

        store.record_failure(op_id, 5_000, false);
        let op = &store.outbox_ops()[0];
        assert_eq!(op.attempts, 1);
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(store.ready_ops(&ws(), 10, 0).is_empty());
        assert_eq!(store.ready_ops(&ws(), 10, 5_000).len(), 1);

        store.record_failure(op_id, 0, true);
        assert_eq!(store.outbox_ops()[0].status, OperationStatus::Failed);
        assert_eq!(store.stats().failed_ops, 1);
        // Failed ops are surfaced, never dropped
        assert_eq!(store.outbox_ops().len(), 1);
    }

    #[test]
    fn swap_workspace_is_atomic_per_workspace() {
        let store = LocalStore::open_in_memory();
        let other = WorkspaceId::new("ws2");
        store
            .transaction(|txn| {
                txn.put(&ws(), "threads", "old", fields("old"))?;
                txn.put(&other, "threads", "keep", fields("keep"))?;
                Ok(())
            })
            .unwrap();

        let mut staged = WorkspaceState::default();
        let replacement = EntityEnvelope::new(
            "new",
            ws(),
            1,
            driftsync_protocol::Hlc::new(1, store.device_id()),
            Uuid::new_v4(),
            fields("new"),
        );
        staged
            .tables
            .entry("threads".into())
            .or_default()
            .insert("new".into(), replacement);
        staged.cursor = Cursor::new(50);

        store.swap_workspace(&ws(), staged);

        assert!(store.get(&ws(), "threads", "old").is_none());
        assert!(store.get(&ws(), "threads", "new").is_some());
        assert_eq!(store.cursor(&ws(), store.device_id()), Cursor::new(50));
        // Other workspaces are untouched
        assert!(store.get(&other, "threads", "keep").is_some());
    }

    #[test]
    fn reopen_restores_state_and_requeues_in_flight() {
        let tmp = TempDir::new().unwrap();
        let device;
        {
            let store = LocalStore::open(tmp.path(), StoreConfig::default()).unwrap();
            device = store.device_id();
            store
                .transaction(|txn| {
                    txn.put(&ws(), "threads", "t1", fields("persisted"))?;
                    Ok(())
                })
                .unwrap();
            let ids: Vec<Uuid> = store.outbox_ops().iter().map(|op| op.op_id).collect();
            store.mark_sending(&ids);
            store.save().unwrap();
        }

        let store = LocalStore::open(tmp.path(), StoreConfig::default()).unwrap();
        assert_eq!(store.device_id(), device);
        assert_eq!(
            store.get(&ws(), "threads", "t1").unwrap().fields["title"],
            "persisted"
        );
        // In-flight operations were never acknowledged: back to pending
        assert_eq!(store.outbox_ops()[0].status, OperationStatus::Pending);
    }
}
