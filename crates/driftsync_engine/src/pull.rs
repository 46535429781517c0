//! Pull manager: applies the remote change stream locally, in order, once.

use crate::breaker::CircuitBreaker;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, SyncEvent};
use crate::provider::SyncProvider;
use driftsync_protocol::{
    resolve, ChangeBatch, ChangeLogEntry, Cursor, OperationKind, OperationStatus, Resolution,
    SyncScope, VersionStamp,
};
use driftsync_store::{LocalStore, Tombstone, TombstoneKey, WorkspaceState};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Bounded set of recently acknowledged operation ids.
///
/// The pull side consults it to recognize echoes: entries in the change
/// stream that this device itself pushed. Echoes advance the cursor but
/// are never reapplied through the resolver.
pub(crate) struct EchoRegister {
    inner: Mutex<EchoInner>,
    capacity: usize,
}

struct EchoInner {
    order: VecDeque<Uuid>,
    set: HashSet<Uuid>,
}

impl EchoRegister {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(EchoInner {
                order: VecDeque::new(),
                set: HashSet::new(),
            }),
            capacity,
        }
    }

    pub(crate) fn record(&self, op_id: Uuid) {
        let mut inner = self.inner.lock();
        if inner.set.insert(op_id) {
            inner.order.push_back(op_id);
            while inner.order.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.set.remove(&evicted);
                }
            }
        }
    }

    pub(crate) fn contains(&self, op_id: &Uuid) -> bool {
        self.inner.lock().set.contains(op_id)
    }
}

/// What one pull run accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct PullOutcome {
    /// Changes applied to the local store.
    pub applied: usize,
    /// Echoes of this device's own pushes that were suppressed.
    pub echoes: usize,
    /// Conflicts observed (either side winning).
    pub conflicts: usize,
    /// Whether a full rescan ran.
    pub rescanned: bool,
}

/// Consumes the remote change stream and applies it locally.
pub(crate) struct PullManager {
    provider: Arc<dyn SyncProvider>,
    store: Arc<LocalStore>,
    breaker: Arc<CircuitBreaker>,
    events: EventBus,
    echo: Arc<EchoRegister>,
}

impl PullManager {
    pub(crate) fn new(
        provider: Arc<dyn SyncProvider>,
        store: Arc<LocalStore>,
        breaker: Arc<CircuitBreaker>,
        events: EventBus,
        echo: Arc<EchoRegister>,
    ) -> Self {
        Self {
            provider,
            store,
            breaker,
            events,
            echo,
        }
    }

    /// Pulls since the device cursor until the stream is drained.
    ///
    /// A cursor-expired signal is not a failure: it triggers a full
    /// rescan and the run reports success.
    pub(crate) fn run(
        &self,
        scope: &SyncScope,
        cancelled: &AtomicBool,
    ) -> EngineResult<PullOutcome> {
        let mut outcome = PullOutcome::default();

        loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            self.breaker.check()?;

            let cursor = self.store.cursor(&scope.workspace_id, scope.device_id);
            let batch = match self.provider.pull(scope, Some(cursor), None) {
                Ok(batch) => {
                    self.breaker.record_success();
                    batch
                }
                Err(EngineError::CursorExpired) => {
                    return self.rescan(scope, cancelled);
                }
                Err(err) => {
                    if err.counts_as_breaker_failure() {
                        self.breaker.record_failure();
                    }
                    return Err(err);
                }
            };

            let has_more = batch.has_more;
            let applied = self.apply_batch(scope, batch, &mut outcome)?;
            if applied > 0 {
                self.events.emit(SyncEvent::PullAfter { count: applied });
            }
            if !has_more {
                break;
            }
        }

        Ok(outcome)
    }

    /// Applies one batch in a single suppressed-capture transaction.
    ///
    /// Changes apply in strictly increasing `server_version` order, each
    /// at most once; entries at or below the cursor are replays and skip.
    pub(crate) fn apply_batch(
        &self,
        scope: &SyncScope,
        batch: ChangeBatch,
        outcome: &mut PullOutcome,
    ) -> EngineResult<usize> {
        let workspace = &scope.workspace_id;
        let cursor = self.store.cursor(workspace, scope.device_id);

        // Ordering contract check before any effect
        let mut last = cursor.position();
        let mut fresh: Vec<&ChangeLogEntry> = Vec::new();
        for change in &batch.changes {
            if change.server_version <= cursor.position() {
                continue;
            }
            if change.server_version <= last {
                return Err(EngineError::OutOfOrder {
                    server_version: change.server_version,
                    cursor: last,
                });
            }
            last = change.server_version;
            fresh.push(change);
        }

        let mut applied = 0usize;
        let mut echoes = 0usize;
        let mut conflicts = 0usize;
        let mut conflict_events: Vec<SyncEvent> = Vec::new();
        let mut tombstone_notes: Vec<(TombstoneKey, u64)> = Vec::new();

        let target_cursor = batch.next_cursor.max(Cursor::new(last));
        self.store.transaction(|txn| {
            txn.suppress_capture();

            for change in &fresh {
                // Writes made after this pull must order after what it saw
                self.store.clock().observe(&change.hlc);

                let key = TombstoneKey {
                    workspace_id: workspace.clone(),
                    table: change.table.clone(),
                    primary_key: change.primary_key.clone(),
                };

                if self.echo.contains(&change.op_id) {
                    // Our own write coming back; already applied locally
                    if change.is_tombstone() {
                        tombstone_notes.push((key, change.server_version));
                    }
                    echoes += 1;
                    continue;
                }

                let local_stamp = txn
                    .get(workspace, &change.table, &change.primary_key)
                    .map(|record| record.stamp())
                    .or_else(|| self.store.tombstone(&key).map(|t| t.stamp()));

                let incoming = change.stamp();
                match local_stamp {
                    Some(local) if local == incoming => {
                        // Same write, e.g. replayed after a restart
                        if change.is_tombstone() {
                            tombstone_notes.push((key, change.server_version));
                        }
                        echoes += 1;
                        continue;
                    }
                    Some(local) => {
                        conflicts += 1;
                        match resolve(local, incoming) {
                            Resolution::KeepLocal => {
                                // Loser is never applied, only observed
                                conflict_events.push(SyncEvent::ConflictDetected {
                                    table: change.table.clone(),
                                    primary_key: change.primary_key.clone(),
                                    resolution: Resolution::KeepLocal,
                                });
                                continue;
                            }
                            Resolution::AcceptRemote => {
                                conflict_events.push(SyncEvent::ConflictDetected {
                                    table: change.table.clone(),
                                    primary_key: change.primary_key.clone(),
                                    resolution: Resolution::AcceptRemote,
                                });
                            }
                        }
                    }
                    None => {}
                }

                apply_entry(txn, workspace, change, incoming);
                applied += 1;
            }

            txn.advance_cursor(workspace, scope.device_id, target_cursor);
            Ok(())
        })?;

        for (key, version) in tombstone_notes {
            self.store.note_tombstone_version(&key, version);
        }
        for event in conflict_events {
            self.events.emit(event);
        }

        outcome.applied += applied;
        outcome.echoes += echoes;
        outcome.conflicts += conflicts;
        Ok(applied)
    }

    /// Full resynchronization after the remote pruned past our cursor.
    ///
    /// Fetches the complete current state, overlays still-pending outbox
    /// operations so unsynced local edits survive (read-your-writes), and
    /// swaps the reconciled view in atomically.
    pub(crate) fn rescan(
        &self,
        scope: &SyncScope,
        cancelled: &AtomicBool,
    ) -> EngineResult<PullOutcome> {
        info!(workspace = %scope.workspace_id, "cursor expired; starting full rescan");
        let workspace = &scope.workspace_id;

        let mut staged = WorkspaceState::default();
        let mut fetched = 0usize;
        let mut cursor: Option<Cursor> = None;

        loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            self.breaker.check()?;

            let batch = match self.provider.pull(scope, cursor, None) {
                Ok(batch) => {
                    self.breaker.record_success();
                    batch
                }
                Err(err) => {
                    if err.counts_as_breaker_failure() {
                        self.breaker.record_failure();
                    }
                    return Err(err);
                }
            };

            for change in &batch.changes {
                fetched += 1;
                if change.is_tombstone() {
                    let key = TombstoneKey {
                        workspace_id: workspace.clone(),
                        table: change.table.clone(),
                        primary_key: change.primary_key.clone(),
                    };
                    staged.tombstones.push((
                        key,
                        Tombstone {
                            deleted_at_ms: change.hlc.physical_ms,
                            clock: change.clock,
                            hlc: change.hlc,
                            op_id: change.op_id,
                            server_version: Some(change.server_version),
                        },
                    ));
                } else if let Some(envelope) = &change.envelope {
                    staged
                        .tables
                        .entry(change.table.clone())
                        .or_default()
                        .insert(change.primary_key.clone(), envelope.clone());
                }
            }

            staged.cursor = staged.cursor.max(batch.next_cursor);
            if !batch.has_more {
                break;
            }
            cursor = Some(batch.next_cursor);
        }

        // Read-your-writes: a pending local edit the server has not
        // acknowledged must survive the rescan.
        let mut overlaid = 0usize;
        for op in self.store.outbox_ops() {
            if op.workspace_id != *workspace || op.status == OperationStatus::Failed {
                continue;
            }
            match &op.kind {
                OperationKind::Upsert { envelope } => {
                    let staged_stamp = staged
                        .tables
                        .get(&op.table)
                        .and_then(|records| records.get(&op.primary_key))
                        .map(|record| record.stamp());
                    if wins(envelope.stamp(), staged_stamp) {
                        staged
                            .tables
                            .entry(op.table.clone())
                            .or_default()
                            .insert(op.primary_key.clone(), envelope.clone());
                        staged
                            .tombstones
                            .retain(|(key, _)| !(key.table == op.table && key.primary_key == op.primary_key));
                        overlaid += 1;
                    }
                }
                OperationKind::Delete { clock, hlc } => {
                    let stamp = VersionStamp {
                        clock: *clock,
                        hlc: *hlc,
                        op_id: op.op_id,
                    };
                    let staged_stamp = staged
                        .tables
                        .get(&op.table)
                        .and_then(|records| records.get(&op.primary_key))
                        .map(|record| record.stamp());
                    if wins(stamp, staged_stamp) {
                        if let Some(records) = staged.tables.get_mut(&op.table) {
                            records.remove(&op.primary_key);
                        }
                        staged.tombstones.push((
                            TombstoneKey {
                                workspace_id: workspace.clone(),
                                table: op.table.clone(),
                                primary_key: op.primary_key.clone(),
                            },
                            Tombstone {
                                deleted_at_ms: hlc.physical_ms,
                                clock: *clock,
                                hlc: *hlc,
                                op_id: op.op_id,
                                server_version: None,
                            },
                        ));
                        overlaid += 1;
                    }
                }
            }
        }

        debug!(fetched, overlaid, "rescan reconciled; swapping in new view");
        self.store.swap_workspace(workspace, staged);
        self.events.emit(SyncEvent::PullAfter { count: fetched });

        Ok(PullOutcome {
            applied: fetched,
            echoes: 0,
            conflicts: 0,
            rescanned: true,
        })
    }

}

/// Applies one resolved change inside the transaction.
fn apply_entry(
    txn: &mut driftsync_store::Transaction<'_>,
    workspace: &driftsync_protocol::WorkspaceId,
    change: &ChangeLogEntry,
    incoming: VersionStamp,
) {
    if change.is_tombstone() {
        txn.apply_remote_delete(
            workspace,
            &change.table,
            &change.primary_key,
            incoming,
            change.server_version,
        );
    } else if let Some(envelope) = &change.envelope {
        txn.apply_remote_upsert(&change.table, envelope.clone());
    }
}

fn wins(candidate: VersionStamp, against: Option<VersionStamp>) -> bool {
    match against {
        Some(current) => resolve(current, candidate) == Resolution::AcceptRemote,
        None => true,
    }
}
