//! Engine service object and sync cycle.

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventHandler, SyncEvent};
use crate::gc::{GcOutcome, TombstoneGc};
use crate::outbox::Outbox;
use crate::provider::SyncProvider;
use crate::pull::{EchoRegister, PullManager, PullOutcome};
use crate::push::{PushLoop, PushOutcome};
use crate::transport::{select_transport, SyncTransport};
use driftsync_protocol::{Cursor, SyncScope};
use driftsync_store::{LocalStore, StoreError, Transaction};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is applying remote changes.
    Pulling,
    /// Engine is draining the outbox.
    Pushing,
    /// Engine has completed a sync cycle.
    Synced,
    /// Engine encountered an error.
    Error,
    /// Engine was disposed and will not sync again.
    Disposed,
}

impl SyncState {
    /// Returns true if the engine is in an active sync phase.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }
}

/// Point-in-time observability snapshot.
///
/// Assembled on demand; not part of correctness.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sync cycles completed.
    pub cycles_completed: u64,
    /// Operations acknowledged by the remote.
    pub operations_pushed: u64,
    /// Remote changes applied locally.
    pub operations_pulled: u64,
    /// Conflicts observed, either side winning.
    pub conflicts_observed: u64,
    /// Own-push echoes suppressed on pull.
    pub echoes_suppressed: u64,
    /// Operations currently waiting in the outbox.
    pub pending_ops: usize,
    /// This device's cursor into the change stream.
    pub last_cursor: Cursor,
    /// Most recent terminal error, if any.
    pub last_error: Option<String>,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    /// Remote changes applied.
    pub pulled: usize,
    /// Operations acknowledged.
    pub pushed: usize,
    /// Conflicts observed during the cycle.
    pub conflicts: usize,
    /// Whether a full rescan ran.
    pub rescanned: bool,
}

#[derive(Debug, Default)]
struct Counters {
    cycles_completed: u64,
    operations_pushed: u64,
    operations_pulled: u64,
    conflicts_observed: u64,
    echoes_suppressed: u64,
    last_error: Option<String>,
}

/// The local-first synchronization engine for one workspace scope.
///
/// An explicit service object with a construction/teardown lifecycle:
/// constructed per workspace, disposed on workspace switch. Disposal
/// cancels in-flight work before a new scope starts, so data never leaks
/// across scopes. There is no ambient global state.
///
/// The engine never blocks local reads or writes on remote health; the
/// store stays writable while the remote is down, and the outbox carries
/// the backlog.
pub struct SyncEngine {
    scope: SyncScope,
    config: EngineConfig,
    store: Arc<LocalStore>,
    provider: Arc<dyn SyncProvider>,
    events: EventBus,
    breaker: Arc<CircuitBreaker>,
    push_loop: PushLoop,
    pull_manager: PullManager,
    gc: TombstoneGc,
    state: RwLock<SyncState>,
    counters: RwLock<Counters>,
    cancelled: AtomicBool,
    transport: Mutex<Option<Box<dyn SyncTransport>>>,
}

impl SyncEngine {
    /// Creates an engine for one workspace scope.
    pub fn new(
        config: EngineConfig,
        scope: SyncScope,
        store: Arc<LocalStore>,
        provider: Arc<dyn SyncProvider>,
    ) -> Self {
        let events = EventBus::new();
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let echo = Arc::new(EchoRegister::new(4096));

        let push_loop = PushLoop::new(
            Arc::clone(&provider),
            Outbox::new(Arc::clone(&store), config.retry.clone(), events.clone()),
            Arc::clone(&breaker),
            events.clone(),
            Arc::clone(&echo),
            &config,
        );
        let pull_manager = PullManager::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&breaker),
            events.clone(),
            echo,
        );
        let gc = TombstoneGc::new(Arc::clone(&store), config.gc_retention);

        Self {
            scope,
            config,
            store,
            provider,
            events,
            breaker,
            push_loop,
            pull_manager,
            gc,
            state: RwLock::new(SyncState::Idle),
            counters: RwLock::new(Counters::default()),
            cancelled: AtomicBool::new(false),
            transport: Mutex::new(None),
        }
    }

    /// Returns the engine's scope.
    pub fn scope(&self) -> &SyncScope {
        &self.scope
    }

    /// Returns the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Returns the circuit breaker's state.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Deterministic time until the breaker allows the next attempt.
    pub fn time_until_retry(&self) -> std::time::Duration {
        self.breaker.time_until_retry()
    }

    /// Registers an observability subscriber.
    pub fn subscribe_events(&self, handler: EventHandler) {
        self.events.subscribe(handler);
    }

    /// Runs a local mutation through the capture path.
    ///
    /// A convenience wrapper over the store's transaction that translates
    /// outbox backpressure into the queue-full signal. The engine never
    /// delays the write on remote health.
    pub fn mutate<F, T>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, StoreError>,
    {
        match self.store.transaction(f) {
            Ok(value) => Ok(value),
            Err(StoreError::OutboxFull { capacity }) => {
                self.events.emit(SyncEvent::QueueFull { capacity });
                Err(EngineError::QueueFull { capacity })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Runs one sync cycle: pull remote changes, then drain the outbox.
    ///
    /// Pulling first resolves stale local state against the freshest
    /// remote view before anything is transmitted.
    pub fn sync(&self) -> EngineResult<SyncReport> {
        if self.state() == SyncState::Disposed {
            return Err(EngineError::Cancelled);
        }
        self.cancelled.store(false, Ordering::SeqCst);

        self.set_state(SyncState::Pulling);
        let pull = match self.pull_manager.run(&self.scope, &self.cancelled) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail(err)),
        };

        self.set_state(SyncState::Pushing);
        let push = match self.push_loop.run(&self.scope, &self.cancelled) {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail(err)),
        };

        self.set_state(SyncState::Synced);
        self.record_cycle(&pull, &push);

        debug!(
            pulled = pull.applied,
            pushed = push.acked,
            conflicts = pull.conflicts,
            "sync cycle complete"
        );
        Ok(SyncReport {
            pulled: pull.applied,
            pushed: push.acked,
            conflicts: pull.conflicts + push.superseded,
            rescanned: pull.rescanned,
        })
    }

    /// Drains change batches from the active transport.
    ///
    /// With a realtime provider this applies server-pushed batches; with a
    /// polling provider it pulls on the configured cadence. The transport
    /// is connected lazily on first call.
    pub fn pump(&self) -> EngineResult<usize> {
        if self.state() == SyncState::Disposed {
            return Err(EngineError::Cancelled);
        }

        let mut guard = self.transport.lock();
        if guard.is_none() {
            *guard = Some(select_transport(&self.provider, &self.scope, &self.config)?);
        }
        let Some(transport) = guard.as_mut() else {
            return Ok(0);
        };

        let mut applied = 0usize;
        let mut outcome = PullOutcome::default();
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            let cursor = self.store.cursor(&self.scope.workspace_id, self.scope.device_id);
            match transport.next_batch(cursor)? {
                Some(batch) => {
                    applied += self.pull_manager.apply_batch(&self.scope, batch, &mut outcome)?;
                }
                None => break,
            }
        }

        if applied > 0 {
            self.events.emit(SyncEvent::PullAfter { count: applied });
            let mut counters = self.counters.write();
            counters.operations_pulled += applied as u64;
            counters.conflicts_observed += outcome.conflicts as u64;
            counters.echoes_suppressed += outcome.echoes as u64;
        }
        Ok(applied)
    }

    /// Forces a full rescan of the workspace.
    pub fn rescan(&self) -> EngineResult<SyncReport> {
        let outcome = self
            .pull_manager
            .rescan(&self.scope, &self.cancelled)
            .map_err(|err| self.fail(err))?;
        Ok(SyncReport {
            pulled: outcome.applied,
            pushed: 0,
            conflicts: outcome.conflicts,
            rescanned: true,
        })
    }

    /// Runs one garbage-collection pass.
    pub fn gc(&self) -> GcOutcome {
        self.gc.run(&self.scope.workspace_id, now_ms())
    }

    /// Cancels in-flight work at the next suspension point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Tears the engine down.
    ///
    /// Cancels in-flight pulls and pushes, closes the subscription, and
    /// releases the provider. In-flight operations return to pending so a
    /// successor engine retransmits them. Call before constructing an
    /// engine for a different scope.
    pub fn dispose(&self) {
        info!(workspace = %self.scope.workspace_id, "disposing sync engine");
        self.cancel();
        if let Some(mut transport) = self.transport.lock().take() {
            transport.close();
        }
        self.provider.dispose();
        self.store.requeue_in_flight();
        self.set_state(SyncState::Disposed);
    }

    /// Returns a point-in-time stats snapshot.
    pub fn stats(&self) -> SyncStats {
        let counters = self.counters.read();
        SyncStats {
            cycles_completed: counters.cycles_completed,
            operations_pushed: counters.operations_pushed,
            operations_pulled: counters.operations_pulled,
            conflicts_observed: counters.conflicts_observed,
            echoes_suppressed: counters.echoes_suppressed,
            pending_ops: self.store.pending_count(),
            last_cursor: self
                .store
                .cursor(&self.scope.workspace_id, self.scope.device_id),
            last_error: counters.last_error.clone(),
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn fail(&self, err: EngineError) -> EngineError {
        self.set_state(SyncState::Error);
        self.counters.write().last_error = Some(err.to_string());
        self.events.emit(SyncEvent::Error {
            message: err.to_string(),
        });
        err
    }

    fn record_cycle(&self, pull: &PullOutcome, push: &PushOutcome) {
        let mut counters = self.counters.write();
        counters.cycles_completed += 1;
        counters.operations_pushed += push.acked as u64;
        counters.operations_pulled += pull.applied as u64;
        counters.conflicts_observed += (pull.conflicts + push.superseded) as u64;
        counters.echoes_suppressed += pull.echoes as u64;
        counters.last_error = None;
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if self.state() != SyncState::Disposed {
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RetryConfig};
    use crate::provider::MockProvider;
    use driftsync_protocol::WorkspaceId;
    use driftsync_store::StoreConfig;
    use parking_lot::Mutex as PlMutex;
    use serde_json::Map;
    use std::time::Duration;

    fn engine_with(provider: Arc<MockProvider>, store: Arc<LocalStore>) -> SyncEngine {
        let scope = SyncScope::new(WorkspaceId::new("ws1"), store.device_id());
        let config = EngineConfig::new()
            .with_retry(RetryConfig::new(2).without_jitter())
            .with_poll_interval(Duration::ZERO);
        SyncEngine::new(config, scope, store, provider)
    }

    #[test]
    fn cycle_pushes_local_writes() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(LocalStore::open_in_memory());
        let engine = engine_with(Arc::clone(&provider), Arc::clone(&store));

        engine
            .mutate(|txn| {
                txn.put(&WorkspaceId::new("ws1"), "threads", "t1", Map::new())?;
                Ok(())
            })
            .unwrap();

        let report = engine.sync().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(engine.state(), SyncState::Synced);
        assert_eq!(engine.stats().cycles_completed, 1);
        assert_eq!(engine.stats().pending_ops, 0);
    }

    #[test]
    fn transport_failure_surfaces_and_sets_error_state() {
        let provider = Arc::new(MockProvider::new());
        provider.enqueue_pull(Err(EngineError::transport_retryable("down")));
        let store = Arc::new(LocalStore::open_in_memory());
        let engine = engine_with(provider, store);

        assert!(engine.sync().is_err());
        assert_eq!(engine.state(), SyncState::Error);
        assert!(engine.stats().last_error.is_some());
    }

    #[test]
    fn queue_full_fires_the_signal() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(LocalStore::open_in_memory_with_config(
            StoreConfig::new().outbox_capacity(1),
        ));
        let engine = engine_with(provider, Arc::clone(&store));

        let signaled = Arc::new(PlMutex::new(false));
        let flag = Arc::clone(&signaled);
        engine.subscribe_events(Arc::new(move |event| {
            if matches!(event, SyncEvent::QueueFull { .. }) {
                *flag.lock() = true;
            }
        }));

        let ws = WorkspaceId::new("ws1");
        engine
            .mutate(|txn| {
                txn.put(&ws, "threads", "a", Map::new())?;
                Ok(())
            })
            .unwrap();
        let result = engine.mutate(|txn| {
            txn.put(&ws, "threads", "b", Map::new())?;
            Ok(())
        });

        assert!(matches!(result, Err(EngineError::QueueFull { capacity: 1 })));
        assert!(*signaled.lock());
        // Nothing was silently dropped
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn breaker_opens_and_fails_fast() {
        let provider = Arc::new(MockProvider::new());
        provider.enqueue_pull(Err(EngineError::transport_retryable("down")));
        let store = Arc::new(LocalStore::open_in_memory());
        let scope = SyncScope::new(WorkspaceId::new("ws1"), store.device_id());
        let config = EngineConfig::new().with_breaker(
            BreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_secs(3600)),
        );
        let engine = SyncEngine::new(
            config,
            scope,
            store,
            Arc::clone(&provider) as Arc<dyn SyncProvider>,
        );

        assert!(engine.sync().is_err());
        assert_eq!(engine.breaker_state(), BreakerState::Open);

        // Second cycle fails fast without touching the provider
        let calls_before = provider.pull_calls();
        let result = engine.sync();
        assert!(matches!(result, Err(EngineError::BreakerOpen { .. })));
        assert_eq!(provider.pull_calls(), calls_before);
        assert!(engine.time_until_retry() > Duration::ZERO);
    }

    #[test]
    fn pump_applies_polled_batches() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(LocalStore::open_in_memory());
        let engine = engine_with(Arc::clone(&provider), Arc::clone(&store));

        let remote = DeviceIdHelper::envelope("r1", 1);
        provider.enqueue_pull(Ok(driftsync_protocol::ChangeBatch {
            changes: vec![remote],
            next_cursor: Cursor::new(1),
            has_more: false,
        }));

        let applied = engine.pump().unwrap();
        assert_eq!(applied, 1);
        assert!(store
            .get(&WorkspaceId::new("ws1"), "threads", "r1")
            .is_some());
    }

    #[test]
    fn dispose_cancels_and_requeues() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(LocalStore::open_in_memory());
        let engine = engine_with(provider, Arc::clone(&store));

        engine
            .mutate(|txn| {
                txn.put(&WorkspaceId::new("ws1"), "threads", "t1", Map::new())?;
                Ok(())
            })
            .unwrap();
        let ids: Vec<uuid::Uuid> = store.outbox_ops().iter().map(|op| op.op_id).collect();
        store.mark_sending(&ids);

        engine.dispose();
        assert_eq!(engine.state(), SyncState::Disposed);
        assert!(engine.sync().is_err());
        // In-flight work went back to pending for the successor engine
        assert_eq!(
            store.outbox_ops()[0].status,
            driftsync_protocol::OperationStatus::Pending
        );
    }

    /// Builds remote change entries for pump tests.
    struct DeviceIdHelper;

    impl DeviceIdHelper {
        fn envelope(pk: &str, version: u64) -> driftsync_protocol::ChangeLogEntry {
            use driftsync_protocol::{DeviceId, EntityEnvelope, Hlc};
            let device = DeviceId::from_uuid(uuid::Uuid::from_bytes([99; 16]));
            let hlc = Hlc::new(1_000, device);
            let op_id = uuid::Uuid::new_v4();
            driftsync_protocol::ChangeLogEntry {
                server_version: version,
                table: "threads".into(),
                primary_key: pk.into(),
                op_id,
                clock: 1,
                hlc,
                envelope: Some(EntityEnvelope {
                    id: pk.into(),
                    workspace_id: WorkspaceId::new("ws1"),
                    clock: 1,
                    hlc,
                    op_id,
                    deleted: false,
                    updated_at_ms: hlc.physical_ms,
                    fields: Map::new(),
                }),
            }
        }
    }
}
