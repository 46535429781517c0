//! Outbox policy over the store's pending-operation table.
//!
//! The store owns durability and coalescing at capture time; this wrapper
//! owns the transmission policy: readiness batches, backoff accounting,
//! terminal failure marking, and the retry/queue events that go with them.

use crate::config::RetryConfig;
use crate::events::{EventBus, SyncEvent};
use driftsync_protocol::{PendingOperation, PushReceipt, WorkspaceId};
use driftsync_store::LocalStore;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Engine-side outbox policy.
pub(crate) struct Outbox {
    store: Arc<LocalStore>,
    retry: RetryConfig,
    events: EventBus,
}

impl Outbox {
    pub(crate) fn new(store: Arc<LocalStore>, retry: RetryConfig, events: EventBus) -> Self {
        Self {
            store,
            retry,
            events,
        }
    }

    /// Returns the next FIFO batch of transmission-ready operations.
    pub(crate) fn ready_batch(
        &self,
        workspace: &WorkspaceId,
        limit: usize,
    ) -> Vec<PendingOperation> {
        self.store.ready_ops(workspace, limit, now_ms())
    }

    /// Marks a batch as in flight.
    pub(crate) fn mark_sending(&self, ops: &[PendingOperation]) {
        let ids: Vec<Uuid> = ops.iter().map(|op| op.op_id).collect();
        self.store.mark_sending(&ids);
    }

    /// Settles a batch against a push receipt.
    ///
    /// Only explicitly acknowledged operations are removed. Rejected
    /// operations are settled by reason. Operations in neither list were
    /// not received by the remote and return to pending immediately.
    pub(crate) fn settle(&self, batch: &[PendingOperation], receipt: &PushReceipt) -> Settlement {
        let mut settlement = Settlement::default();

        let removed = self.store.remove_ops(&receipt.acked);
        settlement.acked = removed;

        for rejected in &receipt.rejected {
            let Some(op) = batch.iter().find(|op| op.op_id == rejected.op_id) else {
                continue;
            };
            match rejected.reason.as_str() {
                driftsync_protocol::reject_reason::RATE_LIMITED => {
                    // Throttle without consuming an attempt
                    let delay = self.retry.delay_for_attempt(op.attempts.max(1));
                    self.store
                        .record_backoff(op.op_id, now_ms() + delay.as_millis() as u64);
                    self.events.emit(SyncEvent::Retry {
                        delay_ms: delay.as_millis() as u64,
                    });
                    settlement.throttled += 1;
                }
                driftsync_protocol::reject_reason::STALE_VERSION => {
                    // Not an error: the remote already holds a newer
                    // version. The op leaves the outbox and the local copy
                    // converges on the next pull.
                    self.store.remove_ops(&[op.op_id]);
                    self.events.emit(SyncEvent::ConflictDetected {
                        table: op.table.clone(),
                        primary_key: op.primary_key.clone(),
                        resolution: driftsync_protocol::Resolution::AcceptRemote,
                    });
                    settlement.superseded += 1;
                }
                reason => {
                    // Validation rejection: surfaced, out of the retry cycle
                    warn!(op_id = %op.op_id, reason, "operation rejected by remote");
                    self.store.record_failure(op.op_id, now_ms(), true);
                    self.events.emit(SyncEvent::Error {
                        message: format!("operation {} rejected: {reason}", op.op_id),
                    });
                    settlement.failed += 1;
                }
            }
        }

        // Unaccounted operations go straight back to pending
        for op in batch {
            let acked = receipt.acked.contains(&op.op_id);
            let rejected = receipt.rejected.iter().any(|r| r.op_id == op.op_id);
            if !acked && !rejected {
                self.store.record_backoff(op.op_id, now_ms());
            }
        }

        settlement
    }

    /// Applies retry accounting to a batch after a transport failure.
    ///
    /// Each operation either re-enters the queue behind an exponential
    /// backoff gate or, once its attempt budget is spent, is marked failed
    /// and surfaced. Nothing is dropped.
    pub(crate) fn record_transport_failure(&self, batch: &[PendingOperation], message: &str) {
        for op in batch {
            let attempts = op.attempts + 1;
            if attempts >= self.retry.max_attempts {
                warn!(op_id = %op.op_id, attempts, "operation exhausted retries");
                self.store.record_failure(op.op_id, now_ms(), true);
                self.events.emit(SyncEvent::Error {
                    message: format!(
                        "operation {} failed after {attempts} attempts: {message}",
                        op.op_id
                    ),
                });
            } else {
                let delay = self.retry.delay_for_attempt(attempts);
                self.store
                    .record_failure(op.op_id, now_ms() + delay.as_millis() as u64, false);
                self.events.emit(SyncEvent::Retry {
                    delay_ms: delay.as_millis() as u64,
                });
            }
        }
    }

    /// Number of operations awaiting transmission.
    pub(crate) fn pending_count(&self) -> usize {
        self.store.pending_count()
    }
}

/// How a settled batch broke down.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Settlement {
    pub acked: usize,
    pub failed: usize,
    pub throttled: usize,
    pub superseded: usize,
}
