//! Push loop: drains the outbox to the remote in idempotent batches.

use crate::breaker::CircuitBreaker;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, SyncEvent};
use crate::outbox::Outbox;
use crate::provider::SyncProvider;
use crate::pull::EchoRegister;
use driftsync_protocol::SyncScope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What one push run accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushOutcome {
    /// Operations handed to the provider.
    pub attempted: usize,
    /// Operations acknowledged and removed from the outbox.
    pub acked: usize,
    /// Operations rejected on validation grounds.
    pub rejected: usize,
    /// Operations superseded by a newer remote version.
    pub superseded: usize,
}

/// Drains ready operations in FIFO batches through the provider.
pub(crate) struct PushLoop {
    provider: Arc<dyn SyncProvider>,
    outbox: Outbox,
    breaker: Arc<CircuitBreaker>,
    events: EventBus,
    echo: Arc<EchoRegister>,
    batch_size: usize,
}

impl PushLoop {
    pub(crate) fn new(
        provider: Arc<dyn SyncProvider>,
        outbox: Outbox,
        breaker: Arc<CircuitBreaker>,
        events: EventBus,
        echo: Arc<EchoRegister>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            provider,
            outbox,
            breaker,
            events,
            echo,
            batch_size: config.push_batch_size,
        }
    }

    /// Pushes until no ready operations remain.
    ///
    /// `op_id` is the idempotency key: re-pushing a batch after a dropped
    /// acknowledgment cannot duplicate effects, because the remote re-acks
    /// already-applied ids without applying them again. Partial success
    /// never retries acknowledged ops and never drops failed ones.
    pub(crate) fn run(
        &self,
        scope: &SyncScope,
        cancelled: &AtomicBool,
    ) -> EngineResult<PushOutcome> {
        let mut outcome = PushOutcome::default();

        loop {
            if cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            self.breaker.check()?;

            let batch = self
                .outbox
                .ready_batch(&scope.workspace_id, self.batch_size);
            if batch.is_empty() {
                break;
            }

            self.outbox.mark_sending(&batch);
            self.events.emit(SyncEvent::PushBefore { count: batch.len() });
            outcome.attempted += batch.len();

            match self.provider.push(scope, &batch) {
                Ok(receipt) => {
                    self.breaker.record_success();
                    // Acked ids become echoes the pull side must not reapply
                    for op_id in &receipt.acked {
                        self.echo.record(*op_id);
                    }
                    let settlement = self.outbox.settle(&batch, &receipt);
                    outcome.acked += settlement.acked;
                    outcome.rejected += settlement.failed;
                    outcome.superseded += settlement.superseded;

                    debug!(
                        acked = settlement.acked,
                        rejected = settlement.failed,
                        throttled = settlement.throttled,
                        "push batch settled"
                    );
                    self.events.emit(SyncEvent::PushAfter {
                        success_count: settlement.acked,
                        fail_count: settlement.failed + settlement.throttled,
                    });

                    // A throttled batch stops the drain; backoff gates the rest
                    if settlement.throttled > 0 {
                        break;
                    }
                }
                Err(err) => {
                    if err.counts_as_breaker_failure() {
                        self.breaker.record_failure();
                    }
                    self.outbox
                        .record_transport_failure(&batch, &err.to_string());
                    self.events.emit(SyncEvent::PushAfter {
                        success_count: 0,
                        fail_count: batch.len(),
                    });
                    return Err(err);
                }
            }
        }

        Ok(outcome)
    }
}
