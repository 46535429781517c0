//! Transport duality for the pull side.
//!
//! Two transport shapes live behind one [`SyncTransport`] trait: a
//! realtime subscription (the server pushes change batches) and a polling
//! fallback (periodic pull-since-cursor). Selection is by provider
//! capability, not by branching inside the pull manager.

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::provider::{Subscription, SyncProvider};
use driftsync_protocol::{ChangeBatch, Cursor, SyncScope};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Source of ordered change batches for the pull manager.
pub trait SyncTransport: Send {
    /// Returns the next available batch, or `None` when up to date.
    fn next_batch(&mut self, cursor: Cursor) -> EngineResult<Option<ChangeBatch>>;

    /// Tears the transport down.
    fn close(&mut self);
}

/// Polling fallback: pull-since-cursor on a fixed cadence.
pub struct PollingTransport {
    provider: Arc<dyn SyncProvider>,
    scope: SyncScope,
    interval: std::time::Duration,
    last_poll: Option<Instant>,
}

impl PollingTransport {
    /// Creates a polling transport.
    pub fn new(provider: Arc<dyn SyncProvider>, scope: SyncScope, config: &EngineConfig) -> Self {
        Self {
            provider,
            scope,
            interval: config.poll_interval,
            last_poll: None,
        }
    }
}

impl SyncTransport for PollingTransport {
    fn next_batch(&mut self, cursor: Cursor) -> EngineResult<Option<ChangeBatch>> {
        if let Some(last) = self.last_poll {
            if last.elapsed() < self.interval {
                return Ok(None);
            }
        }
        self.last_poll = Some(Instant::now());

        let batch = self.provider.pull(&self.scope, Some(cursor), None)?;
        if batch.changes.is_empty() && !batch.has_more {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    fn close(&mut self) {}
}

/// Realtime subscription: server-pushed batches buffered for the pump.
pub struct RealtimeTransport {
    queue: Arc<Mutex<VecDeque<ChangeBatch>>>,
    subscription: Option<Subscription>,
}

impl RealtimeTransport {
    /// Subscribes to the provider's change stream.
    pub fn connect(provider: &Arc<dyn SyncProvider>, scope: &SyncScope) -> EngineResult<Self> {
        let queue: Arc<Mutex<VecDeque<ChangeBatch>>> = Arc::new(Mutex::new(VecDeque::new()));
        let sink = Arc::clone(&queue);
        let subscription = provider.subscribe(
            scope,
            Arc::new(move |batch| {
                sink.lock().push_back(batch);
            }),
        )?;
        Ok(Self {
            queue,
            subscription: Some(subscription),
        })
    }

    /// Number of batches waiting to be pumped.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

impl SyncTransport for RealtimeTransport {
    fn next_batch(&mut self, _cursor: Cursor) -> EngineResult<Option<ChangeBatch>> {
        // Cursor filtering happens in the pull manager; replayed entries
        // at or below the cursor are skipped there.
        Ok(self.queue.lock().pop_front())
    }

    fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose();
        }
        self.queue.lock().clear();
    }
}

/// Picks the transport a provider can support.
pub fn select_transport(
    provider: &Arc<dyn SyncProvider>,
    scope: &SyncScope,
    config: &EngineConfig,
) -> EngineResult<Box<dyn SyncTransport>> {
    if provider.capabilities().realtime {
        debug!("using realtime subscription transport");
        Ok(Box::new(RealtimeTransport::connect(provider, scope)?))
    } else {
        debug!("provider lacks realtime support; falling back to polling");
        Ok(Box::new(PollingTransport::new(
            Arc::clone(provider),
            scope.clone(),
            config,
        )))
    }
}
