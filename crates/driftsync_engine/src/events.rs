//! Observability hook surface.
//!
//! Fire-and-forget events for collaborators (status indicators, metrics
//! bridges, extensions). The engine's correctness never depends on a
//! subscriber being present.

use driftsync_protocol::Resolution;
use parking_lot::RwLock;
use std::sync::Arc;

/// An observability event emitted by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A push batch is about to be transmitted.
    PushBefore {
        /// Operations in the batch.
        count: usize,
    },
    /// A push batch finished.
    PushAfter {
        /// Operations acknowledged.
        success_count: usize,
        /// Operations rejected or errored.
        fail_count: usize,
    },
    /// A pull batch was applied.
    PullAfter {
        /// Changes applied.
        count: usize,
    },
    /// Two versions of a record met and one was discarded.
    ConflictDetected {
        /// Table of the record.
        table: String,
        /// Primary key of the record.
        primary_key: String,
        /// Which side won.
        resolution: Resolution,
    },
    /// A terminal sync error surfaced.
    Error {
        /// Error description.
        message: String,
    },
    /// A transient failure scheduled a retry.
    Retry {
        /// Milliseconds until the operation is eligible again.
        delay_ms: u64,
    },
    /// The outbox refused an enqueue at capacity.
    QueueFull {
        /// Configured capacity that was hit.
        capacity: usize,
    },
}

/// Subscriber callback type.
pub type EventHandler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Fan-out bus for [`SyncEvent`]s.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber.
    pub fn subscribe(&self, handler: EventHandler) {
        self.handlers.write().push(handler);
    }

    /// Emits an event to every subscriber.
    pub fn emit(&self, event: SyncEvent) {
        for handler in self.handlers.read().iter() {
            handler(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn events_reach_every_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            bus.subscribe(Arc::new(move |event| {
                if let SyncEvent::PullAfter { count } = event {
                    seen.lock().push(*count);
                }
            }));
        }

        bus.emit(SyncEvent::PullAfter { count: 3 });
        assert_eq!(*seen.lock(), vec![3, 3]);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::Error {
            message: "nobody listening".into(),
        });
    }
}
