//! Error types for the sync engine.

use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Provider call exceeded its bound.
    ///
    /// Treated exactly like a transient transport failure: it feeds the
    /// circuit breaker and backoff applies.
    #[error("provider call timed out")]
    Timeout,

    /// The remote refused an operation on validation grounds.
    #[error("operation {op_id} rejected: {reason}")]
    Rejected {
        /// The refused operation.
        op_id: Uuid,
        /// Machine-readable reason.
        reason: String,
    },

    /// The cursor was pruned by server retention; a full rescan is needed.
    ///
    /// Not a failure: the pull manager recovers by rescanning.
    #[error("cursor expired; full rescan required")]
    CursorExpired,

    /// The outbox refused an enqueue at capacity.
    #[error("outbox full: {capacity} operations pending")]
    QueueFull {
        /// Configured capacity that was hit.
        capacity: usize,
    },

    /// The circuit breaker is open; no call was made.
    #[error("circuit open; retry in {retry_in_ms} ms")]
    BreakerOpen {
        /// Deterministic time until the next trial is allowed.
        retry_in_ms: u64,
    },

    /// An operation exhausted its retry budget.
    #[error("operation {op_id} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        /// The operation out of budget.
        op_id: Uuid,
        /// Attempts made.
        attempts: u32,
        /// Final error message.
        message: String,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] driftsync_store::StoreError),

    /// The remote change stream violated its ordering contract.
    #[error("change stream out of order: {server_version} after {cursor}")]
    OutOfOrder {
        /// Version that arrived.
        server_version: u64,
        /// Cursor position it should have exceeded.
        cursor: u64,
    },

    /// Sync was cancelled, e.g. by a scope switch.
    #[error("sync cancelled")]
    Cancelled,

    /// Credential broker failure in direct mode.
    #[error("credential error: {0}")]
    Credential(String),
}

impl EngineError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the error is transient and the call can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::Timeout => true,
            EngineError::BreakerOpen { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the error should count against the circuit breaker.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            EngineError::Transport { retryable: true, .. } | EngineError::Timeout
        )
    }
}
