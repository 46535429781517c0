//! Error types for the local store.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot or metadata file could not be parsed.
    #[error("corrupt store file: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Another process holds the store directory lock.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The store directory does not exist and creation was disabled.
    #[error("store directory missing: {path}")]
    DirectoryMissing {
        /// The missing path.
        path: String,
    },

    /// The outbox is at capacity; the write was refused, not dropped.
    #[error("outbox full: {capacity} operations pending")]
    OutboxFull {
        /// Configured capacity that was hit.
        capacity: usize,
    },

    /// A record was written with a clock that does not increase.
    #[error("clock regression on {table}/{primary_key}: {attempted} <= {current}")]
    ClockRegression {
        /// Table of the record.
        table: String,
        /// Primary key of the record.
        primary_key: String,
        /// Clock value of the refused write.
        attempted: u64,
        /// Clock value already stored.
        current: u64,
    },

    /// The transaction was abandoned by its closure.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for the abort.
        reason: String,
    },
}

impl StoreError {
    /// Creates a transaction-aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }
}
