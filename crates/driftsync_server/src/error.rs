//! Error types for the sync server.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors the server reports to clients.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerError {
    /// The requested cursor predates the retained change log.
    ///
    /// The client must perform a full rescan.
    #[error("cursor expired: oldest retained version is {oldest_retained}")]
    CursorExpired {
        /// Lowest version still served.
        oldest_retained: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ServerError::CursorExpired {
            oldest_retained: 42,
        };
        assert!(err.to_string().contains("42"));
    }
}
