//! Error types for store operations.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a [`DataBroker`](crate::DataBroker).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store rejected the transaction.
    #[error("Commit failed: {reason}")]
    CommitFailed {
        /// Reason reported by the store.
        reason: String,
    },

    /// The commit did not complete within the configured bound.
    #[error("Commit did not complete within {timeout:?}")]
    CommitTimeout {
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// The store is no longer accepting requests.
    #[error("Store is shut down")]
    Shutdown,
}

impl StoreError {
    /// Creates a commit failure.
    pub fn commit_failed(reason: impl Into<String>) -> Self {
        Self::CommitFailed {
            reason: reason.into(),
        }
    }

    /// Returns true if a later transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::CommitFailed { .. } | StoreError::CommitTimeout { .. }
        )
    }
}
