//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The change feed is malformed or out of order.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server reported an error element.
    #[error("remote error: {0}")]
    Remote(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] masterdata_store::StoreError),

    /// The remote schema document is invalid.
    #[error("schema error: {0}")]
    Schema(#[from] masterdata_core::CoreError),

    /// Synchronization was started again from inside a running one on the
    /// same thread.
    #[error("synchronization is already running on this thread")]
    Recursion,

    /// An enforced run could not get the store within its timeout.
    #[error("store is busy: enforced synchronization timed out")]
    Contention,

    /// Feed or request serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading the feed failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock guarding engine state was poisoned.
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        SyncError::Poisoned(e.to_string())
    }
}

impl SyncError {
    /// True for errors that leave the replica consistent and can be retried
    /// later without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Contention | SyncError::Io(_)
        )
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
