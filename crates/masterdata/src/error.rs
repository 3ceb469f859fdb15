//! Error types for the master-data facade.

use masterdata_cache::CacheError;
use masterdata_store::StoreError;
use masterdata_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during master-data operations.
#[derive(Debug, Error)]
pub enum MasterDataError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Cache error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// No table of that name in the schema in effect.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The operation does not apply to its target.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The store stayed busy for the whole write timeout.
    #[error("store is busy")]
    Busy,

    /// A background task failed to complete.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type for master-data operations.
pub type Result<T> = std::result::Result<T, MasterDataError>;
