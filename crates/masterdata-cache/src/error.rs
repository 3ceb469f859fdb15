//! Error types for the cache module.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading the store failed.
    #[error("store error: {0}")]
    Store(#[from] masterdata_store::StoreError),

    /// No table of that name in the schema in effect.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The table has neither a virtual nor a primary key.
    #[error("table {0} has no key column")]
    NoKeyColumn(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Store(e.into())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
