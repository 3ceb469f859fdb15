//! Error types for the store module.

use thiserror::Error;

/// Errors raised while generating DDL for a remote schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A remote column type has no physical mapping.
    #[error("table {table}: column {column} has unmapped type {data_type}")]
    UnmappedType {
        table: String,
        column: String,
        data_type: String,
    },

    /// A table definition cannot be expressed as DDL.
    #[error("table {table}: {reason}")]
    Unsupported { table: String, reason: String },
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Schema mismatch: the remote schema cannot be applied locally.
    #[error("schema mismatch: {0}")]
    Schema(#[from] SchemaError),

    /// Serialization of persisted state failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lock guarding the connection or transaction state was poisoned.
    #[error("lock poisoned: {0}")]
    Poisoned(String),

    /// The handle's transaction is no longer the live root.
    #[error("transaction {0} is no longer active")]
    TransactionInactive(u64),

    /// A root commit was refused because a nested handle rolled back.
    #[error("transaction {0} was marked rollback-only and has been rolled back")]
    RollbackOnly(u64),

    /// A write was attempted through a read-uncommitted handle.
    #[error("write attempted through a read-only transaction")]
    ReadOnly,

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
