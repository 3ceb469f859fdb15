//! Error types for the core crate.

use thiserror::Error;

/// Errors raised while loading schema definitions.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The schema document is not valid JSON or misses required fields.
    #[error("malformed schema document: {0}")]
    Document(#[from] serde_json::Error),

    /// The document parsed but describes an unusable schema.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Two tables share a name.
    #[error("duplicate table: {0}")]
    DuplicateTable(String),
}
