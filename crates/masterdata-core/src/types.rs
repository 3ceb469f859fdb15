//! Value types shared by the store, the sync engine and the caches.
//!
//! Column values are dynamically typed (the store is SQLite), so a row is a
//! `Vec<Value>` in table column order. Rows are addressed by a [`RowKey`],
//! which is the hashable projection of a key column value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single column value.
///
/// Serialized untagged, so the feed carries plain JSON scalars:
/// `null`, `42`, `4.2`, `"text"`. Blobs travel as byte arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// True for SQL `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view, accepting whole reals and numeric text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Real(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text view (only for text values).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Hashable key of a row: the value of the table's (virtual) primary key.
///
/// Server-assigned keys are non-negative; rows created locally before they
/// are pushed carry strictly negative integer keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Integer(i64),
    Text(String),
}

impl RowKey {
    /// Project a value onto a key. `NULL`, reals with a fraction and blobs
    /// have no key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(RowKey::Integer(*i)),
            Value::Real(f) if f.fract() == 0.0 => Some(RowKey::Integer(*f as i64)),
            Value::Text(s) => Some(RowKey::Text(s.clone())),
            _ => None,
        }
    }

    /// Convert back into a bindable value.
    pub fn to_value(&self) -> Value {
        match self {
            RowKey::Integer(i) => Value::Integer(*i),
            RowKey::Text(s) => Value::Text(s.clone()),
        }
    }

    /// True for keys of rows that were created locally and never synced.
    pub fn is_local(&self) -> bool {
        matches!(self, RowKey::Integer(i) if *i < 0)
    }
}

impl From<i64> for RowKey {
    fn from(v: i64) -> Self {
        RowKey::Integer(v)
    }
}

impl From<&str> for RowKey {
    fn from(v: &str) -> Self {
        RowKey::Text(v.to_string())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Integer(i) => write!(f, "{}", i),
            RowKey::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Direction of a user-authored tag edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagOp {
    Add,
    Remove,
}

/// A tag edit made locally, pushed with the next sync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEdit {
    /// Key of the tagged object, rendered as text.
    pub object_key: String,
    /// The tag value.
    pub tag: String,
    pub op: TagOp,
}
