//! Row and table change events.

use std::sync::Arc;

use crate::schema::TableDefinition;
use crate::types::{RowKey, Value};

/// What happened to a table or one of its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A full refresh started: every cached row is provisionally stale.
    UnTouchRows,
    /// A full refresh finished: rows not touched since `UnTouchRows` are gone.
    UnTouchedDeleteRows,
    /// Something in the table changed; dependent views should reload.
    TableChanged,
    RowInsert,
    RowUpdate,
    RowDelete,
}

/// A change notification delivered through the [`ChangeBus`](crate::ChangeBus).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Arc<TableDefinition>,
    /// Current key of the affected row.
    pub key: Option<RowKey>,
    /// Key before the change, when an update renamed the row.
    pub old_key: Option<RowKey>,
    /// Full column-value snapshot in [`TableDefinition::data_columns`] order.
    pub values: Option<Vec<Value>>,
}

impl ChangeEvent {
    fn table_level(kind: ChangeKind, table: Arc<TableDefinition>) -> Self {
        Self {
            kind,
            table,
            key: None,
            old_key: None,
            values: None,
        }
    }

    pub fn table_changed(table: Arc<TableDefinition>) -> Self {
        Self::table_level(ChangeKind::TableChanged, table)
    }

    pub fn untouch_rows(table: Arc<TableDefinition>) -> Self {
        Self::table_level(ChangeKind::UnTouchRows, table)
    }

    pub fn untouched_delete_rows(table: Arc<TableDefinition>) -> Self {
        Self::table_level(ChangeKind::UnTouchedDeleteRows, table)
    }

    pub fn row_insert(table: Arc<TableDefinition>, key: RowKey, values: Vec<Value>) -> Self {
        Self {
            kind: ChangeKind::RowInsert,
            table,
            key: Some(key),
            old_key: None,
            values: Some(values),
        }
    }

    /// An update; `old_key` differs from `key` when the key column changed.
    pub fn row_update(
        table: Arc<TableDefinition>,
        old_key: RowKey,
        key: RowKey,
        values: Vec<Value>,
    ) -> Self {
        let old_key = (old_key != key).then_some(old_key);
        Self {
            kind: ChangeKind::RowUpdate,
            table,
            key: Some(key),
            old_key,
            values: Some(values),
        }
    }

    pub fn row_delete(table: Arc<TableDefinition>, key: RowKey) -> Self {
        Self {
            kind: ChangeKind::RowDelete,
            table,
            key: Some(key),
            old_key: None,
            values: None,
        }
    }

    /// The key the row had before this event: `old_key` if the row was
    /// renamed, else `key`. Key-scoped subscriptions match on this.
    pub fn prior_key(&self) -> Option<&RowKey> {
        self.old_key.as_ref().or(self.key.as_ref())
    }

    /// True for RowInsert / RowUpdate / RowDelete.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self.kind,
            ChangeKind::RowInsert | ChangeKind::RowUpdate | ChangeKind::RowDelete
        )
    }
}
