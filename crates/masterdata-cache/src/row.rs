//! Materialized rows.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use masterdata_core::{RowKey, Value};

use crate::table::CachedTable;

#[derive(Debug, Clone)]
struct RowState {
    columns: Arc<Vec<String>>,
    key: RowKey,
    values: Vec<Value>,
    untouched: bool,
    deleted: bool,
}

/// A row of a replicated table, shared by everyone who looked it up.
///
/// The owning [`CachedTable`](crate::CachedTable) updates it in place when a
/// change event for its key arrives, so every holder sees the new values.
/// A deleted row keeps its last values and reports [`is_deleted`](Self::is_deleted).
///
/// A row keeps its table alive, so the table keeps listening for as long as
/// any of its rows is held.
pub struct CachedRow {
    table: Option<Arc<CachedTable>>,
    state: RwLock<RowState>,
}

impl CachedRow {
    pub(crate) fn new(
        table: Option<Arc<CachedTable>>,
        columns: Arc<Vec<String>>,
        key: RowKey,
        values: Vec<Value>,
    ) -> Self {
        Self {
            table,
            state: RwLock::new(RowState {
                columns,
                key,
                values,
                untouched: false,
                deleted: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RowState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RowState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn table(&self) -> Option<&Arc<CachedTable>> {
        self.table.as_ref()
    }

    pub fn key(&self) -> RowKey {
        self.read().key.clone()
    }

    /// Snapshot of all data-column values, in definition order.
    pub fn values(&self) -> Vec<Value> {
        self.read().values.clone()
    }

    /// Value of one column (case-insensitive).
    pub fn get(&self, column: &str) -> Option<Value> {
        let state = self.read();
        let index = state
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        state.values.get(index).cloned()
    }

    pub fn is_deleted(&self) -> bool {
        self.read().deleted
    }

    /// True between a full refresh starting and the row being re-sent.
    pub fn is_untouched(&self) -> bool {
        self.read().untouched
    }

    pub(crate) fn apply(&self, key: RowKey, values: Vec<Value>) {
        let mut state = self.write();
        state.key = key;
        state.values = values;
        state.untouched = false;
        state.deleted = false;
    }

    /// Replace values after the table's columns changed.
    pub(crate) fn reshape(&self, columns: Arc<Vec<String>>, key: RowKey, values: Vec<Value>) {
        let mut state = self.write();
        state.columns = columns;
        state.key = key;
        state.values = values;
        state.untouched = false;
        state.deleted = false;
    }

    pub(crate) fn set_untouched(&self) {
        self.write().untouched = true;
    }

    pub(crate) fn mark_deleted(&self) {
        self.write().deleted = true;
    }
}

impl fmt::Debug for CachedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("CachedRow")
            .field("key", &state.key)
            .field("values", &state.values)
            .field("untouched", &state.untouched)
            .field("deleted", &state.deleted)
            .finish()
    }
}
