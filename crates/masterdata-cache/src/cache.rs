//! Weak cache of [`CachedTable`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use masterdata_core::{ChangeBus, Schema, TableDefinition};
use masterdata_store::LocalStore;

use crate::error::{CacheError, Result};
use crate::table::CachedTable;

/// Hands out one [`CachedTable`] per table for as long as it is held.
pub struct TableCache {
    store: Arc<LocalStore>,
    bus: Arc<ChangeBus>,
    schema: RwLock<Option<Arc<Schema>>>,
    tables: Mutex<HashMap<String, Weak<CachedTable>>>,
}

impl TableCache {
    pub fn new(store: Arc<LocalStore>, bus: Arc<ChangeBus>) -> Self {
        Self {
            store,
            bus,
            schema: RwLock::new(None),
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Weak<CachedTable>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schema used to resolve [`get_table_by_name`](Self::get_table_by_name).
    pub fn set_schema(&self, schema: Option<Arc<Schema>>) {
        *self.schema.write().unwrap_or_else(PoisonError::into_inner) = schema;
    }

    pub fn schema(&self) -> Option<Arc<Schema>> {
        self.schema
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The cached table for `definition`, created on first use.
    pub fn get_table(&self, definition: &Arc<TableDefinition>) -> Arc<CachedTable> {
        let name = definition.name.to_ascii_lowercase();
        let mut tables = self.tables();
        if let Some(table) = tables.get(&name).and_then(Weak::upgrade) {
            return table;
        }
        tracing::trace!(table = %definition.name, "caching table");
        let table = CachedTable::new(Arc::clone(definition), Arc::clone(&self.store), &self.bus);
        tables.insert(name, Arc::downgrade(&table));
        table
    }

    /// The cached table named `name` (case-insensitive) in the current schema.
    pub fn get_table_by_name(&self, name: &str) -> Result<Arc<CachedTable>> {
        let definition = self
            .schema()
            .and_then(|schema| schema.get(name))
            .ok_or_else(|| CacheError::UnknownTable(name.to_string()))?;
        Ok(self.get_table(&definition))
    }

    /// Maintenance sweep: drop dead tables and dead rows of live ones.
    /// Returns the number of entries removed.
    pub fn purge(&self) -> usize {
        let live: Vec<Arc<CachedTable>> = {
            let mut tables = self.tables();
            tables.retain(|_, table| table.strong_count() > 0);
            tables.values().filter_map(Weak::upgrade).collect()
        };
        live.iter().map(|table| table.purge()).sum()
    }

    /// Number of tables currently alive in the cache.
    pub fn live_tables(&self) -> usize {
        self.tables()
            .values()
            .filter(|table| table.strong_count() > 0)
            .count()
    }
}
