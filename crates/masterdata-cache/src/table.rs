//! Per-table row cache and views.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use masterdata_core::{
    ChangeBus, ChangeEvent, ChangeKind, ColumnDefinition, RowKey, Subscription, TableDefinition,
    Value,
};
use masterdata_store::sql::{ident_list, quote_ident, read_values, to_sql};
use masterdata_store::LocalStore;
use rusqlite::params_from_iter;

use crate::error::{CacheError, Result};
use crate::row::CachedRow;

type RowMap = HashMap<RowKey, Weak<CachedRow>>;

#[derive(Clone)]
struct Shape {
    definition: Arc<TableDefinition>,
    columns: Arc<Vec<String>>,
}

impl Shape {
    fn of(definition: Arc<TableDefinition>) -> Self {
        let columns = definition.data_columns().map(|c| c.name.clone()).collect();
        Self {
            definition,
            columns: Arc::new(columns),
        }
    }

    fn key_column(&self) -> Result<(usize, &ColumnDefinition)> {
        let missing = || CacheError::NoKeyColumn(self.definition.name.clone());
        let column = self.definition.key_column().ok_or_else(missing)?;
        let index = self
            .definition
            .data_column_index(&column.name)
            .ok_or_else(missing)?;
        Ok((index, column))
    }

    /// Normalize a caller-supplied key to the key column's affinity.
    fn normalize(&self, key: &RowKey) -> Result<RowKey> {
        let (_, column) = self.key_column()?;
        Ok(column.key_of(&key.to_value()).unwrap_or_else(|| key.clone()))
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT {} FROM {}",
            ident_list(self.columns.iter().map(String::as_str)),
            quote_ident(&self.definition.name)
        )
    }
}

/// Cache of the rows of one table.
///
/// Rows are held weakly: a row stays cached while someone holds its `Arc`.
/// The table subscribes to its own change events and keeps live rows in
/// step with them; it never reloads a live row on its own.
pub struct CachedTable {
    me: Weak<CachedTable>,
    shape: RwLock<Shape>,
    store: Arc<LocalStore>,
    rows: Mutex<RowMap>,
    _subscription: Subscription,
}

impl CachedTable {
    pub fn new(definition: Arc<TableDefinition>, store: Arc<LocalStore>, bus: &ChangeBus) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<CachedTable>| {
            let listener = me.clone();
            let subscription = bus.subscribe(&definition.name, None, move |event| {
                if let Some(table) = listener.upgrade() {
                    table.on_change(event);
                }
            });
            CachedTable {
                me: me.clone(),
                shape: RwLock::new(Shape::of(definition)),
                store,
                rows: Mutex::new(HashMap::new()),
                _subscription: subscription,
            }
        })
    }

    fn shape(&self) -> Shape {
        self.shape
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rows(&self) -> MutexGuard<'_, RowMap> {
        // Every update under this lock is a single map operation.
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn definition(&self) -> Arc<TableDefinition> {
        self.shape().definition
    }

    pub fn name(&self) -> String {
        self.shape().definition.name.clone()
    }

    /// The row with this key, from the cache or read from the store.
    pub fn get_row(&self, key: &RowKey) -> Result<Option<Arc<CachedRow>>> {
        let shape = self.shape();
        let key = shape.normalize(key)?;

        let mut rows = self.rows();
        if let Some(row) = rows.get(&key).and_then(Weak::upgrade) {
            return Ok(Some(row));
        }
        match self.load(&shape, &key)? {
            Some(values) => Ok(Some(self.insert_row(&shape, &mut rows, key, values))),
            None => {
                rows.remove(&key);
                Ok(None)
            }
        }
    }

    /// Drop entries whose rows are no longer referenced. Returns how many
    /// were removed.
    pub fn purge(&self) -> usize {
        let mut rows = self.rows();
        let before = rows.len();
        rows.retain(|_, row| row.strong_count() > 0);
        before - rows.len()
    }

    /// Number of rows currently alive in the cache.
    pub fn live_rows(&self) -> usize {
        self.rows()
            .values()
            .filter(|row| row.strong_count() > 0)
            .count()
    }

    /// Start a query over this table.
    pub fn select(self: &Arc<Self>) -> TableView {
        TableView {
            table: Arc::clone(self),
            filters: Vec::new(),
            params: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    fn load(&self, shape: &Shape, key: &RowKey) -> Result<Option<Vec<Value>>> {
        let (_, column) = shape.key_column()?;
        let sql = format!(
            "{} WHERE {} = ?1 LIMIT 1",
            shape.select_sql(),
            quote_ident(&column.name)
        );
        let width = shape.columns.len();
        Ok(self
            .store
            .read()
            .query_row_optional(&sql, [to_sql(&key.to_value())], |row| read_values(row, width))?)
    }

    /// The cached row for `key`, refreshed with `values`, or a new one.
    fn materialize(&self, shape: &Shape, rows: &mut RowMap, key: RowKey, values: Vec<Value>) -> Arc<CachedRow> {
        if let Some(row) = rows.get(&key).and_then(Weak::upgrade) {
            row.apply(key, values);
            return row;
        }
        self.insert_row(shape, rows, key, values)
    }

    fn insert_row(&self, shape: &Shape, rows: &mut RowMap, key: RowKey, values: Vec<Value>) -> Arc<CachedRow> {
        let row = Arc::new(CachedRow::new(
            self.me.upgrade(),
            Arc::clone(&shape.columns),
            key.clone(),
            values,
        ));
        rows.insert(key, Arc::downgrade(&row));
        row
    }

    fn on_change(&self, event: &ChangeEvent) {
        let mut rows = self.rows();
        match event.kind {
            ChangeKind::UnTouchRows => {
                for row in rows.values().filter_map(Weak::upgrade) {
                    row.set_untouched();
                }
            }
            ChangeKind::UnTouchedDeleteRows => {
                rows.retain(|_, weak| match weak.upgrade() {
                    Some(row) if row.is_untouched() => {
                        row.mark_deleted();
                        false
                    }
                    Some(_) => true,
                    None => false,
                });
            }
            ChangeKind::RowInsert | ChangeKind::RowUpdate => {
                let (Some(key), Some(prior), Some(values)) =
                    (&event.key, event.prior_key(), &event.values)
                else {
                    return;
                };
                if let Some(row) = rows.remove(prior).and_then(|weak| weak.upgrade()) {
                    row.apply(key.clone(), values.clone());
                    rows.insert(key.clone(), Arc::downgrade(&row));
                }
            }
            ChangeKind::RowDelete => {
                if let Some(row) = event
                    .key
                    .as_ref()
                    .and_then(|key| rows.remove(key))
                    .and_then(|weak| weak.upgrade())
                {
                    row.mark_deleted();
                }
            }
            ChangeKind::TableChanged => {
                drop(rows);
                self.adopt(&event.table);
            }
        }
    }

    /// Switch to a new definition of the table and re-read live rows under it.
    ///
    /// Live rows are found again by their old key and filed under the key the
    /// new definition gives them, so a moved virtual key keeps held rows live.
    fn adopt(&self, definition: &Arc<TableDefinition>) {
        let old = {
            let mut shape = self.shape.write().unwrap_or_else(PoisonError::into_inner);
            if Arc::ptr_eq(&shape.definition, definition) || *shape.definition == **definition {
                return;
            }
            std::mem::replace(&mut *shape, Shape::of(Arc::clone(definition)))
        };

        let shape = self.shape();
        let mut rows = self.rows();
        let live: Vec<(RowKey, Arc<CachedRow>)> = rows
            .iter()
            .filter_map(|(key, weak)| weak.upgrade().map(|row| (key.clone(), row)))
            .collect();
        rows.clear();
        tracing::debug!(table = %definition.name, rows = live.len(), "table definition changed");

        for (key, row) in live {
            match self.reload(&old, &shape, &key) {
                Ok(Some((new_key, values))) => {
                    row.reshape(Arc::clone(&shape.columns), new_key.clone(), values);
                    rows.insert(new_key, Arc::downgrade(&row));
                }
                Ok(None) => row.mark_deleted(),
                Err(e) => {
                    tracing::warn!(table = %definition.name, error = %e, "could not reload cached row");
                    row.mark_deleted();
                }
            }
        }
    }

    /// Read the row stored under `key` in the `old` shape, in the `new`
    /// shape's columns, together with its key under `new`.
    fn reload(&self, old: &Shape, new: &Shape, key: &RowKey) -> Result<Option<(RowKey, Vec<Value>)>> {
        let (_, old_column) = old.key_column()?;
        let (index, new_column) = new.key_column()?;
        let sql = format!(
            "{} WHERE {} = ?1 LIMIT 1",
            new.select_sql(),
            quote_ident(&old_column.name)
        );
        let width = new.columns.len();
        let values = self
            .store
            .read()
            .query_row_optional(&sql, [to_sql(&key.to_value())], |row| read_values(row, width))?;
        Ok(values.and_then(|values| {
            let new_key = values.get(index).and_then(|v| new_column.key_of(v))?;
            Some((new_key, values))
        }))
    }
}

impl fmt::Debug for CachedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedTable")
            .field("name", &self.name())
            .field("live_rows", &self.live_rows())
            .finish()
    }
}

/// A filtered, ordered query over a cached table.
///
/// Filter and order clauses are SQL fragments over the table's columns;
/// filter parameters bind to `?` placeholders in the order given. Rows come
/// back through the row cache, so a row already held elsewhere is the same
/// `Arc`.
#[derive(Debug, Clone)]
pub struct TableView {
    table: Arc<CachedTable>,
    filters: Vec<String>,
    params: Vec<Value>,
    order_by: Option<String>,
    limit: Option<usize>,
}

impl TableView {
    /// Add a filter; several filters are combined with AND.
    pub fn filter(mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        self.filters.push(clause.into());
        self.params.extend(params);
        self
    }

    pub fn order_by(mut self, clause: impl Into<String>) -> Self {
        self.order_by = Some(clause.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn where_clause(&self) -> String {
        if self.filters.is_empty() {
            return String::new();
        }
        let joined: Vec<String> = self.filters.iter().map(|f| format!("({f})")).collect();
        format!(" WHERE {}", joined.join(" AND "))
    }

    pub fn rows(&self) -> Result<Vec<Arc<CachedRow>>> {
        let shape = self.table.shape();
        let (key_index, key_column) = shape.key_column()?;

        let mut sql = format!("{}{}", shape.select_sql(), self.where_clause());
        if let Some(order) = &self.order_by {
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let width = shape.columns.len();
        let fetched = self.table.store.read().query_map(
            &sql,
            params_from_iter(self.params.iter().map(to_sql)),
            |row| read_values(row, width),
        )?;

        let mut rows = self.table.rows();
        Ok(fetched
            .into_iter()
            .filter_map(|values| {
                let key = values.get(key_index).and_then(|v| key_column.key_of(v))?;
                Some(self.table.materialize(&shape, &mut rows, key, values))
            })
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        let shape = self.table.shape();
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            quote_ident(&shape.definition.name),
            self.where_clause()
        );
        let count: i64 = self.table.store.read().query_row(
            &sql,
            params_from_iter(self.params.iter().map(to_sql)),
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masterdata_core::DataType;
    use masterdata_store::Wait;

    fn bar() -> Arc<TableDefinition> {
        Arc::new(
            TableDefinition::new("Bar")
                .with_column(ColumnDefinition::new("Id", DataType::Integer).primary())
                .with_column(ColumnDefinition::new("Code", DataType::Text).unique())
                .with_column(ColumnDefinition::new("Name", DataType::Text))
                .use_as_key("Code"),
        )
    }

    fn setup() -> (Arc<LocalStore>, ChangeBus, Arc<CachedTable>) {
        let definition = bar();
        let store = Arc::new(LocalStore::open_memory().unwrap());
        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();
        tx.reconcile_schema(std::slice::from_ref(&definition)).unwrap();
        for (id, code, name) in [(1, "A", "alpha"), (2, "B", "beta"), (3, "C", "gamma")] {
            tx.execute(
                r#"INSERT INTO "Bar" ("Id", "Code", "Name") VALUES (?1, ?2, ?3)"#,
                rusqlite::params![id, code, name],
            )
            .unwrap();
        }
        tx.commit().unwrap();
        let bus = ChangeBus::new();
        let table = CachedTable::new(definition, Arc::clone(&store), &bus);
        (store, bus, table)
    }

    fn values(id: i64, code: &str, name: &str) -> Vec<Value> {
        vec![Value::Integer(id), Value::Text(code.into()), Value::Text(name.into())]
    }

    fn key(code: &str) -> RowKey {
        RowKey::Text(code.into())
    }

    #[test]
    fn test_get_row_is_shared_while_held() {
        let (_store, _bus, table) = setup();
        let first = table.get_row(&key("A")).unwrap().unwrap();
        let second = table.get_row(&key("A")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.get("name"), Some(Value::Text("alpha".into())));
        assert!(table.get_row(&key("Z")).unwrap().is_none());

        drop(first);
        drop(second);
        assert_eq!(table.live_rows(), 0);
        assert_eq!(table.purge(), 1);
    }

    #[test]
    fn test_update_event_mutates_held_row_in_place() {
        let (_store, bus, table) = setup();
        let row = table.get_row(&key("A")).unwrap().unwrap();

        bus.publish(&ChangeEvent::row_update(bar(), key("A"), key("A"), values(1, "A", "changed")));
        assert_eq!(row.get("Name"), Some(Value::Text("changed".into())));

        // Rename: the same row answers under its new key.
        bus.publish(&ChangeEvent::row_update(bar(), key("A"), key("Q"), values(1, "Q", "changed")));
        assert_eq!(row.key(), key("Q"));
        let renamed = table.get_row(&key("Q")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&row, &renamed));
    }

    #[test]
    fn test_delete_event_marks_and_evicts() {
        let (store, bus, table) = setup();
        let row = table.get_row(&key("B")).unwrap().unwrap();

        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();
        tx.execute(r#"DELETE FROM "Bar" WHERE "Code" = 'B'"#, []).unwrap();
        tx.commit().unwrap();
        bus.publish(&ChangeEvent::row_delete(bar(), key("B")));

        assert!(row.is_deleted());
        assert!(table.get_row(&key("B")).unwrap().is_none());
    }

    #[test]
    fn test_untouched_rows_are_deleted_after_refresh() {
        let (_store, bus, table) = setup();
        let a = table.get_row(&key("A")).unwrap().unwrap();
        let b = table.get_row(&key("B")).unwrap().unwrap();

        bus.publish(&ChangeEvent::untouch_rows(bar()));
        assert!(a.is_untouched() && b.is_untouched());
        bus.publish(&ChangeEvent::row_insert(bar(), key("A"), values(1, "A", "alpha")));
        bus.publish(&ChangeEvent::untouched_delete_rows(bar()));

        assert!(!a.is_deleted());
        assert!(!a.is_untouched());
        assert!(b.is_deleted());
    }

    #[test]
    fn test_select_filters_orders_and_shares_rows() {
        let (_store, _bus, table) = setup();
        let held = table.get_row(&key("C")).unwrap().unwrap();

        let view = table
            .select()
            .filter(r#""Id" >= ?"#, [Value::Integer(2)])
            .order_by(r#""Id" DESC"#);
        assert_eq!(view.count().unwrap(), 2);

        let rows = view.rows().unwrap();
        let codes: Vec<RowKey> = rows.iter().map(|r| r.key()).collect();
        assert_eq!(codes, vec![key("C"), key("B")]);
        assert!(Arc::ptr_eq(&rows[0], &held));

        assert_eq!(table.select().limit(1).rows().unwrap().len(), 1);
        assert_eq!(table.select().count().unwrap(), 3);
    }

    #[test]
    fn test_table_changed_with_new_definition_reshapes_rows() {
        let (store, bus, table) = setup();
        let row = table.get_row(&key("A")).unwrap().unwrap();

        let wider = Arc::new(
            (*bar())
                .clone()
                .with_column(ColumnDefinition::new("Extra", DataType::Text).default_value("x")),
        );
        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();
        tx.reconcile_schema(std::slice::from_ref(&wider)).unwrap();
        tx.commit().unwrap();

        bus.publish(&ChangeEvent::table_changed(Arc::clone(&wider)));
        assert_eq!(row.get("Extra"), Some(Value::Text("x".into())));
        assert_eq!(*table.definition(), *wider);
    }

    #[test]
    fn test_moved_virtual_key_refiles_held_rows() {
        let (_store, bus, table) = setup();
        let row = table.get_row(&key("A")).unwrap().unwrap();

        let by_id = Arc::new(
            TableDefinition::new("Bar")
                .with_column(ColumnDefinition::new("Id", DataType::Integer).primary())
                .with_column(ColumnDefinition::new("Code", DataType::Text).unique())
                .with_column(ColumnDefinition::new("Name", DataType::Text)),
        );
        bus.publish(&ChangeEvent::table_changed(Arc::clone(&by_id)));
        assert_eq!(row.key(), RowKey::Integer(1));
        assert!(!row.is_deleted());
        assert!(Arc::ptr_eq(&table.get_row(&RowKey::Integer(1)).unwrap().unwrap(), &row));

        let id = RowKey::Integer(1);
        bus.publish(&ChangeEvent::row_update(by_id, id.clone(), id, values(1, "A", "renamed")));
        assert_eq!(row.get("Name"), Some(Value::Text("renamed".into())));
    }

    #[test]
    fn test_held_row_keeps_its_table_listening() {
        let (_store, bus, table) = setup();
        let row = table.get_row(&key("A")).unwrap().unwrap();
        drop(table);

        bus.publish(&ChangeEvent::row_update(bar(), key("A"), key("A"), values(1, "A", "later")));
        assert_eq!(row.get("Name"), Some(Value::Text("later".into())));
        assert!(row.table().is_some());
    }

    #[test]
    fn test_dropped_table_stops_listening() {
        let (_store, bus, table) = setup();
        assert_eq!(bus.publish(&ChangeEvent::table_changed(bar())), 1);
        drop(table);
        assert_eq!(bus.publish(&ChangeEvent::table_changed(bar())), 0);
        assert!(bus.is_empty());
    }
}
