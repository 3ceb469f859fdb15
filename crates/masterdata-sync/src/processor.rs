//! Batch processors: apply one table's feed rows inside a write transaction.
//!
//! A processor is created per batch. The engine calls [`BatchProcessor::prepare`]
//! once, [`BatchProcessor::apply`] per row, then [`BatchProcessor::clean`],
//! all inside the same transaction. Change events are buffered in
//! [`BatchOutput`] and published by the engine only after the commit.

use std::sync::Arc;

use masterdata_core::{
    ChangeEvent, ColumnDefinition, RowKey, TableDefinition, Value, REFRESH_COLUMN,
};
use masterdata_store::sql::{ident_list, quote_ident, read_values, to_sql};
use masterdata_store::Transaction;
use rusqlite::params_from_iter;

use crate::error::{Result, SyncError};
use crate::feed::{Cell, RowOp};

/// Buffered effects of one batch.
#[derive(Debug, Default)]
pub struct BatchOutput {
    /// Row and untouch events, in the order they happened.
    pub events: Vec<ChangeEvent>,
    /// True when anything in the table changed.
    pub changed: bool,
    /// Feed rows applied.
    pub rows: usize,
}

/// Applies one batch of feed rows to one table.
pub trait BatchProcessor {
    /// Called before the first row. Sets up full-refresh bookkeeping.
    fn prepare(&mut self, tx: &Transaction<'_>, out: &mut BatchOutput) -> Result<()>;

    /// Apply one feed row.
    fn apply(
        &mut self,
        tx: &Transaction<'_>,
        op: RowOp,
        cells: &[Cell],
        out: &mut BatchOutput,
    ) -> Result<()>;

    /// Called after the last row. Removes rows a full refresh did not send.
    fn clean(&mut self, tx: &Transaction<'_>, out: &mut BatchOutput) -> Result<()>;
}

/// Spread positional cells over the table's data columns.
///
/// Slots not present in the row stay `None` and are left untouched.
pub(crate) fn spread_cells(table: &TableDefinition, cells: &[Cell]) -> Result<Vec<Option<Value>>> {
    let width = table.data_columns().count();
    let mut row = vec![None; width];
    for Cell(slot, value) in cells {
        let target = row.get_mut(*slot).ok_or_else(|| {
            SyncError::Protocol(format!(
                "table {}: cell slot {} out of range ({} columns)",
                table.name, slot, width
            ))
        })?;
        *target = Some(value.clone());
    }
    Ok(row)
}

/// Insert/update/delete processor used for every ordinary table.
///
/// Rows are addressed by the table's virtual key (`use_as_key`, else the
/// primary key). An upsert first probes by virtual key; when that misses
/// and the virtual key is not the primary key, it probes by primary key, so
/// a row whose virtual key changed is updated in place and reported as a
/// rename. A row without a virtual key value is always inserted.
pub struct GenericProcessor {
    table: Arc<TableDefinition>,
    full_refresh: bool,
}

impl GenericProcessor {
    pub fn new(table: Arc<TableDefinition>, full_refresh: bool) -> Self {
        Self {
            table,
            full_refresh,
        }
    }

    fn columns(&self) -> Vec<&ColumnDefinition> {
        self.table.data_columns().collect()
    }

    fn key_column(&self) -> Result<(usize, &ColumnDefinition)> {
        let column = self.table.key_column().ok_or_else(|| {
            SyncError::Protocol(format!("table {} has no key column", self.table.name))
        })?;
        let index = self
            .table
            .data_column_index(&column.name)
            .ok_or_else(|| SyncError::Protocol(format!("table {}: key column missing", self.table.name)))?;
        Ok((index, column))
    }

    /// Key of the row whose `column` equals `value`, read back through the
    /// virtual key column.
    fn probe(
        &self,
        tx: &Transaction<'_>,
        column: &ColumnDefinition,
        value: &Value,
    ) -> Result<Option<RowKey>> {
        let (_, key_column) = self.key_column()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 LIMIT 1",
            quote_ident(&key_column.name),
            quote_ident(&self.table.name),
            quote_ident(&column.name)
        );
        let found = tx.query_row_optional(&sql, [to_sql(value)], |row| {
            row.get_ref(0).map(masterdata_store::sql::from_sql)
        })?;
        Ok(found.and_then(|v| key_column.key_of(&v)))
    }

    /// Full data-column snapshot of the row addressed by `column = value`.
    fn snapshot(
        &self,
        tx: &Transaction<'_>,
        column: &str,
        value: &Value,
    ) -> Result<Option<Vec<Value>>> {
        let columns = self.columns();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 LIMIT 1",
            ident_list(columns.iter().map(|c| c.name.as_str())),
            quote_ident(&self.table.name),
            quote_ident(column)
        );
        Ok(tx.query_row_optional(&sql, [to_sql(value)], |row| {
            read_values(row, columns.len())
        })?)
    }

    fn upsert(&self, tx: &Transaction<'_>, row: Vec<Option<Value>>, out: &mut BatchOutput) -> Result<()> {
        let columns = self.columns();
        let (key_index, key_column) = self.key_column()?;
        let new_key = row[key_index]
            .as_ref()
            .and_then(|value| key_column.key_of(value));

        // (column used to address the existing row, its value, the old key)
        let mut existing = None;
        if let Some(key) = &new_key {
            if self.probe(tx, key_column, &key.to_value())?.is_some() {
                existing = Some((key_column, key.to_value(), key.clone()));
            } else if let Some(primary) = self.table.primary_key() {
                if !primary.name.eq_ignore_ascii_case(&key_column.name) {
                    let primary_index = self.table.data_column_index(&primary.name);
                    if let Some(Some(pk_value)) = primary_index.and_then(|i| row.get(i)) {
                        if let Some(old_key) = self.probe(tx, primary, pk_value)? {
                            existing = Some((primary, pk_value.clone(), old_key));
                        }
                    }
                }
            }
        }

        let assigned: Vec<(&ColumnDefinition, &Value)> = columns
            .iter()
            .zip(&row)
            .filter_map(|(column, value)| value.as_ref().map(|v| (*column, v)))
            .collect();
        let mut names: Vec<String> = assigned.iter().map(|(c, _)| quote_ident(&c.name)).collect();
        let mut params: Vec<rusqlite::types::Value> = assigned.iter().map(|(_, v)| to_sql(v)).collect();
        if self.table.track_refresh {
            names.push(quote_ident(REFRESH_COLUMN));
            params.push(rusqlite::types::Value::Integer(1));
        }

        let table = quote_ident(&self.table.name);
        match existing {
            Some((address, address_value, old_key)) => {
                let sets: Vec<String> = names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| format!("{} = ?{}", name, i + 1))
                    .collect();
                if !sets.is_empty() {
                    let sql = format!(
                        "UPDATE {} SET {} WHERE {} = ?{}",
                        table,
                        sets.join(", "),
                        quote_ident(&address.name),
                        params.len() + 1
                    );
                    params.push(to_sql(&address_value));
                    tx.execute(&sql, params_from_iter(params))?;
                }

                let key = new_key.unwrap_or_else(|| old_key.clone());
                let values = self
                    .snapshot(tx, &key_column.name, &key.to_value())?
                    .unwrap_or_default();
                out.events
                    .push(ChangeEvent::row_update(Arc::clone(&self.table), old_key, key, values));
            }
            None => {
                let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    names.join(", "),
                    placeholders.join(", ")
                );
                tx.execute(&sql, params_from_iter(params))?;

                // Without a key the row can only be found again by rowid.
                let key = match new_key {
                    Some(key) => Some(key),
                    None => {
                        let rowid = tx.last_insert_rowid()?;
                        self.snapshot(tx, "rowid", &Value::Integer(rowid))?
                            .and_then(|values| values.get(key_index).and_then(|v| key_column.key_of(v)))
                    }
                };
                if let Some(key) = key {
                    let values = self
                        .snapshot(tx, &key_column.name, &key.to_value())?
                        .unwrap_or_default();
                    out.events
                        .push(ChangeEvent::row_insert(Arc::clone(&self.table), key, values));
                }
            }
        }
        out.changed = true;
        Ok(())
    }

    fn delete(&self, tx: &Transaction<'_>, row: &[Option<Value>], out: &mut BatchOutput) -> Result<()> {
        let (key_index, key_column) = self.key_column()?;
        let Some(key) = row[key_index].as_ref().and_then(|v| key_column.key_of(v)) else {
            return Err(SyncError::Protocol(format!(
                "table {}: delete row without key",
                self.table.name
            )));
        };
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&self.table.name),
            quote_ident(&key_column.name)
        );
        if tx.execute(&sql, [to_sql(&key.to_value())])? > 0 {
            out.events
                .push(ChangeEvent::row_delete(Arc::clone(&self.table), key));
            out.changed = true;
        }
        Ok(())
    }
}

impl BatchProcessor for GenericProcessor {
    fn prepare(&mut self, tx: &Transaction<'_>, out: &mut BatchOutput) -> Result<()> {
        if !self.full_refresh {
            return Ok(());
        }
        let table = quote_ident(&self.table.name);
        if self.table.track_refresh {
            tx.execute(
                &format!("UPDATE {} SET {} = NULL", table, quote_ident(REFRESH_COLUMN)),
                [],
            )?;
        } else {
            tx.execute(&format!("DELETE FROM {table}"), [])?;
            out.events
                .push(ChangeEvent::untouch_rows(Arc::clone(&self.table)));
            out.changed = true;
        }
        Ok(())
    }

    fn apply(
        &mut self,
        tx: &Transaction<'_>,
        op: RowOp,
        cells: &[Cell],
        out: &mut BatchOutput,
    ) -> Result<()> {
        let row = spread_cells(&self.table, cells)?;
        match op {
            RowOp::Delete => self.delete(tx, &row, out)?,
            RowOp::Refresh | RowOp::Insert | RowOp::Update => self.upsert(tx, row, out)?,
        }
        out.rows += 1;
        Ok(())
    }

    fn clean(&mut self, tx: &Transaction<'_>, out: &mut BatchOutput) -> Result<()> {
        if !self.full_refresh {
            return Ok(());
        }
        if !self.table.track_refresh {
            out.events
                .push(ChangeEvent::untouched_delete_rows(Arc::clone(&self.table)));
            return Ok(());
        }

        let (_, key_column) = self.key_column()?;
        let table = quote_ident(&self.table.name);
        let refresh = quote_ident(REFRESH_COLUMN);
        let stale: Vec<Value> = tx.query_map(
            &format!(
                "SELECT {} FROM {} WHERE {} IS NULL",
                quote_ident(&key_column.name),
                table,
                refresh
            ),
            [],
            |row| row.get_ref(0).map(masterdata_store::sql::from_sql),
        )?;
        if stale.is_empty() {
            return Ok(());
        }

        tx.execute(&format!("DELETE FROM {table} WHERE {refresh} IS NULL"), [])?;
        tracing::debug!(table = %self.table.name, rows = stale.len(), "removed rows missing from full refresh");
        for value in stale {
            if let Some(key) = key_column.key_of(&value) {
                out.events
                    .push(ChangeEvent::row_delete(Arc::clone(&self.table), key));
            }
        }
        out.changed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masterdata_core::{ChangeKind, DataType};
    use masterdata_store::{LocalStore, Wait};
    use proptest::prelude::*;

    fn table(track_refresh: bool) -> Arc<TableDefinition> {
        let mut table = TableDefinition::new("Bar")
            .with_column(ColumnDefinition::new("Id", DataType::Integer).primary())
            .with_column(ColumnDefinition::new("Code", DataType::Text).unique())
            .with_column(ColumnDefinition::new("Name", DataType::Text));
        table.track_refresh = track_refresh;
        Arc::new(table)
    }

    fn store_with(table: &Arc<TableDefinition>) -> LocalStore {
        let store = LocalStore::open_memory().unwrap();
        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();
        tx.reconcile_schema(std::slice::from_ref(table)).unwrap();
        tx.commit().unwrap();
        store
    }

    fn row(id: i64, code: &str, name: &str) -> Vec<Cell> {
        vec![
            Cell(0, Value::Integer(id)),
            Cell(1, Value::Text(code.into())),
            Cell(2, Value::Text(name.into())),
        ]
    }

    fn run(
        store: &LocalStore,
        mut processor: impl BatchProcessor,
        rows: &[(RowOp, Vec<Cell>)],
    ) -> BatchOutput {
        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();
        let mut out = BatchOutput::default();
        processor.prepare(&tx, &mut out).unwrap();
        for (op, cells) in rows {
            processor.apply(&tx, *op, cells, &mut out).unwrap();
        }
        processor.clean(&tx, &mut out).unwrap();
        tx.commit().unwrap();
        out
    }

    fn ids(store: &LocalStore) -> Vec<i64> {
        store
            .read()
            .query_map(r#"SELECT "Id" FROM "Bar" ORDER BY "Id""#, [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_insert_then_update_by_probe() {
        let table = table(false);
        let store = store_with(&table);

        let out = run(
            &store,
            GenericProcessor::new(Arc::clone(&table), false),
            &[(RowOp::Insert, row(1, "A", "first"))],
        );
        assert_eq!(out.events[0].kind, ChangeKind::RowInsert);
        assert_eq!(
            out.events[0].values,
            Some(vec![Value::Integer(1), "A".into(), "first".into()])
        );

        // An "insert" for an existing key is applied as an update.
        let out = run(
            &store,
            GenericProcessor::new(Arc::clone(&table), false),
            &[(RowOp::Insert, row(1, "A", "second"))],
        );
        assert_eq!(out.events[0].kind, ChangeKind::RowUpdate);
        assert_eq!(out.events[0].old_key, None);
        assert_eq!(ids(&store), vec![1]);
    }

    #[test]
    fn test_partial_update_keeps_other_columns() {
        let table = table(false);
        let store = store_with(&table);
        run(
            &store,
            GenericProcessor::new(Arc::clone(&table), false),
            &[(RowOp::Insert, row(1, "A", "first"))],
        );

        let out = run(
            &store,
            GenericProcessor::new(Arc::clone(&table), false),
            &[(RowOp::Update, vec![Cell(0, Value::Integer(1)), Cell(2, "renamed".into())])],
        );
        assert_eq!(
            out.events[0].values,
            Some(vec![Value::Integer(1), "A".into(), "renamed".into()])
        );
    }

    #[test]
    fn test_delete_missing_row_is_noop() {
        let table = table(false);
        let store = store_with(&table);
        let out = run(
            &store,
            GenericProcessor::new(Arc::clone(&table), false),
            &[(RowOp::Delete, vec![Cell(0, Value::Integer(9))])],
        );
        assert!(out.events.is_empty());
        assert!(!out.changed);
        assert_eq!(out.rows, 1);
    }

    #[test]
    fn test_full_refresh_without_refresh_column_untouches() {
        let table = table(false);
        let store = store_with(&table);
        run(
            &store,
            GenericProcessor::new(Arc::clone(&table), false),
            &[
                (RowOp::Insert, row(1, "A", "a")),
                (RowOp::Insert, row(2, "B", "b")),
            ],
        );

        let out = run(
            &store,
            GenericProcessor::new(Arc::clone(&table), true),
            &[(RowOp::Refresh, row(2, "B", "b"))],
        );
        let kinds: Vec<_> = out.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::UnTouchRows,
                ChangeKind::RowInsert,
                ChangeKind::UnTouchedDeleteRows
            ]
        );
        assert_eq!(ids(&store), vec![2]);
    }

    #[test]
    fn test_slot_out_of_range_is_protocol_error() {
        let table = table(false);
        let store = store_with(&table);
        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();
        let mut processor = GenericProcessor::new(Arc::clone(&table), false);
        let mut out = BatchOutput::default();
        let result = processor.apply(
            &tx,
            RowOp::Insert,
            &[Cell(7, Value::Integer(1))],
            &mut out,
        );
        assert!(matches!(result, Err(SyncError::Protocol(_))));
    }

    proptest! {
        #[test]
        fn test_full_refresh_keeps_exactly_resent_rows(
            before in prop::collection::btree_set(1i64..20, 0..10),
            resent in prop::collection::btree_set(1i64..20, 0..10),
        ) {
            let table = table(true);
            let store = store_with(&table);
            let inserts: Vec<_> = before
                .iter()
                .map(|id| (RowOp::Insert, row(*id, &format!("C{id}"), "old")))
                .collect();
            run(&store, GenericProcessor::new(Arc::clone(&table), false), &inserts);

            let refresh: Vec<_> = resent
                .iter()
                .map(|id| (RowOp::Refresh, row(*id, &format!("C{id}"), "new")))
                .collect();
            run(&store, GenericProcessor::new(Arc::clone(&table), true), &refresh);

            prop_assert_eq!(ids(&store), resent.into_iter().collect::<Vec<_>>());
        }
    }
}
