//! Processor for the multi-valued tag table.
//!
//! The server sends one feed row per tagged object, with all of the
//! object's tags joined by a separator in the tag cell. Locally every
//! (object, tag) pair is its own row. The processor diffs the sent list
//! against the stored one and only touches the pairs that changed.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use masterdata_core::{ChangeEvent, RowKey, TableDefinition, Value};
use masterdata_store::sql::{from_sql, quote_ident, to_sql};
use masterdata_store::Transaction;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::feed::{Cell, RowOp};
use crate::processor::{spread_cells, BatchOutput, BatchProcessor};

/// Layout of the tag table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagTableConfig {
    pub table: String,
    pub object_column: String,
    pub tag_column: String,
    pub separator: char,
}

impl Default for TagTableConfig {
    fn default() -> Self {
        Self {
            table: "ObjectTags".into(),
            object_column: "ObjectId".into(),
            tag_column: "Tag".into(),
            separator: ';',
        }
    }
}

impl TagTableConfig {
    pub fn matches(&self, table: &TableDefinition) -> bool {
        table.is_named(&self.table)
    }
}

/// Applies tag batches.
pub struct TagProcessor {
    table: Arc<TableDefinition>,
    config: TagTableConfig,
    full_refresh: bool,
    /// Objects sent during a full refresh.
    seen: HashSet<RowKey>,
}

impl TagProcessor {
    pub fn new(table: Arc<TableDefinition>, config: TagTableConfig, full_refresh: bool) -> Self {
        Self {
            table,
            config,
            full_refresh,
            seen: HashSet::new(),
        }
    }

    fn slots(&self) -> Result<(usize, usize)> {
        let slot = |name: &str| {
            self.table.data_column_index(name).ok_or_else(|| {
                SyncError::Protocol(format!(
                    "tag table {} has no column {}",
                    self.table.name, name
                ))
            })
        };
        Ok((slot(&self.config.object_column)?, slot(&self.config.tag_column)?))
    }

    fn object_key(&self, value: &Value) -> Option<RowKey> {
        self.table
            .column(&self.config.object_column)
            .and_then(|column| column.key_of(value))
    }

    fn split(&self, value: Option<&Value>) -> BTreeSet<String> {
        let text = match value {
            Some(Value::Text(text)) => text.as_str(),
            _ => return BTreeSet::new(),
        };
        text.split(self.config.separator)
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn join(&self, tags: &BTreeSet<String>) -> String {
        let separator = self.config.separator.to_string();
        tags.iter().cloned().collect::<Vec<_>>().join(&separator)
    }

    fn stored_tags(&self, tx: &Transaction<'_>, object: &RowKey) -> Result<BTreeSet<String>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote_ident(&self.config.tag_column),
            quote_ident(&self.table.name),
            quote_ident(&self.config.object_column)
        );
        let tags: Vec<String> = tx.query_map(&sql, [to_sql(&object.to_value())], |row| row.get(0))?;
        Ok(tags.into_iter().collect())
    }

    fn set_tags(
        &self,
        tx: &Transaction<'_>,
        object: RowKey,
        tags: BTreeSet<String>,
        out: &mut BatchOutput,
    ) -> Result<()> {
        let stored = self.stored_tags(tx, &object)?;
        if stored == tags {
            return Ok(());
        }

        let table = quote_ident(&self.table.name);
        let object_column = quote_ident(&self.config.object_column);
        let tag_column = quote_ident(&self.config.tag_column);
        let object_value = to_sql(&object.to_value());

        for removed in stored.difference(&tags) {
            tx.execute(
                &format!("DELETE FROM {table} WHERE {object_column} = ?1 AND {tag_column} = ?2"),
                rusqlite::params![object_value, removed],
            )?;
        }
        for added in tags.difference(&stored) {
            tx.execute(
                &format!("INSERT INTO {table} ({object_column}, {tag_column}) VALUES (?1, ?2)"),
                rusqlite::params![object_value, added],
            )?;
        }

        let table_def = Arc::clone(&self.table);
        let event = if tags.is_empty() {
            ChangeEvent::row_delete(table_def, object)
        } else {
            let values = vec![object.to_value(), Value::Text(self.join(&tags))];
            if stored.is_empty() {
                ChangeEvent::row_insert(table_def, object, values)
            } else {
                ChangeEvent::row_update(table_def, object.clone(), object, values)
            }
        };
        out.events.push(event);
        out.changed = true;
        Ok(())
    }
}

impl BatchProcessor for TagProcessor {
    fn prepare(&mut self, _tx: &Transaction<'_>, _out: &mut BatchOutput) -> Result<()> {
        self.seen.clear();
        Ok(())
    }

    fn apply(
        &mut self,
        tx: &Transaction<'_>,
        op: RowOp,
        cells: &[Cell],
        out: &mut BatchOutput,
    ) -> Result<()> {
        let (object_slot, tag_slot) = self.slots()?;
        let row = spread_cells(&self.table, cells)?;
        let object = row[object_slot]
            .as_ref()
            .and_then(|value| self.object_key(value))
            .ok_or_else(|| {
                SyncError::Protocol(format!("tag row for {} without object", self.table.name))
            })?;

        let tags = match op {
            RowOp::Delete => BTreeSet::new(),
            _ => self.split(row[tag_slot].as_ref()),
        };
        if self.full_refresh {
            self.seen.insert(object.clone());
        }
        self.set_tags(tx, object, tags, out)?;
        out.rows += 1;
        Ok(())
    }

    fn clean(&mut self, tx: &Transaction<'_>, out: &mut BatchOutput) -> Result<()> {
        if !self.full_refresh {
            return Ok(());
        }
        let sql = format!(
            "SELECT DISTINCT {} FROM {}",
            quote_ident(&self.config.object_column),
            quote_ident(&self.table.name)
        );
        let objects: Vec<Value> = tx.query_map(&sql, [], |row| row.get_ref(0).map(from_sql))?;
        for value in objects {
            let Some(object) = self.object_key(&value) else {
                continue;
            };
            if !self.seen.contains(&object) {
                self.set_tags(tx, object, BTreeSet::new(), out)?;
            }
        }
        Ok(())
    }
}
