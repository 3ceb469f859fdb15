//! Schema synchronizer.
//!
//! Diffs remote [`TableDefinition`]s against the physical SQLite schema and
//! produces the ordered DDL that reconciles them. The physical schema is
//! introspected through the `pragma_table_info`, `pragma_index_list` and
//! `pragma_index_info` table functions on every call; nothing is cached.
//!
//! For an existing table, each remote column is compared to the local
//! columns on name, physical type, nullability and primary flag. A table
//! that differs at all is reconciled by one of three strategies:
//!
//! - **drop and recreate**: something must be removed or changed and the
//!   table does not ask to preserve data, or only additive changes are needed
//!   but the table asks to be dropped on change. Also used when a new
//!   `NOT NULL` column without default would leave copied rows invalid.
//! - **rename-copy-drop**: something must be removed or changed and the table
//!   asks to preserve data. Columns present on both sides are copied by name.
//! - **additive**: `ALTER TABLE .. ADD COLUMN` per new column, then index
//!   drops and creates.
//!
//! Every table is planned before a single statement runs, so a schema
//! mismatch in one table leaves the store untouched.

use std::collections::HashSet;
use std::sync::Arc;

use masterdata_core::{DataType, TableDefinition, REFRESH_COLUMN};
use rusqlite::Connection;

use crate::error::{Result, SchemaError, StoreError};
use crate::migration::SYNC_STATE_TABLE;
use crate::sql::{ident_list, quote_ident, quote_literal};
use crate::transaction::Transaction;

/// Ordered DDL for a set of tables, plus the tables it touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaPlan {
    pub statements: Vec<String>,
    pub changed_tables: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PhysicalColumn {
    name: String,
    sql_type: String,
    nullable: bool,
    primary: bool,
    default: Option<String>,
}

impl PhysicalColumn {
    fn same_as(&self, other: &PhysicalColumn) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.sql_type.eq_ignore_ascii_case(&other.sql_type)
            && self.nullable == other.nullable
            && self.primary == other.primary
    }

    fn can_be_added(&self) -> bool {
        !self.primary && (self.nullable || self.default.is_some())
    }

    fn definition(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.sql_type);
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PhysicalIndex {
    name: String,
    unique: bool,
    columns: Vec<String>,
}

impl PhysicalIndex {
    /// Same definition, and a name equal up to a numeric generation suffix.
    fn matches(&self, local: &PhysicalIndex) -> bool {
        self.unique == local.unique
            && self.columns.len() == local.columns.len()
            && self
                .columns
                .iter()
                .zip(&local.columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
            && strip_generation(&self.name).eq_ignore_ascii_case(strip_generation(&local.name))
    }

    fn create_sql(&self, table: &str, name: &str) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(name),
            quote_ident(table),
            ident_list(self.columns.iter().map(String::as_str))
        )
    }
}

fn strip_generation(name: &str) -> &str {
    name.trim_end_matches(|c: char| c.is_ascii_digit())
}

fn index_name(table: &str, suffix: &str) -> String {
    format!("idx_{table}_{suffix}")
}

/// Render a default as a SQL literal of the column's type.
fn render_default(data_type: &DataType, value: &str) -> String {
    let trimmed = value.trim();
    if *data_type == DataType::Boolean {
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => return "1".into(),
            "false" => return "0".into(),
            _ => {}
        }
    }
    let numeric = trimmed.parse::<i64>().is_ok()
        || trimmed.parse::<f64>().map_or(false, f64::is_finite);
    if data_type.is_numeric() && numeric {
        trimmed.to_string()
    } else {
        quote_literal(value)
    }
}

fn desired_columns(table: &TableDefinition) -> Result<Vec<PhysicalColumn>> {
    let mut columns = Vec::new();
    for column in table.data_columns() {
        let sql_type = column
            .data_type
            .sql_type()
            .ok_or_else(|| SchemaError::UnmappedType {
                table: table.name.clone(),
                column: column.name.clone(),
                data_type: column.data_type.to_string(),
            })?;
        columns.push(PhysicalColumn {
            name: column.name.clone(),
            sql_type: sql_type.to_string(),
            nullable: column.nullable && !column.primary,
            primary: column.primary,
            default: column
                .default
                .as_deref()
                .map(|value| render_default(&column.data_type, value)),
        });
    }
    if table.track_refresh {
        if table.column(REFRESH_COLUMN).is_some() {
            return Err(SchemaError::Unsupported {
                table: table.name.clone(),
                reason: format!("column {REFRESH_COLUMN} is reserved"),
            }
            .into());
        }
        columns.push(PhysicalColumn {
            name: REFRESH_COLUMN.to_string(),
            sql_type: "INTEGER".to_string(),
            nullable: true,
            primary: false,
            default: None,
        });
    }
    Ok(columns)
}

fn desired_indexes(table: &TableDefinition) -> Vec<PhysicalIndex> {
    let mut indexes: Vec<PhysicalIndex> = Vec::new();
    for column in table.data_columns() {
        if let Some(group) = &column.index_group {
            let name = index_name(&table.name, group);
            match indexes.iter_mut().find(|i| i.name.eq_ignore_ascii_case(&name)) {
                Some(index) => {
                    index.columns.push(column.name.clone());
                    index.unique |= column.unique;
                }
                None => indexes.push(PhysicalIndex {
                    name,
                    unique: column.unique,
                    columns: vec![column.name.clone()],
                }),
            }
            continue;
        }

        let relation_child = table
            .relations
            .iter()
            .any(|r| r.child_column.eq_ignore_ascii_case(&column.name));
        if column.wants_index() || (relation_child && !column.primary) {
            indexes.push(PhysicalIndex {
                name: index_name(&table.name, &column.name),
                unique: column.unique,
                columns: vec![column.name.clone()],
            });
        }
    }
    indexes
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE)",
        [name],
        |row| row.get(0),
    )?)
}

fn local_columns(conn: &Connection, table: &str) -> Result<Vec<PhysicalColumn>> {
    let mut stmt = conn.prepare(
        r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
    )?;
    let columns = stmt
        .query_map([table], |row| {
            Ok(PhysicalColumn {
                name: row.get(0)?,
                sql_type: row.get::<_, String>(1)?.to_ascii_uppercase(),
                nullable: row.get::<_, i64>(2)? == 0,
                default: row.get(3)?,
                primary: row.get::<_, i64>(4)? > 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Explicitly created indexes of a table; automatic ones are ignored.
fn local_indexes(conn: &Connection, table: &str) -> Result<Vec<PhysicalIndex>> {
    let mut list =
        conn.prepare(r#"SELECT name, "unique" FROM pragma_index_list(?1) WHERE origin = 'c'"#)?;
    let entries = list
        .query_map([table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    entries
        .into_iter()
        .map(|(name, unique)| {
            let columns = info
                .query_map([&name], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(PhysicalIndex {
                name,
                unique,
                columns,
            })
        })
        .collect()
}

fn all_index_names(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'index'")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .map(|name| name.map(|n| n.to_ascii_lowercase()))
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(names)
}

/// Pick a free index name: `base`, else `base1`, `base2`, ...
fn claim_index_name(taken: &mut HashSet<String>, base: &str) -> String {
    let mut name = base.to_string();
    let mut generation = 1;
    while taken.contains(&name.to_ascii_lowercase()) {
        name = format!("{base}{generation}");
        generation += 1;
    }
    taken.insert(name.to_ascii_lowercase());
    name
}

fn create_table_sql(table: &TableDefinition, columns: &[PhysicalColumn]) -> String {
    let mut parts: Vec<String> = columns.iter().map(PhysicalColumn::definition).collect();
    let keys: Vec<&str> = columns
        .iter()
        .filter(|c| c.primary)
        .map(|c| c.name.as_str())
        .collect();
    if !keys.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", ident_list(keys)));
    }
    format!(
        "CREATE TABLE {} ({})",
        quote_ident(&table.name),
        parts.join(", ")
    )
}

fn create_indexes(
    table: &TableDefinition,
    indexes: &[&PhysicalIndex],
    taken: &mut HashSet<String>,
) -> Vec<String> {
    indexes
        .iter()
        .map(|index| {
            let name = claim_index_name(taken, &index.name);
            index.create_sql(&table.name, &name)
        })
        .collect()
}

#[derive(Default)]
struct TablePlan {
    statements: Vec<String>,
    columns_changed: bool,
}

fn plan_table(
    conn: &Connection,
    table: &TableDefinition,
    taken: &mut HashSet<String>,
) -> Result<TablePlan> {
    let desired = desired_columns(table)?;
    let indexes = desired_indexes(table);
    let all_indexes: Vec<&PhysicalIndex> = indexes.iter().collect();

    if !table_exists(conn, &table.name)? {
        let mut statements = vec![create_table_sql(table, &desired)];
        statements.extend(create_indexes(table, &all_indexes, taken));
        return Ok(TablePlan {
            statements,
            columns_changed: true,
        });
    }

    let local = local_columns(conn, &table.name)?;
    let new_columns: Vec<&PhysicalColumn> = desired
        .iter()
        .filter(|d| !local.iter().any(|l| l.same_as(d)))
        .collect();
    let stale_columns = local.iter().any(|l| !desired.iter().any(|d| d.same_as(l)));

    let existing = local_indexes(conn, &table.name)?;
    let stale_indexes: Vec<&PhysicalIndex> = existing
        .iter()
        .filter(|l| !indexes.iter().any(|d| d.matches(l)))
        .collect();
    let missing_indexes: Vec<&PhysicalIndex> = indexes
        .iter()
        .filter(|d| !existing.iter().any(|l| d.matches(l)))
        .collect();

    if new_columns.is_empty()
        && !stale_columns
        && stale_indexes.is_empty()
        && missing_indexes.is_empty()
    {
        return Ok(TablePlan::default());
    }

    let shared = |name: &str| local.iter().any(|l| l.name.eq_ignore_ascii_case(name));
    let rebuild = stale_columns || new_columns.iter().any(|c| !c.can_be_added());
    // A copied row would have nothing to put in such a column.
    let unfillable = new_columns
        .iter()
        .any(|c| !c.nullable && c.default.is_none() && !shared(c.name.as_str()));

    let quoted = quote_ident(&table.name);
    if (rebuild && (!table.preserve_data || unfillable)) || (!rebuild && table.drop_on_change) {
        // Indexes vanish with the table.
        for index in &existing {
            taken.remove(&index.name.to_ascii_lowercase());
        }
        let mut statements = vec![
            format!("DROP TABLE {quoted}"),
            create_table_sql(table, &desired),
        ];
        statements.extend(create_indexes(table, &all_indexes, taken));
        tracing::info!(table = %table.name, "schema change: drop and recreate");
        return Ok(TablePlan {
            statements,
            columns_changed: true,
        });
    }

    if rebuild {
        for index in &existing {
            taken.remove(&index.name.to_ascii_lowercase());
        }
        let temp = quote_ident(&format!("{}_temp", table.name));
        let copied = ident_list(
            desired
                .iter()
                .map(|c| c.name.as_str())
                .filter(|name| shared(*name)),
        );
        let mut statements = vec![
            format!("DROP TABLE IF EXISTS {temp}"),
            format!("ALTER TABLE {quoted} RENAME TO {temp}"),
            create_table_sql(table, &desired),
        ];
        if !copied.is_empty() {
            statements.push(format!(
                "INSERT INTO {quoted} ({copied}) SELECT {copied} FROM {temp}"
            ));
        }
        statements.push(format!("DROP TABLE {temp}"));
        statements.extend(create_indexes(table, &all_indexes, taken));
        tracing::info!(table = %table.name, "schema change: rebuild preserving data");
        return Ok(TablePlan {
            statements,
            columns_changed: true,
        });
    }

    let mut statements: Vec<String> = new_columns
        .iter()
        .map(|c| format!("ALTER TABLE {quoted} ADD COLUMN {}", c.definition()))
        .collect();
    for index in &stale_indexes {
        taken.remove(&index.name.to_ascii_lowercase());
        statements.push(format!("DROP INDEX {}", quote_ident(&index.name)));
    }
    statements.extend(create_indexes(table, &missing_indexes, taken));
    tracing::info!(
        table = %table.name,
        columns = new_columns.len(),
        indexes = stale_indexes.len() + missing_indexes.len(),
        "schema change: additive"
    );
    Ok(TablePlan {
        statements,
        columns_changed: !new_columns.is_empty(),
    })
}

/// Plan the DDL reconciling the local schema with `tables`. Nothing runs.
pub fn plan(conn: &Connection, tables: &[Arc<TableDefinition>]) -> Result<SchemaPlan> {
    let sync_state_exists = table_exists(conn, SYNC_STATE_TABLE)?;
    let mut taken = all_index_names(conn)?;
    let mut plan = SchemaPlan::default();

    for table in tables {
        let TablePlan {
            statements,
            columns_changed,
        } = plan_table(conn, table, &mut taken)?;
        if statements.is_empty() {
            continue;
        }
        plan.statements.extend(statements);
        if columns_changed && sync_state_exists {
            // Force a full refresh on the next synchronization.
            plan.statements.push(format!(
                "DELETE FROM {} WHERE {} = {}",
                quote_ident(SYNC_STATE_TABLE),
                quote_ident("TableName"),
                quote_literal(&table.name)
            ));
        }
        plan.changed_tables.push(table.name.clone());
    }
    Ok(plan)
}

/// Ordered DDL statements reconciling the local schema with `tables`.
pub fn reconcile(conn: &Connection, tables: &[Arc<TableDefinition>]) -> Result<Vec<String>> {
    Ok(plan(conn, tables)?.statements)
}

/// Execute planned statements in order.
pub fn apply(conn: &Connection, statements: &[String]) -> Result<()> {
    for statement in statements {
        tracing::debug!(%statement, "applying schema statement");
        conn.execute_batch(statement)?;
    }
    Ok(())
}

impl Transaction<'_> {
    /// Plan and apply the schema inside this write transaction.
    pub fn reconcile_schema(&self, tables: &[Arc<TableDefinition>]) -> Result<SchemaPlan> {
        if !self.is_write() {
            return Err(StoreError::ReadOnly);
        }
        self.with_conn(|conn| {
            let plan = plan(conn, tables)?;
            apply(conn, &plan.statements)?;
            Ok(plan)
        })
    }
}
