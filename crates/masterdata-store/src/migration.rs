//! Migrations for the engine's own bookkeeping tables.
//!
//! These are versioned: each migration is SQL that moves the internal schema
//! from version N to N+1. Replicated tables are not handled here; their
//! layout follows the remote schema (see [`crate::schema_sync`]).

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current internal schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Name of the per-table sync token table.
pub const SYNC_STATE_TABLE: &str = "SyncState";

/// Name of the single-row header table.
pub const HEADER_TABLE: &str = "Header";

/// Name of the queue of unsent tag edits.
pub const PENDING_TAG_EDIT_TABLE: &str = "PendingTagEdit";

/// Initialize or migrate the internal tables.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::info!(version, "applied internal migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: header, sync state and pending tag edits.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Single row describing the replica as a whole
        CREATE TABLE "Header" (
            "Id" INTEGER PRIMARY KEY CHECK ("Id" = 1),
            "SchemaTimestamp" INTEGER,           -- remote last-modified of the applied schema
            "SchemaContent" TEXT,                -- raw schema document
            "SchemaHash" TEXT,                   -- blake3 of SchemaContent, hex
            "LastSyncStamp" INTEGER,             -- last syncStamp received from the server
            "UserProperties" TEXT NOT NULL DEFAULT '{}'   -- JSON object
        );
        INSERT INTO "Header" ("Id") VALUES (1);

        -- Last applied change token per replicated table; no row = full resync
        CREATE TABLE "SyncState" (
            "TableName" TEXT PRIMARY KEY COLLATE NOCASE,
            "Token" TEXT NOT NULL
        );

        -- Tag edits made locally and not yet pushed
        CREATE TABLE "PendingTagEdit" (
            "Id" INTEGER PRIMARY KEY AUTOINCREMENT,
            "ObjectKey" TEXT NOT NULL,
            "Tag" TEXT NOT NULL,
            "Op" TEXT NOT NULL CHECK ("Op" IN ('add', 'remove'))
        );
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&HEADER_TABLE.to_string()));
        assert!(tables.contains(&SYNC_STATE_TABLE.to_string()));
        assert!(tables.contains(&PENDING_TAG_EDIT_TABLE.to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);

        let headers: i64 = conn
            .query_row(r#"SELECT COUNT(*) FROM "Header""#, [], |row| row.get(0))
            .unwrap();
        assert_eq!(headers, 1);
    }
}
