//! Persisted replica state: the header row, per-table sync tokens and the
//! queue of unsent tag edits.
//!
//! All accessors go through a [`Transaction`] so they take part in whatever
//! unit of work the caller has open.

use std::collections::BTreeMap;

use masterdata_core::{TagEdit, TagOp};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::transaction::Transaction;

/// Contents of the single header row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Remote last-modified stamp of the applied schema.
    pub schema_timestamp: Option<i64>,
    /// Raw schema document the local tables were built from.
    pub schema_content: Option<String>,
    /// Hex blake3 hash of `schema_content`.
    pub schema_hash: Option<String>,
    /// Last `syncStamp` acknowledged by the server.
    pub last_sync_stamp: Option<i64>,
    /// Free-form per-replica properties.
    pub user_properties: BTreeMap<String, String>,
}

/// A queued tag edit with its queue position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTagEdit {
    pub id: i64,
    pub edit: TagEdit,
}

/// Hex blake3 hash of a schema document.
pub fn schema_hash(content: &str) -> String {
    hex::encode(blake3::hash(content.as_bytes()).as_bytes())
}

impl Transaction<'_> {
    pub fn header(&self) -> Result<Header> {
        let (schema_timestamp, schema_content, schema_hash, last_sync_stamp, properties) = self
            .query_row(
                r#"SELECT "SchemaTimestamp", "SchemaContent", "SchemaHash", "LastSyncStamp", "UserProperties"
                   FROM "Header" WHERE "Id" = 1"#,
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?;
        Ok(Header {
            schema_timestamp,
            schema_content,
            schema_hash,
            last_sync_stamp,
            user_properties: serde_json::from_str(&properties)?,
        })
    }

    /// Record the schema the local tables now follow.
    pub fn save_schema(&self, timestamp: Option<i64>, content: &str) -> Result<()> {
        self.execute(
            r#"UPDATE "Header" SET "SchemaTimestamp" = ?1, "SchemaContent" = ?2, "SchemaHash" = ?3
               WHERE "Id" = 1"#,
            params![timestamp, content, schema_hash(content)],
        )?;
        Ok(())
    }

    pub fn set_last_sync_stamp(&self, stamp: Option<i64>) -> Result<()> {
        self.execute(
            r#"UPDATE "Header" SET "LastSyncStamp" = ?1 WHERE "Id" = 1"#,
            [stamp],
        )?;
        Ok(())
    }

    pub fn user_property(&self, name: &str) -> Result<Option<String>> {
        Ok(self.header()?.user_properties.remove(name))
    }

    /// Set or, with `None`, remove a user property.
    pub fn set_user_property(&self, name: &str, value: Option<&str>) -> Result<()> {
        let mut properties = self.header()?.user_properties;
        match value {
            Some(value) => {
                properties.insert(name.to_string(), value.to_string());
            }
            None => {
                properties.remove(name);
            }
        }
        self.execute(
            r#"UPDATE "Header" SET "UserProperties" = ?1 WHERE "Id" = 1"#,
            [serde_json::to_string(&properties)?],
        )?;
        Ok(())
    }

    /// Last applied change token of a table. `None` means the next sync
    /// must request a full refresh.
    pub fn sync_token(&self, table: &str) -> Result<Option<String>> {
        self.query_row_optional(
            r#"SELECT "Token" FROM "SyncState" WHERE "TableName" = ?1"#,
            [table],
            |row| row.get(0),
        )
    }

    /// Store or, with `None`, clear a table's change token.
    pub fn set_sync_token(&self, table: &str, token: Option<&str>) -> Result<()> {
        match token {
            Some(token) => self.execute(
                r#"INSERT INTO "SyncState" ("TableName", "Token") VALUES (?1, ?2)
                   ON CONFLICT ("TableName") DO UPDATE SET "Token" = excluded."Token""#,
                params![table, token],
            )?,
            None => self.execute(
                r#"DELETE FROM "SyncState" WHERE "TableName" = ?1"#,
                [table],
            )?,
        };
        Ok(())
    }

    pub fn sync_tokens(&self) -> Result<BTreeMap<String, String>> {
        let pairs = self.query_map(
            r#"SELECT "TableName", "Token" FROM "SyncState" ORDER BY "TableName""#,
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        Ok(pairs.into_iter().collect())
    }

    pub fn queue_tag_edit(&self, edit: &TagEdit) -> Result<i64> {
        let op = match edit.op {
            TagOp::Add => "add",
            TagOp::Remove => "remove",
        };
        self.execute(
            r#"INSERT INTO "PendingTagEdit" ("ObjectKey", "Tag", "Op") VALUES (?1, ?2, ?3)"#,
            params![edit.object_key, edit.tag, op],
        )?;
        self.last_insert_rowid()
    }

    /// Unsent tag edits, oldest first.
    pub fn pending_tag_edits(&self) -> Result<Vec<PendingTagEdit>> {
        let rows = self.query_map(
            r#"SELECT "Id", "ObjectKey", "Tag", "Op" FROM "PendingTagEdit" ORDER BY "Id""#,
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;
        rows.into_iter()
            .map(|(id, object_key, tag, op)| {
                let op = match op.as_str() {
                    "add" => TagOp::Add,
                    "remove" => TagOp::Remove,
                    other => {
                        return Err(StoreError::InvalidData(format!(
                            "unknown tag operation {other:?}"
                        )))
                    }
                };
                Ok(PendingTagEdit {
                    id,
                    edit: TagEdit {
                        object_key,
                        tag,
                        op,
                    },
                })
            })
            .collect()
    }

    /// Drop queued edits up to and including `up_to_id`, once the server has
    /// accepted them.
    pub fn clear_tag_edits(&self, up_to_id: i64) -> Result<usize> {
        self.execute(
            r#"DELETE FROM "PendingTagEdit" WHERE "Id" <= ?1"#,
            [up_to_id],
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::sqlite::LocalStore;
    use crate::transaction::Wait;
    use masterdata_core::{TagEdit, TagOp};

    #[test]
    fn test_header_roundtrip() {
        let store = LocalStore::open_memory().unwrap();
        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();

        let header = tx.header().unwrap();
        assert_eq!(header.schema_timestamp, None);
        assert!(header.user_properties.is_empty());

        tx.save_schema(Some(42), "{\"tables\":[]}").unwrap();
        tx.set_last_sync_stamp(Some(7)).unwrap();
        tx.set_user_property("device", Some("tablet-3")).unwrap();

        let header = tx.header().unwrap();
        assert_eq!(header.schema_timestamp, Some(42));
        assert_eq!(header.schema_hash.as_deref().map(str::len), Some(64));
        assert_eq!(header.last_sync_stamp, Some(7));
        assert_eq!(tx.user_property("device").unwrap().as_deref(), Some("tablet-3"));

        tx.set_user_property("device", None).unwrap();
        assert_eq!(tx.user_property("device").unwrap(), None);
        tx.commit().unwrap();
    }

    #[test]
    fn test_sync_tokens() {
        let store = LocalStore::open_memory().unwrap();
        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();

        assert_eq!(tx.sync_token("Bar").unwrap(), None);
        tx.set_sync_token("Bar", Some("t1")).unwrap();
        tx.set_sync_token("bar", Some("t2")).unwrap();
        assert_eq!(tx.sync_token("BAR").unwrap().as_deref(), Some("t2"));
        assert_eq!(tx.sync_tokens().unwrap().len(), 1);

        tx.set_sync_token("Bar", None).unwrap();
        assert_eq!(tx.sync_token("Bar").unwrap(), None);
        tx.commit().unwrap();
    }

    #[test]
    fn test_tag_edit_queue() {
        let store = LocalStore::open_memory().unwrap();
        let tx = store.begin_write(Wait::NoWait).unwrap().unwrap();

        let edit = |tag: &str, op| TagEdit {
            object_key: "7".into(),
            tag: tag.into(),
            op,
        };
        tx.queue_tag_edit(&edit("red", TagOp::Add)).unwrap();
        let second = tx.queue_tag_edit(&edit("blue", TagOp::Remove)).unwrap();
        tx.queue_tag_edit(&edit("green", TagOp::Add)).unwrap();

        let pending = tx.pending_tag_edits().unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[1].edit, edit("blue", TagOp::Remove));

        assert_eq!(tx.clear_tag_edits(second).unwrap(), 2);
        let pending = tx.pending_tag_edits().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].edit.tag, "green");
        tx.commit().unwrap();
    }
}
