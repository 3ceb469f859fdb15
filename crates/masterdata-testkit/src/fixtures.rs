//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::path::PathBuf;
use std::sync::Arc;

use masterdata::{MasterData, MasterDataConfig, SyncConfig};
use masterdata_core::{Schema, SchemaDocument, Value};
use masterdata_sync::memory::MemoryRemote;
use masterdata_sync::{feed_to_string, FeedElement, RowOp, TagTableConfig};
use tempfile::TempDir;

/// Three tables: customers with refresh tracking, products addressed by
/// their code, and the tag table.
pub const SAMPLE_SCHEMA: &str = r#"{
    "version": "1",
    "tables": [
        {
            "name": "Customer",
            "track_refresh": true,
            "columns": [
                { "name": "Id", "type": "integer", "primary": true },
                { "name": "Name", "type": "text" },
                { "name": "Active", "type": "boolean", "default": "true" }
            ]
        },
        {
            "name": "Product",
            "use_as_key": "Code",
            "columns": [
                { "name": "Id", "type": "integer", "primary": true },
                { "name": "Code", "type": "text", "unique": true },
                { "name": "Price", "type": "decimal", "default": "0" },
                { "name": "CustomerId", "type": "integer", "relation": "Customer" }
            ]
        },
        {
            "name": "ObjectTags",
            "columns": [
                { "name": "ObjectId", "type": "integer", "nullable": false },
                { "name": "Tag", "type": "text", "nullable": false, "index_group": "object_tag" }
            ]
        }
    ]
}"#;

/// [`SAMPLE_SCHEMA`], parsed.
pub fn sample_schema() -> Schema {
    SchemaDocument::parse(SAMPLE_SCHEMA)
        .and_then(SchemaDocument::into_schema)
        .expect("sample schema is valid")
}

/// Builder for change feeds.
#[derive(Debug, Clone, Default)]
pub struct FeedBuilder {
    elements: Vec<FeedElement>,
}

impl FeedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch(mut self, table: &str, full: bool) -> Self {
        self.elements.push(FeedElement::Batch {
            table: table.to_string(),
            full,
        });
        self
    }

    /// A row with its values in column order.
    pub fn row(mut self, op: RowOp, values: impl IntoIterator<Item = Value>) -> Self {
        self.elements.push(FeedElement::row(op, values));
        self
    }

    pub fn sync_id(mut self, token: &str) -> Self {
        self.elements.push(FeedElement::SyncId {
            token: Some(token.to_string()),
        });
        self
    }

    pub fn end(mut self) -> Self {
        self.elements.push(FeedElement::End);
        self
    }

    pub fn stamp(mut self, stamp: i64) -> Self {
        self.elements.push(FeedElement::SyncStamp { stamp });
        self
    }

    pub fn error(mut self, message: &str) -> Self {
        self.elements.push(FeedElement::Error {
            message: message.to_string(),
        });
        self
    }

    pub fn elements(&self) -> &[FeedElement] {
        &self.elements
    }

    pub fn build(self) -> Vec<FeedElement> {
        self.elements
    }

    /// The feed as sent on the wire.
    pub fn to_ndjson(&self) -> String {
        feed_to_string(&self.elements).expect("feed elements serialize")
    }
}

/// A replica on a temporary database, fed by an in-memory remote that
/// serves [`SAMPLE_SCHEMA`].
pub struct TestFixture {
    dir: TempDir,
    remote: Arc<MemoryRemote>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_schema(SAMPLE_SCHEMA, 1)
    }

    pub fn with_schema(content: &str, modified: i64) -> Self {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_schema(content, Some(modified));
        Self {
            dir: TempDir::new().expect("create temp dir"),
            remote,
        }
    }

    pub fn remote(&self) -> &Arc<MemoryRemote> {
        &self.remote
    }

    pub fn database_path(&self) -> PathBuf {
        self.dir.path().join("replica.db")
    }

    /// Configuration of the replica, with the tag table enabled.
    pub fn config(&self) -> MasterDataConfig {
        MasterDataConfig::default()
            .with_database_path(self.database_path())
            .with_sync(SyncConfig::default().with_tag_table(TagTableConfig::default()))
    }

    /// Open (or reopen) the replica.
    pub fn open(&self) -> masterdata::Result<MasterData> {
        MasterData::open(self.config(), Arc::clone(&self.remote) as _)
    }

    /// Queue a feed as the answer to the next synchronization.
    pub fn push(&self, feed: FeedBuilder) {
        self.remote
            .push_elements(feed.elements())
            .expect("feed elements serialize");
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masterdata_core::RowKey;

    #[test]
    fn test_sample_schema_tables() {
        let schema = sample_schema();
        assert_eq!(schema.table_names(), vec!["Customer", "Product", "ObjectTags"]);
        let product = schema.get("product").unwrap();
        assert_eq!(product.key_column().unwrap().name, "Code");
    }

    #[test]
    fn test_feed_builder_wire_format() {
        let feed = FeedBuilder::new()
            .batch("Customer", true)
            .row(RowOp::Refresh, [Value::Integer(1), Value::from("Ada")])
            .sync_id("c1")
            .end()
            .stamp(5);

        let text = feed.to_ndjson();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains(r#""el":"batch""#));
        assert!(lines[4].contains(r#""stamp":5"#));
    }

    #[test]
    fn test_fixture_reopens_same_database() {
        let fixture = TestFixture::new();
        {
            let md = fixture.open().unwrap();
            fixture.push(
                FeedBuilder::new()
                    .batch("Product", false)
                    .row(
                        RowOp::Insert,
                        [Value::Integer(10), Value::from("P-10"), Value::Integer(3), Value::Null],
                    )
                    .end(),
            );
            md.run_synchronization(false).unwrap();
        }

        let md = fixture.open().unwrap();
        let row = md
            .get_row("Product", &RowKey::from("P-10"))
            .unwrap()
            .unwrap();
        assert_eq!(row.get("Price"), Some(Value::Integer(3)));
    }
}
