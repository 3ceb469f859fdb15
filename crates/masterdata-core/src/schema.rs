//! Remote schema definitions.
//!
//! The server describes every replicated table with a [`TableDefinition`].
//! Definitions are immutable once loaded: a new remote schema version builds
//! a fresh [`Schema`] which replaces the old one wholesale.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{RowKey, Value};

/// Reserved row-identity pseudo-column. Never created as a physical column.
pub const ROW_IDENTITY_COLUMN: &str = "rowid";

/// Reserved refresh-tracking column added to tables with `track_refresh`.
pub const REFRESH_COLUMN: &str = "_refresh";

/// Semantic data type of a remote column.
///
/// Parsed leniently from the schema document; names without a mapping are
/// kept as [`DataType::Other`] and rejected when DDL is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataType {
    Integer,
    Long,
    Boolean,
    Double,
    Decimal,
    Text,
    Guid,
    Date,
    DateTime,
    Binary,
    Other(String),
}

impl DataType {
    /// Physical SQLite column type, or `None` when the type has no mapping.
    pub fn sql_type(&self) -> Option<&'static str> {
        match self {
            DataType::Integer | DataType::Long | DataType::Boolean => Some("INTEGER"),
            DataType::Double => Some("REAL"),
            DataType::Decimal => Some("NUMERIC"),
            DataType::Text | DataType::Guid | DataType::Date | DataType::DateTime => Some("TEXT"),
            DataType::Binary => Some("BLOB"),
            DataType::Other(_) => None,
        }
    }

    /// True for types stored with integer affinity.
    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Long | DataType::Boolean)
    }

    /// True for types whose defaults are rendered without quotes.
    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, DataType::Double | DataType::Decimal)
    }
}

impl From<String> for DataType {
    fn from(name: String) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "int" | "integer" | "int32" | "short" | "byte" => DataType::Integer,
            "long" | "int64" | "bigint" => DataType::Long,
            "bool" | "boolean" | "bit" => DataType::Boolean,
            "double" | "float" | "real" | "single" => DataType::Double,
            "decimal" | "numeric" | "money" => DataType::Decimal,
            "text" | "string" | "varchar" | "nvarchar" => DataType::Text,
            "guid" | "uuid" => DataType::Guid,
            "date" => DataType::Date,
            "datetime" | "timestamp" => DataType::DateTime,
            "binary" | "blob" | "bytes" => DataType::Binary,
            _ => DataType::Other(name),
        }
    }
}

impl From<DataType> for String {
    fn from(data_type: DataType) -> Self {
        data_type.to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Integer => "integer",
            DataType::Long => "long",
            DataType::Boolean => "boolean",
            DataType::Double => "double",
            DataType::Decimal => "decimal",
            DataType::Text => "text",
            DataType::Guid => "guid",
            DataType::Date => "date",
            DataType::DateTime => "datetime",
            DataType::Binary => "binary",
            DataType::Other(name) => name,
        };
        f.write_str(name)
    }
}

fn default_true() -> bool {
    true
}

/// One column of a remote table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Default value, rendered as a SQL literal of the column's type.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub unique: bool,
    /// Index this column on its own.
    #[serde(default)]
    pub indexed: bool,
    /// Columns sharing a group name are merged into one composite index.
    #[serde(default)]
    pub index_group: Option<String>,
    /// Parent table this column references. Relation columns are indexed.
    #[serde(default)]
    pub relation: Option<String>,
}

impl ColumnDefinition {
    /// A nullable, unindexed column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
            primary: false,
            unique: false,
            indexed: false,
            index_group: None,
            relation: None,
        }
    }

    /// Mark as the primary key (implies NOT NULL).
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn default_value(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn index_group(mut self, group: impl Into<String>) -> Self {
        self.index_group = Some(group.into());
        self
    }

    pub fn relation(mut self, parent: impl Into<String>) -> Self {
        self.relation = Some(parent.into());
        self
    }

    /// True for the reserved row-identity pseudo-column.
    pub fn is_row_identity(&self) -> bool {
        self.name.eq_ignore_ascii_case(ROW_IDENTITY_COLUMN)
    }

    /// True when the column gets an index of its own.
    pub fn wants_index(&self) -> bool {
        !self.primary
            && self.index_group.is_none()
            && (self.unique || self.indexed || self.relation.is_some())
    }

    /// Key of a value stored in this column, normalized to the column's
    /// affinity so that `"5"` and `5` address the same integer-keyed row.
    pub fn key_of(&self, value: &Value) -> Option<RowKey> {
        if self.data_type.is_integer() {
            if let Some(i) = value.as_i64() {
                return Some(RowKey::Integer(i));
            }
        }
        RowKey::from_value(value)
    }
}

/// Foreign-key style relation from a child column to a parent column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub child_column: String,
    pub parent_table: String,
    pub parent_column: String,
}

/// Remote description of one replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    /// Virtual primary key: alternate unique key used to address rows during
    /// sync and in the caches. Defaults to the physical primary key.
    #[serde(default)]
    pub use_as_key: Option<String>,
    /// Carry the reserved refresh-tracking column for full-refresh diffing.
    #[serde(default)]
    pub track_refresh: bool,
    /// Rebuild by rename-copy-drop instead of drop-and-recreate when
    /// columns must be removed or changed.
    #[serde(default)]
    pub preserve_data: bool,
    /// Drop and recreate even when only additive changes are needed.
    #[serde(default)]
    pub drop_on_change: bool,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            relations: Vec::new(),
            use_as_key: None,
            track_refresh: false,
            preserve_data: false,
            drop_on_change: false,
        }
    }

    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_relation(mut self, relation: RelationDefinition) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn use_as_key(mut self, column: impl Into<String>) -> Self {
        self.use_as_key = Some(column.into());
        self
    }

    pub fn track_refresh(mut self) -> Self {
        self.track_refresh = true;
        self
    }

    pub fn preserve_data(mut self) -> Self {
        self.preserve_data = true;
        self
    }

    pub fn drop_on_change(mut self) -> Self {
        self.drop_on_change = true;
        self
    }

    /// Look up a column by name (case-insensitive, like SQLite).
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Columns that exist physically, in definition order.
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| !c.is_row_identity())
    }

    /// Position of a column among [`data_columns`](Self::data_columns).
    pub fn data_column_index(&self, name: &str) -> Option<usize> {
        self.data_columns().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// The physical primary key column (first column marked primary).
    pub fn primary_key(&self) -> Option<&ColumnDefinition> {
        self.data_columns().find(|c| c.primary)
    }

    /// The column rows are addressed by: `use_as_key` if set, else the
    /// primary key.
    pub fn key_column(&self) -> Option<&ColumnDefinition> {
        match &self.use_as_key {
            Some(name) => self.column(name).filter(|c| !c.is_row_identity()),
            None => self.primary_key(),
        }
    }

    /// True when the table's name matches (case-insensitive).
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidSchema("table with empty name".into()));
        }
        if self.data_columns().next().is_none() {
            return Err(CoreError::InvalidSchema(format!(
                "table {} has no columns",
                self.name
            )));
        }
        if let Some(key) = &self.use_as_key {
            if self.column(key).is_none() {
                return Err(CoreError::InvalidSchema(format!(
                    "table {}: key column {} does not exist",
                    self.name, key
                )));
            }
        }
        for relation in &self.relations {
            if self.column(&relation.child_column).is_none() {
                return Err(CoreError::InvalidSchema(format!(
                    "table {}: relation column {} does not exist",
                    self.name, relation.child_column
                )));
            }
        }
        Ok(())
    }
}

/// The remote schema document as delivered by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub version: Option<String>,
    pub tables: Vec<TableDefinition>,
}

impl SchemaDocument {
    /// Parse the JSON schema document.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Serialize back to the document format.
    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate and index the tables.
    pub fn into_schema(self) -> Result<Schema, CoreError> {
        Schema::new(self.version, self.tables)
    }
}

/// A loaded, validated set of table definitions.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    version: Option<String>,
    order: Vec<Arc<TableDefinition>>,
    by_name: BTreeMap<String, Arc<TableDefinition>>,
}

impl Schema {
    pub fn new(
        version: Option<String>,
        tables: impl IntoIterator<Item = TableDefinition>,
    ) -> Result<Self, CoreError> {
        let mut schema = Schema {
            version,
            ..Default::default()
        };
        for table in tables {
            table.validate()?;
            let lookup = table.name.to_ascii_lowercase();
            if schema.by_name.contains_key(&lookup) {
                return Err(CoreError::DuplicateTable(table.name));
            }
            let table = Arc::new(table);
            schema.by_name.insert(lookup, Arc::clone(&table));
            schema.order.push(table);
        }
        Ok(schema)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Look up a table by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<Arc<TableDefinition>> {
        self.by_name.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Tables in document order.
    pub fn tables(&self) -> &[Arc<TableDefinition>] {
        &self.order
    }

    pub fn table_names(&self) -> Vec<String> {
        self.order.iter().map(|t| t.name.clone()).collect()
    }
}
