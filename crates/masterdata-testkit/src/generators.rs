//! Proptest generators for property-based testing.

use std::collections::BTreeSet;

use proptest::prelude::*;

use masterdata_core::{
    ColumnDefinition, DataType, RowKey, TableDefinition, TagEdit, TagOp, Value, ROW_IDENTITY_COLUMN,
};

/// Generate a column value of any storage class.
pub fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9f64..1.0e9).prop_map(Value::Real),
        "[a-zA-Z0-9 ]{0,24}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Blob),
    ]
}

/// Generate a row key.
pub fn row_key() -> impl Strategy<Value = RowKey> {
    prop_oneof![
        any::<i64>().prop_map(RowKey::Integer),
        "[A-Z]{1,3}-[0-9]{1,4}".prop_map(RowKey::Text),
    ]
}

/// Generate a data type that maps to a SQLite column type.
pub fn data_type() -> impl Strategy<Value = DataType> {
    prop_oneof![
        Just(DataType::Integer),
        Just(DataType::Long),
        Just(DataType::Boolean),
        Just(DataType::Double),
        Just(DataType::Decimal),
        Just(DataType::Text),
        Just(DataType::Guid),
        Just(DataType::Date),
        Just(DataType::DateTime),
        Just(DataType::Binary),
    ]
}

/// Generate a column name.
pub fn column_name() -> impl Strategy<Value = String> {
    "[A-Z][a-z]{2,10}".prop_map(String::from)
}

/// Generate a table with an integer primary key `Id` followed by up to
/// `max_columns` nullable data columns. Names are prefixed so they never
/// meet the replica's own bookkeeping tables.
pub fn table_definition(max_columns: usize) -> impl Strategy<Value = TableDefinition> {
    (
        "Tbl[A-Z][a-z]{2,10}",
        prop::collection::vec((column_name(), data_type(), any::<bool>()), 0..=max_columns),
        any::<bool>(),
    )
        .prop_map(|(name, columns, track_refresh)| {
            let mut table = TableDefinition::new(name)
                .with_column(ColumnDefinition::new("Id", DataType::Integer).primary());
            let mut used = BTreeSet::from(["id".to_string(), ROW_IDENTITY_COLUMN.to_string()]);
            for (column, data_type, indexed) in columns {
                if !used.insert(column.to_ascii_lowercase()) {
                    continue;
                }
                let mut column = ColumnDefinition::new(column, data_type);
                column.indexed = indexed;
                table = table.with_column(column);
            }
            if track_refresh {
                table = table.track_refresh();
            }
            table
        })
}

/// Generate values for a table's data columns, with `key` in the `Id` slot.
pub fn row_values(table: &TableDefinition, key: i64) -> impl Strategy<Value = Vec<Value>> {
    let width = table.data_columns().count();
    prop::collection::vec(scalar(), width.saturating_sub(1)).prop_map(move |rest| {
        let mut values = Vec::with_capacity(width);
        values.push(Value::Integer(key));
        values.extend(rest);
        values
    })
}

/// Values that come back from SQLite unchanged whatever the column affinity.
fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![Just(Value::Null), "[a-z]{1,8}".prop_map(Value::Text)]
}

/// Generate a locally authored tag edit.
pub fn tag_edit() -> impl Strategy<Value = TagEdit> {
    (
        0i64..1000,
        "[a-z]{1,10}",
        prop_oneof![Just(TagOp::Add), Just(TagOp::Remove)],
    )
        .prop_map(|(object, tag, op)| TagEdit {
            object_key: object.to_string(),
            tag,
            op,
        })
}
