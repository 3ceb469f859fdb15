//! SQL text helpers and value conversion between the engine and rusqlite.

use masterdata_core::Value;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Row;

/// Quote an identifier for use in SQL text (`"name"`, inner quotes doubled).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal (`'text'`, inner quotes doubled).
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Comma-separated list of quoted identifiers.
pub fn ident_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert an engine value into an owned rusqlite value for binding.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

/// Convert a column read from SQLite into an engine value.
pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// Read the first `count` columns of a result row.
pub fn read_values(row: &Row<'_>, count: usize) -> rusqlite::Result<Vec<Value>> {
    (0..count)
        .map(|i| row.get_ref(i).map(from_sql))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("Bar"), "\"Bar\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(ident_list(["a", "b"]), "\"a\", \"b\"");
    }

    #[test]
    fn test_values_through_sqlite() {
        let conn = Connection::open_in_memory().unwrap();
        let input = vec![
            Value::Null,
            Value::Integer(-4),
            Value::Real(2.5),
            Value::Text("x".into()),
            Value::Blob(vec![1, 2]),
        ];
        let params: Vec<SqlValue> = input.iter().map(to_sql).collect();
        let output = conn
            .query_row(
                "SELECT ?1, ?2, ?3, ?4, ?5",
                rusqlite::params_from_iter(params),
                |row| read_values(row, 5),
            )
            .unwrap();
        assert_eq!(output, input);
    }
}
