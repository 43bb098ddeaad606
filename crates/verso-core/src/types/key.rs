//! Physical and logical key values.

use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value as SqlValue, ValueRef,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A row key or model id: an integer for auto-increment tables, text for
/// UUID-keyed tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Generate a fresh random UUID key.
    pub fn new_uuid() -> Self {
        RecordKey::Text(Uuid::new_v4().to_string())
    }

    /// Get the key as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RecordKey::Int(i) => Some(*i),
            RecordKey::Text(_) => None,
        }
    }

    /// Get the key as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RecordKey::Int(_) => None,
            RecordKey::Text(s) => Some(s),
        }
    }

    /// Owned SQL value for dynamically built parameter lists.
    pub fn to_sql_value(&self) -> SqlValue {
        match self {
            RecordKey::Int(i) => SqlValue::Integer(*i),
            RecordKey::Text(s) => SqlValue::Text(s.clone()),
        }
    }

    /// JSON representation of the key.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RecordKey::Int(i) => serde_json::Value::from(*i),
            RecordKey::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(i) => write!(f, "{}", i),
            RecordKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        RecordKey::Int(value)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey::Text(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey::Text(value)
    }
}

impl From<Uuid> for RecordKey {
    fn from(value: Uuid) -> Self {
        RecordKey::Text(value.to_string())
    }
}

impl ToSql for RecordKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            RecordKey::Int(i) => ToSqlOutput::from(*i),
            RecordKey::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl FromSql for RecordKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(RecordKey::Int(i)),
            ValueRef::Text(_) => value.as_str().map(|s| RecordKey::Text(s.to_string())),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_display_and_accessors() {
        let int = RecordKey::from(42);
        assert_eq!(int.to_string(), "42");
        assert_eq!(int.as_int(), Some(42));
        assert_eq!(int.as_text(), None);

        let text = RecordKey::from("abc");
        assert_eq!(text.to_string(), "abc");
        assert_eq!(text.as_text(), Some("abc"));
        assert_eq!(text.to_json(), serde_json::json!("abc"));
    }

    #[test]
    fn test_uuid_keys_are_unique() {
        assert_ne!(RecordKey::new_uuid(), RecordKey::new_uuid());
    }

    #[test]
    fn test_sql_binding() {
        let conn = Connection::open_in_memory().unwrap();
        let int: RecordKey = conn
            .query_row("SELECT ?1", [RecordKey::Int(7)], |row| row.get(0))
            .unwrap();
        assert_eq!(int, RecordKey::Int(7));

        let text: RecordKey = conn
            .query_row("SELECT ?1", [RecordKey::from("k-1")], |row| row.get(0))
            .unwrap();
        assert_eq!(text, RecordKey::from("k-1"));

        let null: rusqlite::Result<RecordKey> =
            conn.query_row("SELECT NULL", [], |row| row.get(0));
        assert!(null.is_err());
    }
}
