//! Versioned table schemas.
//!
//! A [`Schema`] tells the store everything it needs about one versioned table:
//! how physical keys and model ids are assigned, which payload columns exist,
//! and which of them may change without creating a new version.

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use strum::{Display, EnumString};

use crate::error::{ErrorCode, VersoError, VersoResult};
use crate::types::Payload;

/// Physical primary key column.
pub const COLUMN_ROW_ID: &str = "row_id";
/// Logical entity id column.
pub const COLUMN_MODEL_ID: &str = "model_id";
/// Version number column.
pub const COLUMN_VERSION: &str = "version";
/// Current-version flag column.
pub const COLUMN_IS_CURRENT: &str = "is_current";
/// Back link column.
pub const COLUMN_PREVIOUS_ROW_ID: &str = "previous_row_id";
/// Forward link column.
pub const COLUMN_NEXT_ROW_ID: &str = "next_row_id";
/// Creation timestamp column.
pub const COLUMN_CREATED_AT: &str = "created_at";
/// Last-update timestamp column.
pub const COLUMN_UPDATED_AT: &str = "updated_at";

/// Columns owned by the store, in select order.
pub const BOOKKEEPING_COLUMNS: [&str; 8] = [
    COLUMN_ROW_ID,
    COLUMN_MODEL_ID,
    COLUMN_VERSION,
    COLUMN_IS_CURRENT,
    COLUMN_PREVIOUS_ROW_ID,
    COLUMN_NEXT_ROW_ID,
    COLUMN_CREATED_AT,
    COLUMN_UPDATED_AT,
];

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern"));

/// How the physical primary key is generated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KeyStrategy {
    /// SQLite `INTEGER PRIMARY KEY AUTOINCREMENT`.
    #[default]
    AutoIncrement,
    /// Random UUID v4 text keys generated by the store.
    Uuid,
}

/// How a new entity's `model_id` is assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelIdStrategy {
    /// `model_id` equals the physical key of the first row.
    #[default]
    MirrorRowId,
    /// `model_id` is a fresh UUID, independent of the physical key.
    Generated,
}

/// SQL type of a payload column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Boolean,
    /// Arbitrary JSON, stored as text.
    Json,
}

impl FieldType {
    /// Column type used in `CREATE TABLE`.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Text | FieldType::Json => "TEXT",
            FieldType::Integer | FieldType::Boolean => "INTEGER",
            FieldType::Real => "REAL",
        }
    }

    /// Convert a payload value into a bindable SQL value.
    pub fn to_sql(&self, field: &str, value: &Value) -> VersoResult<SqlValue> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }

        let converted = match (self, value) {
            (FieldType::Text, Value::String(s)) => Some(SqlValue::Text(s.clone())),
            (FieldType::Integer, Value::Number(n)) => n.as_i64().map(SqlValue::Integer),
            (FieldType::Real, Value::Number(n)) => n.as_f64().map(SqlValue::Real),
            (FieldType::Boolean, Value::Bool(b)) => Some(SqlValue::Integer(i64::from(*b))),
            (FieldType::Json, other) => Some(SqlValue::Text(serde_json::to_string(other)?)),
            _ => None,
        };

        converted.ok_or_else(|| {
            VersoError::validation_with_code(
                format!("Field '{}' expects {} but got {}", field, self, value),
                ErrorCode::ValTypeMismatch,
            )
        })
    }

    /// The value as it reads back after a round trip through the column.
    pub fn normalize(&self, field: &str, value: &Value) -> VersoResult<Value> {
        let stored = self.to_sql(field, value)?;
        self.from_sql(ValueRef::from(&stored))
    }

    /// Decode a stored column into a payload value.
    pub fn from_sql(&self, value: ValueRef<'_>) -> VersoResult<Value> {
        let decoded = match (self, value) {
            (_, ValueRef::Null) => Value::Null,
            (FieldType::Text, ValueRef::Text(bytes)) => {
                Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            (FieldType::Integer, ValueRef::Integer(i)) => Value::from(i),
            (FieldType::Real, ValueRef::Real(f)) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            (FieldType::Real, ValueRef::Integer(i)) => Value::from(i as f64),
            (FieldType::Boolean, ValueRef::Integer(i)) => Value::Bool(i != 0),
            (FieldType::Json, ValueRef::Text(bytes)) => serde_json::from_slice(bytes)?,
            (field_type, other) => {
                return Err(VersoError::parse(format!(
                    "Stored value of type {:?} does not decode as {}",
                    other.data_type(),
                    field_type
                )))
            }
        };
        Ok(decoded)
    }
}

/// A payload column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub field_type: FieldType,
    /// Whether the field must be present and non-null.
    #[serde(default)]
    pub required: bool,
}

/// Description of one versioned table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    table: String,
    #[serde(default)]
    key_strategy: KeyStrategy,
    #[serde(default)]
    model_id_strategy: ModelIdStrategy,
    fields: Vec<FieldDef>,
    #[serde(default)]
    minor_fields: BTreeSet<String>,
}

impl Schema {
    /// Start a schema for the given table with default strategies.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_strategy: KeyStrategy::default(),
            model_id_strategy: ModelIdStrategy::default(),
            fields: Vec::new(),
            minor_fields: BTreeSet::new(),
        }
    }

    /// Builder: add an optional payload field.
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            required: false,
        });
        self
    }

    /// Builder: add a payload field that must be present and non-null.
    pub fn required_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
            required: true,
        });
        self
    }

    /// Builder: set the fields that may change without a new version.
    pub fn with_minor_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.minor_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the physical key strategy.
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    /// Builder: set the model id strategy.
    pub fn with_model_id_strategy(mut self, strategy: ModelIdStrategy) -> Self {
        self.model_id_strategy = strategy;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key_strategy(&self) -> KeyStrategy {
        self.key_strategy
    }

    pub fn model_id_strategy(&self) -> ModelIdStrategy {
        self.model_id_strategy
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Look up a payload field definition.
    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The configured minor-field allowlist.
    pub fn minor_fields(&self) -> &BTreeSet<String> {
        &self.minor_fields
    }

    /// True when an allowlist is configured and every changed field is on it.
    pub fn is_minor_change(&self, changed: &BTreeSet<String>) -> bool {
        !self.minor_fields.is_empty()
            && !changed.is_empty()
            && changed.iter().all(|f| self.minor_fields.contains(f))
    }

    /// Whether the name belongs to a store-owned column.
    pub fn is_bookkeeping(name: &str) -> bool {
        BOOKKEEPING_COLUMNS.contains(&name)
    }

    /// SQL type of the physical key and link columns.
    pub fn key_sql_type(&self) -> &'static str {
        match self.key_strategy {
            KeyStrategy::AutoIncrement => "INTEGER",
            KeyStrategy::Uuid => "TEXT",
        }
    }

    /// SQL type of the `model_id` column.
    pub fn model_id_sql_type(&self) -> &'static str {
        match (self.model_id_strategy, self.key_strategy) {
            (ModelIdStrategy::MirrorRowId, KeyStrategy::AutoIncrement) => "INTEGER",
            _ => "TEXT",
        }
    }

    /// Type of any column a query may reference, payload or bookkeeping.
    pub fn column_type(&self, name: &str) -> Option<FieldType> {
        let key_type = match self.key_strategy {
            KeyStrategy::AutoIncrement => FieldType::Integer,
            KeyStrategy::Uuid => FieldType::Text,
        };
        match name {
            COLUMN_ROW_ID | COLUMN_PREVIOUS_ROW_ID | COLUMN_NEXT_ROW_ID => Some(key_type),
            COLUMN_MODEL_ID => Some(match self.model_id_sql_type() {
                "INTEGER" => FieldType::Integer,
                _ => FieldType::Text,
            }),
            COLUMN_VERSION => Some(FieldType::Integer),
            COLUMN_IS_CURRENT => Some(FieldType::Boolean),
            COLUMN_CREATED_AT | COLUMN_UPDATED_AT => Some(FieldType::Text),
            other => self.field_def(other).map(|f| f.field_type),
        }
    }

    /// Check names, reserved columns and the allowlist.
    pub fn validate(&self) -> VersoResult<()> {
        if !IDENTIFIER.is_match(&self.table) {
            return Err(VersoError::validation(format!(
                "Invalid table name '{}'",
                self.table
            )));
        }
        if self.fields.is_empty() {
            return Err(VersoError::validation(format!(
                "Schema '{}' declares no payload fields",
                self.table
            )));
        }

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if !IDENTIFIER.is_match(&field.name) {
                return Err(VersoError::validation(format!(
                    "Invalid field name '{}'",
                    field.name
                )));
            }
            if Self::is_bookkeeping(&field.name) || field.name == "deleted_at" {
                return Err(VersoError::validation_with_code(
                    format!("Field name '{}' is reserved by the store", field.name),
                    ErrorCode::ValReservedField,
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(VersoError::validation(format!(
                    "Duplicate field '{}'",
                    field.name
                )));
            }
        }

        if let Some(stray) = self.minor_fields.iter().find(|f| !seen.contains(f.as_str())) {
            return Err(VersoError::unknown_field(&self.table, stray));
        }

        Ok(())
    }

    /// Check a payload against the declared fields and types.
    pub fn check_payload(&self, payload: &Payload) -> VersoResult<()> {
        for (name, value) in payload {
            let def = self
                .field_def(name)
                .ok_or_else(|| VersoError::unknown_field(&self.table, name))?;
            def.field_type.to_sql(name, value)?;
        }

        for def in self.fields.iter().filter(|f| f.required) {
            if payload.get(&def.name).map_or(true, Value::is_null) {
                return Err(VersoError::validation(format!(
                    "Field '{}' is required",
                    def.name
                )));
            }
        }

        Ok(())
    }

    /// Payload with every value in its stored representation, so integers
    /// given to `Real` fields compare equal to what is read back.
    pub fn normalize_payload(&self, payload: &Payload) -> VersoResult<Payload> {
        payload
            .iter()
            .map(|(name, value)| {
                let def = self
                    .field_def(name)
                    .ok_or_else(|| VersoError::unknown_field(&self.table, name))?;
                Ok((name.clone(), def.field_type.normalize(name, value)?))
            })
            .collect()
    }

    /// Bindable values for every payload column, in declaration order.
    pub fn payload_values(&self, payload: &Payload) -> VersoResult<Vec<SqlValue>> {
        self.fields
            .iter()
            .map(|def| {
                let value = payload.get(&def.name).unwrap_or(&Value::Null);
                def.field_type.to_sql(&def.name, value)
            })
            .collect()
    }

    /// Comma-separated select list: bookkeeping columns then payload columns.
    pub fn select_columns(&self) -> String {
        BOOKKEEPING_COLUMNS
            .iter()
            .copied()
            .chain(self.fields.iter().map(|f| f.name.as_str()))
            .map(quote)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Quoted table name.
    pub fn quoted_table(&self) -> String {
        quote(&self.table)
    }

    /// DDL for the table and its indexes.
    pub fn create_table_sql(&self) -> String {
        let key_type = self.key_sql_type();
        let row_id = match self.key_strategy {
            KeyStrategy::AutoIncrement => "row_id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
            KeyStrategy::Uuid => "row_id TEXT PRIMARY KEY NOT NULL".to_string(),
        };

        let mut columns = vec![
            row_id,
            // Nullable: mirrored ids are filled in right after the first insert.
            format!("model_id {}", self.model_id_sql_type()),
            "version INTEGER NOT NULL CHECK (version >= 1)".to_string(),
            "is_current INTEGER NOT NULL DEFAULT 1 CHECK (is_current IN (0, 1))".to_string(),
            format!("previous_row_id {}", key_type),
            format!("next_row_id {}", key_type),
            "created_at TEXT NOT NULL".to_string(),
            "updated_at TEXT NOT NULL".to_string(),
        ];
        columns.extend(
            self.fields
                .iter()
                .map(|f| format!("{} {}", quote(&f.name), f.field_type.sql_type())),
        );

        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                {columns}
            );

            CREATE UNIQUE INDEX IF NOT EXISTS "idx_{name}_model_version"
                ON {table}(model_id, version);

            CREATE INDEX IF NOT EXISTS "idx_{name}_model_current"
                ON {table}(model_id, is_current);
            "#,
            table = self.quoted_table(),
            name = self.table,
            columns = columns.join(",\n                "),
        )
    }
}

/// Quote an identifier that has already passed validation.
pub(crate) fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}
