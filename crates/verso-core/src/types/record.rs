//! Stored version rows and in-memory records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::key::RecordKey;
use crate::error::{ErrorCode, VersoError, VersoResult};
use crate::schema::{
    Schema, COLUMN_CREATED_AT, COLUMN_IS_CURRENT, COLUMN_MODEL_ID, COLUMN_NEXT_ROW_ID,
    COLUMN_PREVIOUS_ROW_ID, COLUMN_ROW_ID, COLUMN_UPDATED_AT, COLUMN_VERSION,
};
use crate::versioning::VersionDiffer;

/// Application-owned field values, keyed by column name.
pub type Payload = BTreeMap<String, Value>;

/// One physical row of a versioned table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRow {
    /// Table the row was read from.
    pub table: String,
    /// Physical primary key.
    pub row_id: RecordKey,
    /// Logical entity id shared by every version.
    pub model_id: RecordKey,
    /// Version number within the chain, starting at 1.
    pub version: u32,
    /// Whether this is the row default reads see.
    pub is_current: bool,
    /// Application fields.
    pub payload: Payload,
    /// Row holding the previous version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_row_id: Option<RecordKey>,
    /// Row holding the next version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_row_id: Option<RecordKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VersionRow {
    /// Get a payload value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// Get a payload value as a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Every column of the row, bookkeeping included, as JSON values.
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        let mut attributes = self.payload.clone();
        attributes.insert(COLUMN_ROW_ID.to_string(), self.row_id.to_json());
        attributes.insert(COLUMN_MODEL_ID.to_string(), self.model_id.to_json());
        attributes.insert(COLUMN_VERSION.to_string(), Value::from(self.version));
        attributes.insert(COLUMN_IS_CURRENT.to_string(), Value::Bool(self.is_current));
        attributes.insert(
            COLUMN_PREVIOUS_ROW_ID.to_string(),
            self.previous_row_id
                .as_ref()
                .map_or(Value::Null, RecordKey::to_json),
        );
        attributes.insert(
            COLUMN_NEXT_ROW_ID.to_string(),
            self.next_row_id.as_ref().map_or(Value::Null, RecordKey::to_json),
        );
        attributes.insert(
            COLUMN_CREATED_AT.to_string(),
            Value::String(self.created_at.to_rfc3339()),
        );
        attributes.insert(
            COLUMN_UPDATED_AT.to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        attributes
    }

    /// Attributes as shown to API consumers.
    ///
    /// Current rows hide `is_current` and `model_id`; archived rows keep them
    /// so a caller can tell which entity and slot a snapshot belongs to.
    pub fn to_public_map(&self) -> BTreeMap<String, Value> {
        let mut attributes = self.attributes();
        if self.is_current {
            attributes.remove(COLUMN_IS_CURRENT);
            attributes.remove(COLUMN_MODEL_ID);
        }
        attributes
    }
}

/// An in-memory record: the desired state of one entity plus the snapshot it
/// was last persisted as.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: String,
    payload: Payload,
    persisted: Option<VersionRow>,
    versioned: bool,
}

impl Record {
    /// A new, unsaved record for the given table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            payload: Payload::new(),
            persisted: None,
            versioned: true,
        }
    }

    /// A record positioned on a fetched row.
    pub fn from_row(row: VersionRow) -> Self {
        Self {
            table: row.table.clone(),
            payload: row.payload.clone(),
            persisted: Some(row),
            versioned: true,
        }
    }

    /// Builder: set a field.
    ///
    /// Names are checked against the schema when the record is saved; use
    /// [`Record::set`] to reject store-owned names immediately.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(field.into(), value.into());
        self
    }

    /// Builder: save every change of this record in place, never versioning.
    pub fn without_versioning(mut self) -> Self {
        self.versioned = false;
        self
    }

    /// Turn versioning on or off for this record.
    pub fn set_versioning(&mut self, enabled: bool) {
        self.versioned = enabled;
    }

    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    /// Set a payload field. Store-owned columns are rejected.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> VersoResult<()> {
        let field = field.into();
        if Schema::is_bookkeeping(&field) {
            return Err(VersoError::validation_with_code(
                format!("'{}' is managed by the store", field),
                ErrorCode::ValReservedField,
            ));
        }
        self.payload.insert(field, value.into());
        Ok(())
    }

    /// Clear a field to null.
    pub fn unset(&mut self, field: &str) {
        if let Some(value) = self.payload.get_mut(field) {
            *value = Value::Null;
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Replace the whole payload, e.g. with an older snapshot's fields.
    pub fn replace_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    /// The last persisted snapshot, if the record has been saved.
    pub fn persisted(&self) -> Option<&VersionRow> {
        self.persisted.as_ref()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.is_some()
    }

    pub fn row_id(&self) -> Option<&RecordKey> {
        self.persisted.as_ref().map(|r| &r.row_id)
    }

    pub fn model_id(&self) -> Option<&RecordKey> {
        self.persisted.as_ref().map(|r| &r.model_id)
    }

    pub fn version(&self) -> Option<u32> {
        self.persisted.as_ref().map(|r| r.version)
    }

    pub fn is_current(&self) -> bool {
        self.persisted.as_ref().map_or(false, |r| r.is_current)
    }

    /// Fields whose desired value differs from the persisted snapshot.
    ///
    /// For an unsaved record every field set so far counts as changed.
    pub fn changed_fields(&self) -> BTreeSet<String> {
        match &self.persisted {
            None => self.payload.keys().cloned().collect(),
            Some(row) => VersionDiffer::new()
                .diff_maps(&row.payload, &self.payload, &[])
                .into_keys()
                .collect(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.changed_fields().is_empty()
    }

    /// Throw away unsaved edits.
    pub fn discard_changes(&mut self) {
        match &self.persisted {
            Some(row) => self.payload = row.payload.clone(),
            None => self.payload.clear(),
        }
    }

    /// Adopt a freshly written row as the persisted state.
    pub(crate) fn mark_persisted(&mut self, row: VersionRow) {
        self.payload = row.payload.clone();
        self.persisted = Some(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(version: u32, is_current: bool, name: &str) -> VersionRow {
        let now = Utc::now();
        VersionRow {
            table: "widgets".to_string(),
            row_id: RecordKey::Int(version as i64),
            model_id: RecordKey::Int(1),
            version,
            is_current,
            payload: [("name".to_string(), json!(name))].into(),
            previous_row_id: None,
            next_row_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_new_record_changes_every_field() {
        let record = Record::new("widgets").with("name", "A").with("stock", 3);
        let changed = record.changed_fields();
        assert_eq!(changed.len(), 2);
        assert!(!record.is_persisted());
        assert_eq!(record.version(), None);
    }

    #[test]
    fn test_changed_fields_against_snapshot() {
        let mut record = Record::from_row(row(1, true, "A"));
        assert!(!record.is_dirty());

        record.set("name", "A").unwrap();
        assert!(!record.is_dirty());

        record.set("name", "B").unwrap();
        record.set("stock", 4).unwrap();
        let changed: Vec<_> = record.changed_fields().into_iter().collect();
        assert_eq!(changed, vec!["name".to_string(), "stock".to_string()]);

        record.discard_changes();
        assert!(!record.is_dirty());
        assert_eq!(record.get("name"), Some(&json!("A")));
    }

    #[test]
    fn test_set_rejects_bookkeeping_fields() {
        let mut record = Record::new("widgets");
        let err = record.set("version", 9).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValReservedField);
        assert!(record.set("is_current", false).is_err());
    }

    #[test]
    fn test_public_map_hides_bookkeeping_on_current_rows() {
        let current = row(2, true, "B").to_public_map();
        assert!(!current.contains_key("is_current"));
        assert!(!current.contains_key("model_id"));
        assert_eq!(current.get("version"), Some(&json!(2)));

        let archived = row(1, false, "A").to_public_map();
        assert_eq!(archived.get("is_current"), Some(&json!(false)));
        assert_eq!(archived.get("model_id"), Some(&json!(1)));
    }

    #[test]
    fn test_versioning_switch() {
        let record = Record::new("widgets").without_versioning();
        assert!(!record.is_versioned());
    }
}
