//! Field-level deltas between two snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{VersoError, VersoResult};
use crate::schema::{
    COLUMN_CREATED_AT, COLUMN_IS_CURRENT, COLUMN_MODEL_ID, COLUMN_NEXT_ROW_ID,
    COLUMN_PREVIOUS_ROW_ID, COLUMN_ROW_ID, COLUMN_UPDATED_AT, COLUMN_VERSION,
};
use crate::types::VersionRow;

/// Fields never reported as differences.
pub const IGNORED_FIELDS: [&str; 9] = [
    COLUMN_IS_CURRENT,
    COLUMN_VERSION,
    COLUMN_MODEL_ID,
    COLUMN_CREATED_AT,
    COLUMN_UPDATED_AT,
    "deleted_at",
    COLUMN_ROW_ID,
    COLUMN_PREVIOUS_ROW_ID,
    COLUMN_NEXT_ROW_ID,
];

/// The two sides of one differing field. `None` means the field is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub left: Option<Value>,
    pub right: Option<Value>,
}

/// Computes deltas between snapshots.
#[derive(Debug, Clone)]
pub struct VersionDiffer {
    ignored: BTreeSet<String>,
}

impl Default for VersionDiffer {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionDiffer {
    pub fn new() -> Self {
        Self {
            ignored: IGNORED_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Also ignore these fields on every diff.
    pub fn ignoring<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Diff two rows of the same table.
    pub fn diff(
        &self,
        left: &VersionRow,
        right: &VersionRow,
        exclude: &[&str],
    ) -> VersoResult<BTreeMap<String, FieldChange>> {
        if left.table != right.table {
            return Err(VersoError::IncompatibleSchema {
                left: left.table.clone(),
                right: right.table.clone(),
            });
        }
        Ok(self.diff_maps(&left.attributes(), &right.attributes(), exclude))
    }

    /// Diff two attribute maps.
    pub fn diff_maps(
        &self,
        left: &BTreeMap<String, Value>,
        right: &BTreeMap<String, Value>,
        exclude: &[&str],
    ) -> BTreeMap<String, FieldChange> {
        let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();

        keys.into_iter()
            .filter(|k| !self.ignored.contains(*k) && !exclude.contains(&k.as_str()))
            .filter_map(|k| {
                let (l, r) = (left.get(k), right.get(k));
                (l != r).then(|| {
                    (
                        k.clone(),
                        FieldChange {
                            left: l.cloned(),
                            right: r.cloned(),
                        },
                    )
                })
            })
            .collect()
    }
}
