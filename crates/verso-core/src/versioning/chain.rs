//! Version chains and identity assignment.

use serde::{Deserialize, Serialize};

use crate::error::{VersoError, VersoResult};
use crate::schema::{KeyStrategy, ModelIdStrategy};
use crate::types::{RecordKey, VersionRow};

/// Every stored version of one entity, ordered by version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionChain {
    model_id: RecordKey,
    rows: Vec<VersionRow>,
}

impl VersionChain {
    /// Build a chain from rows of one `model_id`, in any order.
    pub fn new(model_id: RecordKey, mut rows: Vec<VersionRow>) -> Self {
        rows.sort_by_key(|r| r.version);
        Self { model_id, rows }
    }

    pub fn model_id(&self) -> &RecordKey {
        &self.model_id
    }

    pub fn rows(&self) -> &[VersionRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<VersionRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The row default reads see.
    pub fn current(&self) -> Option<&VersionRow> {
        self.rows.iter().find(|r| r.is_current)
    }

    /// The row holding a given version.
    pub fn get(&self, version: u32) -> Option<&VersionRow> {
        self.rows.iter().find(|r| r.version == version)
    }

    /// Highest version number in the chain, 0 when empty.
    pub fn latest_version(&self) -> u32 {
        self.rows.last().map_or(0, |r| r.version)
    }

    /// Archived rows, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &VersionRow> {
        self.rows.iter().filter(|r| !r.is_current)
    }

    /// Check the chain shape, returning the first violation found.
    pub fn validate(&self, table: &str) -> VersoResult<()> {
        let entries: Vec<ChainEntry> = self.rows.iter().map(ChainEntry::from).collect();
        check_entries(table, &self.model_id, &entries)
    }
}

/// Bookkeeping columns of one row; enough to check a chain's shape.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChainEntry {
    pub row_id: RecordKey,
    pub version: u32,
    pub is_current: bool,
    pub previous_row_id: Option<RecordKey>,
    pub next_row_id: Option<RecordKey>,
}

impl From<&VersionRow> for ChainEntry {
    fn from(row: &VersionRow) -> Self {
        Self {
            row_id: row.row_id.clone(),
            version: row.version,
            is_current: row.is_current,
            previous_row_id: row.previous_row_id.clone(),
            next_row_id: row.next_row_id.clone(),
        }
    }
}

/// Check entries sorted by version: contiguous versions from 1, exactly one
/// current row holding the highest version, links following version order.
pub(crate) fn check_entries(
    table: &str,
    model_id: &RecordKey,
    entries: &[ChainEntry],
) -> VersoResult<()> {
    let violation = |message: String| VersoError::invariant(table, model_id, message);

    let last = match entries.last() {
        Some(last) => last,
        None => return Err(violation("chain has no rows".to_string())),
    };

    for (index, entry) in entries.iter().enumerate() {
        let expected = index as u32 + 1;
        if entry.version != expected {
            return Err(violation(format!(
                "versions are not contiguous: expected {}, found {}",
                expected, entry.version
            )));
        }
    }

    let current = entries.iter().filter(|e| e.is_current).count();
    if current != 1 {
        return Err(violation(format!(
            "expected exactly one current row, found {}",
            current
        )));
    }
    if !last.is_current {
        return Err(violation(format!(
            "current row does not hold the highest version {}",
            last.version
        )));
    }

    for (index, entry) in entries.iter().enumerate() {
        let previous = index.checked_sub(1).map(|i| &entries[i].row_id);
        let next = entries.get(index + 1).map(|e| &e.row_id);

        if entry.previous_row_id.as_ref() != previous {
            return Err(violation(format!(
                "version {} links back to {:?}, expected {:?}",
                entry.version, entry.previous_row_id, previous
            )));
        }
        if entry.next_row_id.as_ref() != next {
            return Err(violation(format!(
                "version {} links forward to {:?}, expected {:?}",
                entry.version, entry.next_row_id, next
            )));
        }
    }

    Ok(())
}

/// Physical key for a row about to be inserted.
///
/// `None` means SQLite assigns it.
pub fn new_row_id(strategy: KeyStrategy) -> Option<RecordKey> {
    match strategy {
        KeyStrategy::AutoIncrement => None,
        KeyStrategy::Uuid => Some(RecordKey::new_uuid()),
    }
}

/// `model_id` for a new entity whose first row gets `row_id`.
///
/// `None` means the id mirrors a row id that is only known after insert.
pub fn assign_model_id(
    strategy: ModelIdStrategy,
    row_id: Option<&RecordKey>,
) -> Option<RecordKey> {
    match strategy {
        ModelIdStrategy::MirrorRowId => row_id.cloned(),
        ModelIdStrategy::Generated => Some(RecordKey::new_uuid()),
    }
}
