//! Walking and reverting version chains.

use tracing::info;

use super::store::{SaveMode, SavedRecord, VersionedStore};
use crate::error::{VersoError, VersoResult};
use crate::scope::ReadMode;
use crate::types::{Record, RecordKey, VersionRow};

/// Navigation over any [`VersionedStore`].
pub trait VersionNavigator: VersionedStore {
    /// The row one version older, or `None` at version 1.
    fn previous_version(&self, row: &VersionRow) -> VersoResult<Option<VersionRow>> {
        if row.version <= 1 {
            return Ok(None);
        }
        self.find_version(&row.model_id, row.version - 1, ReadMode::WithHistory)
    }

    /// The row one version newer, or `None` for the current row.
    fn next_version(&self, row: &VersionRow) -> VersoResult<Option<VersionRow>> {
        if row.is_current {
            return Ok(None);
        }
        self.find_version(&row.model_id, row.version + 1, ReadMode::WithHistory)
    }

    /// Follow the stored back link.
    fn previous_linked(&self, row: &VersionRow) -> VersoResult<Option<VersionRow>> {
        match &row.previous_row_id {
            Some(id) => self.find_by_row_id(id, ReadMode::WithHistory),
            None => Ok(None),
        }
    }

    /// Follow the stored forward link.
    fn next_linked(&self, row: &VersionRow) -> VersoResult<Option<VersionRow>> {
        match &row.next_row_id {
            Some(id) => self.find_by_row_id(id, ReadMode::WithHistory),
            None => Ok(None),
        }
    }

    /// Restore an archived version's payload onto `record` as a new version.
    ///
    /// `record` must be positioned on the current row. Reverting to the
    /// current version or a version that does not exist is `NotFound`.
    fn revert_record(&self, record: &mut Record, target_version: u32) -> VersoResult<SavedRecord> {
        let model_id = record.model_id().cloned().ok_or_else(|| {
            VersoError::validation("Cannot revert a record that was never saved")
        })?;

        let target = self
            .find_version(&model_id, target_version, ReadMode::OnlyHistory)?
            .ok_or_else(|| {
                VersoError::version_not_found(self.schema().table(), &model_id, target_version)
            })?;

        // Stage on a copy so a failed save leaves the caller's record alone.
        let mut staged = record.clone();
        staged.replace_payload(target.payload);
        let saved = self.save_with(&mut staged, SaveMode::Major)?;

        info!(
            table = %self.schema().table(),
            model_id = %model_id,
            reverted_to = target_version,
            version = saved.row.version,
            "Reverted record"
        );
        *record = staged;
        Ok(saved)
    }

    /// Revert the entity `model_id` to `target_version`.
    fn revert_to(&self, model_id: &RecordKey, target_version: u32) -> VersoResult<SavedRecord> {
        let current = self.find_current(model_id)?.ok_or_else(|| {
            VersoError::not_found(format!(
                "No current row for '{}' in table '{}'",
                model_id,
                self.schema().table()
            ))
        })?;
        self.revert_record(&mut Record::from_row(current), target_version)
    }
}

impl<T: VersionedStore + ?Sized> VersionNavigator for T {}
