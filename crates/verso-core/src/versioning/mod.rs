//! Version chains, the versioned store, navigation and diffs.

mod chain;
mod differ;
mod navigator;
mod store;

pub use chain::{assign_model_id, new_row_id, VersionChain};
pub use differ::{FieldChange, VersionDiffer, IGNORED_FIELDS};
pub use navigator::VersionNavigator;
pub use store::{
    AuditReport, ChainViolation, SaveMode, SaveOutcome, SavedRecord, SqliteVersionedStore,
    VersionedStore,
};
