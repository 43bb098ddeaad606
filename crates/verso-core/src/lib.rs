//! verso-core - Core library for verso.
//!
//! Versioned records on SQLite: every major edit archives the prior state as
//! an immutable row sharing the entity's `model_id`, while exactly one row
//! per entity stays current. Reads choose which versions they see; archived
//! versions can be walked, diffed and restored.
//!
//! # Example
//!
//! ```ignore
//! use verso_core::{Database, FieldType, Record, Schema, VersionNavigator, VersionedStore};
//!
//! let db = Database::in_memory()?;
//! let store = db.versioned(
//!     Schema::new("articles")
//!         .required_field("title", FieldType::Text)
//!         .field("views", FieldType::Integer)
//!         .with_minor_fields(["views"]),
//! )?;
//!
//! let mut article = Record::new("articles").with("title", "Draft");
//! store.save(&mut article)?;                  // version 1
//!
//! article.set("title", "Published")?;
//! store.save(&mut article)?;                  // version 2, version 1 archived
//!
//! store.revert_record(&mut article, 1)?;      // version 3 with the draft title
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod schema;
pub mod scope;
pub mod types;
pub mod versioning;

// Re-export commonly used types
pub use config::{ArchiveStrategy, StoreConfig};
pub use db::Database;
pub use error::{ErrorCode, VersoError, VersoResult};
pub use hooks::{ChangeKind, Rejection, SaveHook};
pub use schema::{FieldType, KeyStrategy, ModelIdStrategy, Schema};
pub use scope::{Direction, Query, ReadMode};
pub use types::{Filter, FilterOperator, Payload, Record, RecordKey, VersionRow};
pub use versioning::{
    AuditReport, FieldChange, SaveMode, SaveOutcome, SavedRecord, SqliteVersionedStore,
    VersionChain, VersionDiffer, VersionNavigator, VersionedStore,
};
