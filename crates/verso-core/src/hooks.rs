//! Pre-save hooks.
//!
//! Hooks are registered on a store and may veto a save. `saving` runs before
//! any write; `updating` runs inside the major-edit transaction after the
//! prior state has been archived, so a veto there rolls the archive back.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::{ErrorCode, VersoError};
use crate::types::Record;

/// What a save is about to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    /// First version of a new entity.
    Create,
    /// In-place patch of the current row.
    MinorPatch,
    /// New version with the prior state archived.
    MajorEdit,
}

/// A hook's refusal to let a save proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<Rejection> for VersoError {
    fn from(rejection: Rejection) -> Self {
        VersoError::validation_with_code(rejection.reason, ErrorCode::ValHookRejected)
    }
}

/// Callback consulted on every save.
#[cfg_attr(test, mockall::automock)]
pub trait SaveHook: Send + Sync {
    /// Called before any write.
    fn saving(&self, kind: ChangeKind, record: &Record) -> Result<(), Rejection> {
        let _ = (kind, record);
        Ok(())
    }

    /// Called inside a major edit's transaction, after archiving.
    fn updating(&self, kind: ChangeKind, record: &Record) -> Result<(), Rejection> {
        let _ = (kind, record);
        Ok(())
    }
}
