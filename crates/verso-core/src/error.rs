//! Error types for verso operations.
//!
//! Every failure surfaced by the store maps onto one variant of [`VersoError`],
//! each carrying a structured [`ErrorCode`] for programmatic handling.

use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for verso operations.
pub type VersoResult<T> = Result<T, VersoError>;

/// Main error type for all verso operations.
#[derive(Error, Debug)]
pub enum VersoError {
    /// Input was rejected, either by schema checks or by a pre-save hook.
    #[error("Validation failed: {message}")]
    ValidationFailed {
        message: String,
        code: ErrorCode,
        details: HashMap<String, String>,
    },

    /// The current row moved on between load and write.
    #[error(
        "Concurrent version conflict on {table}/{model_id}: expected version {expected}, found {found:?}"
    )]
    ConcurrentVersionConflict {
        table: String,
        model_id: String,
        expected: u32,
        found: Option<u32>,
    },

    /// The backend aborted the transaction; nothing was committed.
    #[error("Transaction failed: {message}")]
    TransactionFailed {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Two rows from different tables were compared.
    #[error("Incompatible schema: cannot compare '{left}' with '{right}'")]
    IncompatibleSchema { left: String, right: String },

    /// A chain does not have the shape the store guarantees.
    #[error("Invariant violation on {table}/{model_id}: {message}")]
    InvariantViolation {
        table: String,
        model_id: String,
        message: String,
    },

    /// Row or version not found.
    #[error("Not found: {message}")]
    NotFound { message: String, code: ErrorCode },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Stored data could not be decoded.
    #[error("Parse error: {message}")]
    Parse { message: String, code: ErrorCode },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation (VAL_xxx)
    ValInvalidInput,
    ValUnknownField,
    ValTypeMismatch,
    ValReservedField,
    ValHookRejected,
    ValArchivedRow,

    // Versioning (VER_xxx)
    VerConflict,
    VerInvariant,
    VerIncompatibleSchema,

    // Lookup (NF_xxx)
    NotFoundRow,
    NotFoundVersion,

    // Transaction (TXN_xxx)
    TxnAborted,
    TxnBusy,

    // Database (DB_xxx)
    DbConnectionFailed,
    DbOperationFailed,

    // Parse (PARSE_xxx)
    ParseTimestamp,
    ParseValue,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValInvalidInput => "VAL_001",
            ErrorCode::ValUnknownField => "VAL_002",
            ErrorCode::ValTypeMismatch => "VAL_003",
            ErrorCode::ValReservedField => "VAL_004",
            ErrorCode::ValHookRejected => "VAL_005",
            ErrorCode::ValArchivedRow => "VAL_006",
            ErrorCode::VerConflict => "VER_001",
            ErrorCode::VerInvariant => "VER_002",
            ErrorCode::VerIncompatibleSchema => "VER_003",
            ErrorCode::NotFoundRow => "NF_001",
            ErrorCode::NotFoundVersion => "NF_002",
            ErrorCode::TxnAborted => "TXN_001",
            ErrorCode::TxnBusy => "TXN_002",
            ErrorCode::DbConnectionFailed => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::ParseTimestamp => "PARSE_001",
            ErrorCode::ParseValue => "PARSE_002",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl VersoError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::validation_with_code(message, ErrorCode::ValInvalidInput)
    }

    /// Create a validation error with a specific code.
    pub fn validation_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::ValidationFailed {
            message: message.into(),
            code,
            details: HashMap::new(),
        }
    }

    /// Create a validation error for a field the schema does not declare.
    pub fn unknown_field(table: &str, field: &str) -> Self {
        let mut details = HashMap::new();
        details.insert("table".to_string(), table.to_string());
        details.insert("field".to_string(), field.to_string());
        Self::ValidationFailed {
            message: format!("Unknown field '{}' for table '{}'", field, table),
            code: ErrorCode::ValUnknownField,
            details,
        }
    }

    /// Create a not found error for a missing row.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            code: ErrorCode::NotFoundRow,
        }
    }

    /// Create a not found error for a missing version of an entity.
    pub fn version_not_found(table: &str, model_id: impl std::fmt::Display, version: u32) -> Self {
        Self::NotFound {
            message: format!(
                "No archived version {} for '{}' in table '{}'",
                version, model_id, table
            ),
            code: ErrorCode::NotFoundVersion,
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            source: None,
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            code: ErrorCode::ParseValue,
        }
    }

    /// Create an invariant violation error.
    pub fn invariant(
        table: impl Into<String>,
        model_id: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::InvariantViolation {
            table: table.into(),
            model_id: model_id.to_string(),
            message: message.into(),
        }
    }

    /// Re-label a backend failure raised inside a versioning transaction.
    ///
    /// Typed versioning errors pass through untouched.
    pub fn into_transaction_failure(self) -> Self {
        match self {
            Self::Database {
                message, source, ..
            } => Self::TransactionFailed {
                message,
                code: ErrorCode::TxnAborted,
                source,
            },
            other => other,
        }
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ValidationFailed { code, .. } => *code,
            Self::ConcurrentVersionConflict { .. } => ErrorCode::VerConflict,
            Self::TransactionFailed { code, .. } => *code,
            Self::IncompatibleSchema { .. } => ErrorCode::VerIncompatibleSchema,
            Self::InvariantViolation { .. } => ErrorCode::VerInvariant,
            Self::NotFound { code, .. } => *code,
            Self::Database { code, .. } => *code,
            Self::Parse { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether repeating the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentVersionConflict { .. } | Self::TransactionFailed { .. }
        )
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConcurrentVersionConflict { .. } => {
                Some("Reload the current row and retry the save")
            }
            Self::TransactionFailed { .. } => Some("The transaction was rolled back; retry it"),
            Self::InvariantViolation { .. } => {
                Some("Rows were written outside the store; run an audit and repair by hand")
            }
            Self::IncompatibleSchema { .. } => Some("Only compare rows from the same table"),
            Self::ValidationFailed { .. } => Some("Fix the input and save again"),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for VersoError {
    fn from(err: rusqlite::Error) -> Self {
        let busy = matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        );

        if busy {
            Self::TransactionFailed {
                message: err.to_string(),
                code: ErrorCode::TxnBusy,
                source: Some(Box::new(err)),
            }
        } else {
            Self::Database {
                message: err.to_string(),
                code: ErrorCode::DbOperationFailed,
                source: Some(Box::new(err)),
            }
        }
    }
}
