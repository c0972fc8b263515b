//! Error taxonomy shared by every engine component.

use crate::codec::CodecError;
use crate::session::persistence::StoreError;
use crate::table::ColumnType;

/// Errors surfaced to callers of the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad operation parameters; nothing was changed
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Duplicate session or a lost concurrent write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Undo/redo at a history boundary
    #[error("Nothing to {0}")]
    NoOp(&'static str),

    /// Unknown session or dataset
    #[error("Not found: {0}")]
    NotFound(String),

    /// Snapshot bytes could not be decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Store unreachable or a call missed its deadline; retryable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Import safety check failed
    #[error("Dataset mismatch: expected {expected}, found {found}")]
    DatasetMismatch { expected: String, found: String },

    /// Persisted data exists but does not match its recorded checksum
    #[error("Corrupted session data: {0}")]
    Corrupted(String),

    /// Recovery failed closed; the caller must initialize again
    #[error("Session {session_id} is unrecoverable: {}", issues.join("; "))]
    Unrecoverable {
        session_id: String,
        issues: Vec<String>,
    },
}

impl EngineError {
    /// Shorthand for the unsupported-version codec failure.
    pub fn is_unsupported_version(&self) -> bool {
        matches!(self, EngineError::Codec(CodecError::UnsupportedVersion { .. }))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { .. } => EngineError::Conflict(err.to_string()),
            StoreError::MissingKey(key) => {
                EngineError::NotFound(format!("store key {} vanished", key))
            }
            StoreError::Unavailable(_) | StoreError::Timeout(_) => {
                EngineError::Unavailable(err.to_string())
            }
        }
    }
}

/// Reports which column or parameter made an operation invalid.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("column '{0}' already exists")]
    DuplicateColumn(String),

    #[error("invalid column name '{0}'")]
    InvalidColumnName(String),

    #[error("column '{column}' has type {actual}, expected {expected}")]
    WrongColumnType {
        column: String,
        actual: ColumnType,
        expected: &'static str,
    },

    #[error("cannot convert column '{column}' to {target}: rows {rows:?} are not convertible")]
    TypeCoercion {
        column: String,
        target: ColumnType,
        rows: Vec<usize>,
    },

    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        parameter: &'static str,
        reason: String,
    },

    #[error("column '{column}' has {length} rows, expected {expected}")]
    RaggedColumn {
        column: String,
        length: usize,
        expected: usize,
    },
}

impl ValidationError {
    pub fn parameter(parameter: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidParameter {
            parameter,
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
