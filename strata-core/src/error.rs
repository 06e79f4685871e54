//! Error types for STRATA operations

use std::fmt::Debug;
use thiserror::Error;

/// Render a key for inclusion in an error message.
pub fn describe_key<K: Debug>(key: &K) -> String {
    format!("{:?}", key)
}

/// Remote fetch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed: {reason}")]
    Failed { reason: String },

    #[error("Fetcher reported: {message}")]
    Message { message: String },

    #[error("No data produced for key {key}")]
    NoData { key: String },
}

/// Source of truth read/write errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Read failed for key {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Write failed for key {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Delete failed for key {key}: {reason}")]
    DeleteFailed { key: String, reason: String },

    #[error("Source of truth reported: {message}")]
    Message { message: String },
}

/// Write reconciliation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Unresolved conflict for key {key}: {reason}")]
    Unresolved { key: String, reason: String },

    #[error("Updater rejected write for key {key}: {reason}")]
    UpdateRejected { key: String, reason: String },

    #[error("No pending write for key {key}")]
    MissingWrite { key: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Per-key coordination errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConcurrencyError {
    #[error("Lock unavailable for key {key}")]
    LockUnavailable { key: String },

    #[error("Channel manager closed")]
    ManagerClosed,

    #[error("No async runtime available to spawn {task}")]
    NoRuntime { task: String },
}

/// Master error type for all STRATA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Conflict error: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),
}

/// Result type alias for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;

// =============================================================================
// TESTS
// =============================================================================
