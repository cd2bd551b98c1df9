//! Storage Error Types
//!
//! This module defines error types for the persistence layer: object storage
//! (CSV snapshots, schema documents) and the key-value mutation log. Service
//! level errors are handled by the service-layer error types.

use thiserror::Error;

/// Persistence operation errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// A requested object does not exist
    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    /// A conditional put observed a different generation than expected,
    /// which indicates a second writer for the same tenant
    #[error("conditional put failed for {key}: expected generation {expected:?}, found {found:?}")]
    PreconditionFailed {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// A snapshot table's checksum did not match its manifest entry
    #[error("checksum mismatch for table '{table}': manifest {expected}, computed {found}")]
    ChecksumMismatch {
        table: String,
        expected: String,
        found: String,
    },

    /// The backing store is unreachable or failing
    #[error("storage unavailable: {context}")]
    Unavailable { context: String },

    /// Filesystem I/O failure
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encode/decode failure
    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    /// JSON encode/decode failure
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// Create an object not found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::ObjectNotFound { key: key.into() }
    }

    /// Create an unavailable error
    pub fn unavailable(context: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
        }
    }

    /// Whether retrying the operation could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Io(_))
    }
}
