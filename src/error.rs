//! Error types for the media file database.

use crate::types::Hash;
use thiserror::Error;

/// Errors raised by storage backends and the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid continuation token: {0}")]
    InvalidContinuationToken(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StorageError {
    /// Wrap a serializer failure. Corrupt blobs surface as `Serialization`
    /// rather than panicking mid-pipeline.
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised by the database engines (tree, record store, pipelines).
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Target location is not empty: {0}. A database can only be initialized into an empty location.")]
    LocationNotEmpty(String),

    #[error("No asset tree found at {0}. This location does not contain a database.")]
    TreeNotFound(String),

    #[error("Database version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: Hash,
        actual: Hash,
    },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("No sort index for field '{field}' ({direction})")]
    SortIndexNotFound { field: String, direction: String },

    #[error("Page not found: {0}")]
    PageNotFound(u64),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Task failed after {attempts} attempts: {message}")]
    TaskFailed { attempts: u32, message: String },
}

impl From<config::ConfigError> for DatabaseError {
    fn from(err: config::ConfigError) -> Self {
        DatabaseError::ConfigError(err.to_string())
    }
}
