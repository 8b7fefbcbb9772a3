//! Storage and locality index error types
//!
//! Defines all errors that can occur while reading segments or building
//! and querying a locality index. "Not found" is never an error here:
//! a missing key or an empty bucket search is reported through `Option`
//! or the `has_*` flags of the query results.

use thiserror::Error;

/// Errors that can occur in the storage layer and the locality index
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, unsorted row, row count mismatch, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Row ordinal is not below the artifact's key count
    #[error("Row {row} out of range (key count {key_count})")]
    OutOfRange { row: u64, key_count: u64 },

    /// Bucket set handed to the codec is unsorted or exceeds the ceiling
    #[error("Invalid bucket set: {0}")]
    InvalidBucketSet(String),

    /// Segment file format error or out-of-order keys
    #[error("Invalid segment format: {0}")]
    InvalidSegment(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Build was cancelled before publication
    #[error("Build cancelled")]
    Cancelled,

    /// Context saw corruption earlier and refuses further queries
    #[error("Locality index must be rebuilt: {0}")]
    RebuildRequired(String),
}

impl StorageError {
    /// True for errors that mean the on-disk artifact can no longer be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption(_))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<tempfile::PersistError> for StorageError {
    fn from(err: tempfile::PersistError) -> Self {
        StorageError::Io(err.error)
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
