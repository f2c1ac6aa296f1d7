//! Error types for the row store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TableError>;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Not enough disk space in {path}: {available_mb} MB available, {required_mb} MB required")]
    InsufficientDiskSpace {
        path: String,
        available_mb: u64,
        required_mb: u64,
    },

    #[error("Duplicate row key \"{key}\"")]
    DuplicateKey { key: String },

    #[error("Row does not fit table spec: {0}")]
    SchemaMismatch(String),

    /// Blob references a buffer that is no longer registered anywhere.
    #[error("Unable to resolve blob: no table registered for buffer {buffer_id}")]
    BlobOwnerMissing { buffer_id: i32 },

    #[error("Ingestion worker failed: {0}")]
    IngestionFailed(String),

    #[error("Cache contract violated: {0}")]
    CacheContract(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Buffer {0} is already closed")]
    BufferClosed(i32),

    #[error("Buffer {0} has been cleared")]
    BufferCleared(i32),

    #[error("Buffer {0} is not closed yet")]
    NotClosed(i32),
}

impl TableError {
    /// Stable error code for callers that branch on error kind.
    pub fn code(&self) -> &'static str {
        match self {
            TableError::Io(_) | TableError::BlobOwnerMissing { .. } => "IO_ERROR",
            TableError::InsufficientDiskSpace { .. } => "INSUFFICIENT_DISK_SPACE",
            TableError::DuplicateKey { .. } => "DUPLICATE_KEY",
            TableError::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            TableError::IngestionFailed(_) => "INGESTION_FAILED",
            TableError::CacheContract(_) => "CACHE_CONTRACT",
            TableError::Canceled => "CANCELED",
            TableError::BufferClosed(_) | TableError::BufferCleared(_) | TableError::NotClosed(_) => {
                "INVALID_STATE"
            }
            _ => "INTERNAL_ERROR",
        }
    }

    /// Re-raisable copy of a captured worker failure.
    ///
    /// Errors that carry non-cloneable sources are flattened into
    /// `IngestionFailed` with the original message.
    pub(crate) fn duplicate(&self) -> TableError {
        match self {
            TableError::DuplicateKey { key } => TableError::DuplicateKey { key: key.clone() },
            TableError::SchemaMismatch(msg) => TableError::SchemaMismatch(msg.clone()),
            TableError::InsufficientDiskSpace {
                path,
                available_mb,
                required_mb,
            } => TableError::InsufficientDiskSpace {
                path: path.clone(),
                available_mb: *available_mb,
                required_mb: *required_mb,
            },
            TableError::BlobOwnerMissing { buffer_id } => TableError::BlobOwnerMissing {
                buffer_id: *buffer_id,
            },
            TableError::Canceled => TableError::Canceled,
            other => TableError::IngestionFailed(other.to_string()),
        }
    }
}
