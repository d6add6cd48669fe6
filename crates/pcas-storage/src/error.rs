//! Error types for the storage crate.

use pcas_types::BusError;
use thiserror::Error;

/// Result type alias using the storage error type.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database or filesystem failure.
    #[error("io error: {0}")]
    Io(String),

    /// Missing node or event.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored content could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// ANN index failure.
    #[error("index error: {0}")]
    Index(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<StorageError> for BusError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => BusError::NotFound(msg),
            StorageError::Io(msg) => BusError::Internal(format!("storage: {msg}")),
            StorageError::Serialization(msg) => BusError::Internal(format!("storage: {msg}")),
            StorageError::Index(msg) => BusError::Internal(format!("index: {msg}")),
        }
    }
}
