//! Error types for TideSync core.

use crate::types::ObjectKey;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in local store and broker operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A setup is missing, registered twice or still in use.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tidesync_storage::StorageError),

    /// Encoding or decoding an object failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The object does not exist or is deleted.
    #[error("object not found: {0}")]
    NotFound(ObjectKey),

    /// The conflict resolver returned an unusable result.
    #[error("conflict policy error: {0}")]
    ConflictPolicy(String),

    /// The setup's worker pool is stopped or dropped a request.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Creates a conflict policy error.
    pub fn conflict_policy(message: impl Into<String>) -> Self {
        Self::ConflictPolicy(message.into())
    }

    /// Creates a worker-unavailable error.
    pub fn worker_unavailable(message: impl Into<String>) -> Self {
        Self::WorkerUnavailable(message.into())
    }

    /// Returns true if repeating the operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Storage(err) => err.is_transient(),
            CoreError::Io(err) => err.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}
