//! Error types for the sync engine.

use thiserror::Error;
use tidesync_core::CoreError;
use tidesync_keys::KeyError;
use tidesync_protocol::ProtocolError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The peer's handshake could not be trusted, or the peer rejected ours.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Malformed or out-of-sequence message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store error.
    #[error("store error: {0}")]
    Core(#[from] CoreError),

    /// Key management error.
    #[error("key error: {0}")]
    Keys(#[from] KeyError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Applying a change batch kept failing transiently.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Attempts made, the first one included.
        attempts: u32,
        /// The last failure.
        source: CoreError,
    },

    /// No session, or the engine task has stopped.
    #[error("not connected")]
    NotConnected,

    /// The request was dropped before it completed.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Core(err) => err.is_transient(),
            SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if this error puts the session into the error state
    /// until an explicit resync. Other store and key store failures only
    /// end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Authentication(_)
                | SyncError::Protocol(_)
                | SyncError::RetriesExhausted { .. }
        )
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Signing(err) => SyncError::Keys(err),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}
