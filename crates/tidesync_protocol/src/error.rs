//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, encoding or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame did not contain a valid message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A frame exceeds the size limit.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced or actual size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// The peer speaks another protocol version.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },

    /// Signing the handshake failed.
    #[error("signing failed: {0}")]
    Signing(#[from] tidesync_keys::KeyError),
}
