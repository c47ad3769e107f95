//! Error types for key storage and device key management.

use thiserror::Error;
use uuid::Uuid;

/// Result type for key operations.
pub type KeyResult<T> = Result<T, KeyError>;

/// Errors that can occur while storing keys or verifying peers.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The backing key store cannot be opened or refused a write.
    #[error("key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    /// No identity has been loaded yet.
    #[error("device identity not loaded")]
    IdentityNotLoaded,

    /// A peer's signature or offered key could not be trusted.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A peer presented a rotation index below the one already trusted.
    #[error("key downgrade from device {device}: trusted index {trusted}, offered {offered}")]
    Downgrade {
        /// The peer device.
        device: Uuid,
        /// Index currently trusted for the peer.
        trusted: u32,
        /// Index carried by the rejected message.
        offered: u32,
    },

    /// Encrypting or decrypting key material failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Stored key material has the wrong shape.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Encoding or decoding a stored record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeyError {
    /// Creates a key-store-unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::KeyStoreUnavailable(message.into())
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// Creates an invalid-key error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey(message.into())
    }

    /// Returns true if the error means a peer must not be trusted.
    pub fn is_authentication(&self) -> bool {
        matches!(self, KeyError::Authentication(_) | KeyError::Downgrade { .. })
    }
}
