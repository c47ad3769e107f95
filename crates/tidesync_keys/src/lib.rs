//! # TideSync Keys
//!
//! Secret storage and device key management.
//!
//! - [`KeyStore`] is the capability a host application supplies to keep
//!   secrets: a platform keychain, the bundled [`FileKeyStore`] or the
//!   volatile [`MemoryKeyStore`].
//! - [`DeviceKeyManager`] layers a device identity on top of a key store:
//!   an Ed25519 key pair with a rotation index, signing and verification,
//!   and trust records for the peers this device has talked to.
//!
//! Private keys never leave the manager.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tidesync_keys::{DeviceKeyManager, KeyManagerConfig, MemoryKeyStore};
//!
//! let manager = DeviceKeyManager::new(Arc::new(MemoryKeyStore::new()), KeyManagerConfig::new("default"));
//! let identity = manager.load_or_create_identity().unwrap();
//! let signature = manager.sign(b"payload").unwrap();
//! assert!(DeviceKeyManager::verify(b"payload", &signature, &identity.public_key));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod manager;
mod store;

pub use error::{KeyError, KeyResult};
pub use file::{FileKeyStore, WrappingKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use manager::{
    handshake_payload, DeviceIdentity, DeviceKeyManager, KeyManagerConfig, PeerTrust, PreviousKey,
    RotationLink, PUBLIC_KEY_SIZE, SIGNATURE_SCHEME,
};
pub use store::{KeyStore, MemoryKeyStore};
