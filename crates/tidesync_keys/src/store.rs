//! The key store capability and an in-memory implementation.

use crate::error::{KeyError, KeyResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use zeroize::Zeroizing;

/// Pluggable secret storage.
///
/// Implementations wrap a platform keychain, an encrypted file or any
/// other place secrets can live. Keys are slash-separated names.
///
/// Every method may be called from any thread.
pub trait KeyStore: Send + Sync {
    /// Short name of the backend, used in logs.
    fn provider_name(&self) -> &str;

    /// Opens the backing store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is locked, misconfigured or corrupt.
    fn open(&self) -> KeyResult<()>;

    /// Closes the backing store. Further calls require a new `open`.
    fn close(&self) -> KeyResult<()>;

    /// Returns true if a secret is stored under `key`.
    fn contains_secret(&self, key: &str) -> KeyResult<bool>;

    /// Stores `secret` under `key`, replacing any previous value.
    /// Returns false if the backend refused the write.
    fn store_secret(&self, key: &str, secret: &[u8]) -> KeyResult<bool>;

    /// Loads the secret stored under `key`.
    fn load_secret(&self, key: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>>;

    /// Removes the secret under `key`. Returns whether it existed.
    fn remove_secret(&self, key: &str) -> KeyResult<bool>;
}

/// Volatile key store for tests and ephemeral devices.
#[derive(Default)]
pub struct MemoryKeyStore {
    secrets: RwLock<Option<HashMap<String, Zeroizing<Vec<u8>>>>>,
    retained: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_open<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Zeroizing<Vec<u8>>>) -> T,
    ) -> KeyResult<T> {
        let mut guard = self.secrets.write();
        let secrets = guard
            .as_mut()
            .ok_or_else(|| KeyError::unavailable("memory key store is not open"))?;
        Ok(f(secrets))
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore")
            .field("open", &self.secrets.read().is_some())
            .finish_non_exhaustive()
    }
}

impl KeyStore for MemoryKeyStore {
    fn provider_name(&self) -> &str {
        "memory"
    }

    fn open(&self) -> KeyResult<()> {
        let mut guard = self.secrets.write();
        if guard.is_none() {
            *guard = Some(std::mem::take(&mut *self.retained.write()));
        }
        Ok(())
    }

    fn close(&self) -> KeyResult<()> {
        if let Some(secrets) = self.secrets.write().take() {
            *self.retained.write() = secrets;
        }
        Ok(())
    }

    fn contains_secret(&self, key: &str) -> KeyResult<bool> {
        self.with_open(|secrets| secrets.contains_key(key))
    }

    fn store_secret(&self, key: &str, secret: &[u8]) -> KeyResult<bool> {
        self.with_open(|secrets| {
            secrets.insert(key.to_string(), Zeroizing::new(secret.to_vec()));
            true
        })
    }

    fn load_secret(&self, key: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>> {
        self.with_open(|secrets| secrets.get(key).cloned())
    }

    fn remove_secret(&self, key: &str) -> KeyResult<bool> {
        self.with_open(|secrets| secrets.remove(key).is_some())
    }
}
