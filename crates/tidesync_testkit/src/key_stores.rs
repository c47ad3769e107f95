//! Key stores for failure scenarios.

use tidesync_keys::{KeyError, KeyResult, KeyStore};
use zeroize::Zeroizing;

/// A key store whose backend is locked: every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct LockedKeyStore;

impl LockedKeyStore {
    fn locked<T>() -> KeyResult<T> {
        Err(KeyError::unavailable("key store is locked"))
    }
}

impl KeyStore for LockedKeyStore {
    fn provider_name(&self) -> &str {
        "locked"
    }

    fn open(&self) -> KeyResult<()> {
        Self::locked()
    }

    fn close(&self) -> KeyResult<()> {
        Ok(())
    }

    fn contains_secret(&self, _key: &str) -> KeyResult<bool> {
        Self::locked()
    }

    fn store_secret(&self, _key: &str, _secret: &[u8]) -> KeyResult<bool> {
        Self::locked()
    }

    fn load_secret(&self, _key: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>> {
        Self::locked()
    }

    fn remove_secret(&self, _key: &str) -> KeyResult<bool> {
        Self::locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidesync_keys::{DeviceKeyManager, KeyManagerConfig};

    #[test]
    fn manager_fails_fast() {
        let manager = DeviceKeyManager::new(Arc::new(LockedKeyStore), KeyManagerConfig::new("t"));
        assert!(matches!(
            manager.load_or_create_identity(),
            Err(KeyError::KeyStoreUnavailable(_))
        ));
        assert!(manager.identity().is_none());
    }
}
