//! Encrypted single-file key store.
//!
//! File layout:
//!
//! ```text
//! magic "TSKS" | version u8 | salt (16) | nonce (12) | ciphertext || tag
//! ```
//!
//! The plaintext is a CBOR map from secret name to bytes. The wrapping key
//! is derived from the passphrase with HKDF-SHA256 over the stored salt.
//! Every save writes a fresh nonce to a temporary file and renames it over
//! the original while holding an exclusive lock on a sibling lock file.

use crate::error::{KeyError, KeyResult};
use crate::store::KeyStore;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use fs2::FileExt;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
const SALT_SIZE: usize = 16;
const MAGIC: &[u8; 4] = b"TSKS";
const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = MAGIC.len() + 1 + SALT_SIZE;

/// Wrapping key for the key store file.
///
/// Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    /// Derives a wrapping key from a passphrase using HKDF-SHA256.
    ///
    /// HKDF does not stretch low-entropy input; the passphrase should be
    /// random (for example generated and held by the platform keychain).
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn derive(passphrase: &[u8], salt: &[u8]) -> KeyResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"tidesync-keystore-v1", &mut bytes)
            .map_err(|_| KeyError::Encryption("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

type SecretMap = BTreeMap<String, Zeroizing<Vec<u8>>>;

struct OpenState {
    salt: [u8; SALT_SIZE],
    key: WrappingKey,
    secrets: SecretMap,
}

/// Key store persisted to one AES-256-GCM encrypted file.
pub struct FileKeyStore {
    path: PathBuf,
    passphrase: Zeroizing<Vec<u8>>,
    state: Mutex<Option<OpenState>>,
}

impl FileKeyStore {
    /// Creates a store for `path`. Nothing is read until [`KeyStore::open`].
    pub fn new(path: impl Into<PathBuf>, passphrase: impl AsRef<[u8]>) -> Self {
        Self {
            path: path.into(),
            passphrase: Zeroizing::new(passphrase.as_ref().to_vec()),
            state: Mutex::new(None),
        }
    }

    /// Path of the encrypted file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn read_file(&self) -> KeyResult<OpenState> {
        let data = fs::read(&self.path)?;
        if data.len() < HEADER_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(KeyError::Encryption("key store file too short".into()));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(KeyError::Encryption("invalid key store header".into()));
        }
        if data[MAGIC.len()] != FORMAT_VERSION {
            return Err(KeyError::Encryption(format!(
                "unsupported key store version {}",
                data[MAGIC.len()]
            )));
        }
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&data[MAGIC.len() + 1..HEADER_SIZE]);
        let key = WrappingKey::derive(&self.passphrase, &salt)?;

        let body = &data[HEADER_SIZE..];
        let nonce = Nonce::from_slice(&body[..NONCE_SIZE]);
        let plaintext = Zeroizing::new(
            key.cipher()
                .decrypt(nonce, &body[NONCE_SIZE..])
                .map_err(|_| KeyError::Encryption("wrong passphrase or corrupted key store".into()))?,
        );
        let encoded: BTreeMap<String, Vec<u8>> = ciborium::from_reader(plaintext.as_slice())
            .map_err(|e| KeyError::Serialization(e.to_string()))?;
        let secrets = encoded
            .into_iter()
            .map(|(name, bytes)| (name, Zeroizing::new(bytes)))
            .collect();
        Ok(OpenState { salt, key, secrets })
    }

    fn write_file(&self, state: &OpenState) -> KeyResult<()> {
        let encoded: BTreeMap<&str, &[u8]> = state
            .secrets
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
            .collect();
        let mut plaintext = Zeroizing::new(Vec::new());
        ciborium::into_writer(&encoded, &mut *plaintext)
            .map_err(|e| KeyError::Serialization(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = state
            .key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| KeyError::Encryption("encryption error".into()))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&state.salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        lock.lock_exclusive()?;
        let tmp = self.path.with_extension("tmp");
        let result = (|| -> KeyResult<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&out)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        FileExt::unlock(&lock)?;
        result
    }

    fn with_open<T>(&self, f: impl FnOnce(&mut OpenState) -> KeyResult<T>) -> KeyResult<T> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| KeyError::unavailable(format!("{} is not open", self.path.display())))?;
        f(state)
    }
}

impl std::fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("path", &self.path)
            .field("open", &self.state.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl KeyStore for FileKeyStore {
    fn provider_name(&self) -> &str {
        "file"
    }

    fn open(&self) -> KeyResult<()> {
        let mut guard = self.state.lock();
        if guard.is_some() {
            return Ok(());
        }
        let state = if self.path.exists() {
            self.read_file()?
        } else {
            let mut salt = [0u8; SALT_SIZE];
            rand::thread_rng().fill_bytes(&mut salt);
            let key = WrappingKey::derive(&self.passphrase, &salt)?;
            OpenState {
                salt,
                key,
                secrets: SecretMap::new(),
            }
        };
        tracing::debug!(path = %self.path.display(), secrets = state.secrets.len(), "opened key store");
        *guard = Some(state);
        Ok(())
    }

    fn close(&self) -> KeyResult<()> {
        self.state.lock().take();
        Ok(())
    }

    fn contains_secret(&self, key: &str) -> KeyResult<bool> {
        self.with_open(|state| Ok(state.secrets.contains_key(key)))
    }

    fn store_secret(&self, key: &str, secret: &[u8]) -> KeyResult<bool> {
        self.with_open(|state| {
            let previous = state
                .secrets
                .insert(key.to_string(), Zeroizing::new(secret.to_vec()));
            if let Err(err) = self.write_file(state) {
                match previous {
                    Some(value) => state.secrets.insert(key.to_string(), value),
                    None => state.secrets.remove(key),
                };
                return Err(err);
            }
            Ok(true)
        })
    }

    fn load_secret(&self, key: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>> {
        self.with_open(|state| Ok(state.secrets.get(key).cloned()))
    }

    fn remove_secret(&self, key: &str) -> KeyResult<bool> {
        self.with_open(|state| {
            let Some(previous) = state.secrets.remove(key) else {
                return Ok(false);
            };
            if let Err(err) = self.write_file(state) {
                state.secrets.insert(key.to_string(), previous);
                return Err(err);
            }
            Ok(true)
        })
    }
}
