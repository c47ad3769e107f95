//! Device identity, signing keys and peer trust.

use crate::error::{KeyError, KeyResult};
use crate::store::KeyStore;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Identifier of the signature scheme carried in handshakes.
pub const SIGNATURE_SCHEME: &str = "Ed25519";

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Configuration for a [`DeviceKeyManager`].
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// Prefix of every secret name, usually the setup name.
    pub namespace: String,
    /// How long a replaced key is still accepted.
    pub grace_period: Duration,
    /// Device id to use when a fresh identity is created.
    pub device_id: Option<Uuid>,
}

impl KeyManagerConfig {
    /// Creates a configuration for `namespace` with a one day grace period.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            grace_period: Duration::from_secs(24 * 60 * 60),
            device_id: None,
        }
    }

    /// Sets the grace period for replaced keys.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets the device id used for a freshly created identity.
    pub fn with_device_id(mut self, device_id: Uuid) -> Self {
        self.device_id = Some(device_id);
        self
    }
}

/// Public half of the device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable device identifier.
    pub device_id: Uuid,
    /// Current Ed25519 public key.
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Rotation index of the current key pair.
    pub key_index: u32,
}

/// A replaced public key that is still accepted until `expires_at_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousKey {
    /// The replaced public key.
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Milliseconds since the epoch after which the key is rejected.
    pub expires_at_ms: u64,
}

impl PreviousKey {
    fn is_valid(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Proof that the key at `key_index` was issued by the holder of the key
/// at `key_index - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationLink {
    /// Rotation index of the endorsed key.
    pub key_index: u32,
    /// The endorsed public key.
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Signature by the previous key over the handshake payload of the
    /// endorsed key.
    #[serde(with = "serde_bytes")]
    pub endorsement: Vec<u8>,
}

/// Bytes covered by a handshake signature: the decimal rotation index,
/// the scheme identifier, the 16 device id bytes and the key bytes.
pub fn handshake_payload(key_index: u32, scheme: &str, device_id: Uuid, key: &[u8]) -> Vec<u8> {
    let index = key_index.to_string();
    let mut data = Vec::with_capacity(index.len() + scheme.len() + 16 + key.len());
    data.extend_from_slice(index.as_bytes());
    data.extend_from_slice(scheme.as_bytes());
    data.extend_from_slice(device_id.as_bytes());
    data.extend_from_slice(key);
    data
}

/// What this device trusts about a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTrust {
    /// The peer device.
    pub device_id: Uuid,
    /// Highest rotation index accepted from the peer.
    pub key_index: u32,
    /// Public key for `key_index`.
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// The peer's previous key, accepted during the grace window.
    pub previous: Option<PreviousKey>,
}

struct KeyState {
    device_id: Uuid,
    signing: SigningKey,
    key_index: u32,
    previous: Option<PreviousKey>,
    rotations: Vec<RotationLink>,
}

impl KeyState {
    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id,
            public_key: self.signing.verifying_key().to_bytes(),
            key_index: self.key_index,
        }
    }
}

/// Owns the device's private key and the trust records of its peers.
///
/// Private key bytes never leave the manager; callers get signatures and
/// verification results.
pub struct DeviceKeyManager {
    store: Arc<dyn KeyStore>,
    config: KeyManagerConfig,
    state: RwLock<Option<KeyState>>,
}

impl DeviceKeyManager {
    /// Creates a manager. No key material is touched until
    /// [`load_or_create_identity`](Self::load_or_create_identity).
    pub fn new(store: Arc<dyn KeyStore>, config: KeyManagerConfig) -> Self {
        Self {
            store,
            config,
            state: RwLock::new(None),
        }
    }

    /// The signature scheme identifier.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        SIGNATURE_SCHEME
    }

    fn secret_name(&self, name: &str) -> String {
        format!("{}/{}", self.config.namespace, name)
    }

    fn peer_secret_name(&self, device: Uuid) -> String {
        format!("{}/peer/{}", self.config.namespace, device)
    }

    fn load(&self, name: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>> {
        self.store.load_secret(&self.secret_name(name))
    }

    fn save(&self, name: &str, bytes: &[u8]) -> KeyResult<()> {
        let full = self.secret_name(name);
        if self.store.store_secret(&full, bytes)? {
            Ok(())
        } else {
            Err(KeyError::unavailable(format!(
                "{} key store refused to store {full}",
                self.store.provider_name()
            )))
        }
    }

    /// Returns the device identity, generating and persisting a key pair
    /// when none exists yet.
    ///
    /// # Errors
    ///
    /// Fails with [`KeyError::KeyStoreUnavailable`] if the key store cannot
    /// be opened or refuses to persist the new key.
    pub fn load_or_create_identity(&self) -> KeyResult<DeviceIdentity> {
        if let Some(state) = self.state.read().as_ref() {
            return Ok(state.identity());
        }

        self.store.open().map_err(|err| {
            KeyError::unavailable(format!("{} key store: {err}", self.store.provider_name()))
        })?;

        let mut guard = self.state.write();
        if let Some(state) = guard.as_ref() {
            return Ok(state.identity());
        }

        let state = match (self.load("device-id")?, self.load("signing-key")?) {
            (Some(device), Some(seed)) => {
                let device_id = Uuid::from_slice(&device)
                    .map_err(|_| KeyError::invalid_key("stored device id is not a UUID"))?;
                let signing = signing_key_from(&seed)?;
                let key_index = match self.load("key-index")? {
                    Some(bytes) => decode_index(&bytes)?,
                    None => 0,
                };
                let previous = match self.load("previous-key")? {
                    Some(bytes) => Some(decode_cbor::<PreviousKey>(&bytes)?),
                    None => None,
                };
                let rotations = match self.load("rotations")? {
                    Some(bytes) => decode_cbor::<Vec<RotationLink>>(&bytes)?,
                    None => Vec::new(),
                };
                tracing::debug!(namespace = %self.config.namespace, device = %device_id, key_index, "loaded device identity");
                KeyState {
                    device_id,
                    signing,
                    key_index,
                    previous,
                    rotations,
                }
            }
            _ => {
                let state = KeyState {
                    device_id: self.config.device_id.unwrap_or_else(Uuid::new_v4),
                    signing: generate_signing_key(),
                    key_index: 0,
                    previous: None,
                    rotations: Vec::new(),
                };
                self.save("device-id", state.device_id.as_bytes())?;
                let seed = Zeroizing::new(state.signing.to_bytes());
                self.save("signing-key", seed.as_slice())?;
                self.save("key-index", &state.key_index.to_be_bytes())?;
                tracing::info!(namespace = %self.config.namespace, device = %state.device_id, "created device identity");
                state
            }
        };

        let identity = state.identity();
        *guard = Some(state);
        Ok(identity)
    }

    /// The loaded identity, if any.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.state.read().as_ref().map(KeyState::identity)
    }

    /// Signs `payload` with the current private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::IdentityNotLoaded`] before the identity is loaded.
    pub fn sign(&self, payload: &[u8]) -> KeyResult<Vec<u8>> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or(KeyError::IdentityNotLoaded)?;
        Ok(state.signing.sign(payload).to_bytes().to_vec())
    }

    /// Verifies `signature` over `payload` against `public_key`.
    ///
    /// Malformed keys or signatures verify as false.
    pub fn verify(payload: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; PUBLIC_KEY_SIZE]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(payload, &signature).is_ok()
    }

    /// Replaces the key pair and increments the rotation index.
    ///
    /// The old public key stays recognized for the grace period, and the
    /// old private key signs a [`RotationLink`] for the new one so peers
    /// can follow the rotation.
    pub fn rotate_key(&self) -> KeyResult<DeviceIdentity> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(KeyError::IdentityNotLoaded)?;

        let previous = PreviousKey {
            public_key: state.signing.verifying_key().to_bytes(),
            expires_at_ms: now_ms().saturating_add(self.config.grace_period.as_millis() as u64),
        };
        let signing = generate_signing_key();
        let key_index = state
            .key_index
            .checked_add(1)
            .ok_or_else(|| KeyError::invalid_key("rotation index exhausted"))?;

        let public_key = signing.verifying_key().to_bytes();
        let endorsement = state
            .signing
            .sign(&handshake_payload(key_index, SIGNATURE_SCHEME, state.device_id, &public_key))
            .to_bytes()
            .to_vec();
        let mut rotations = state.rotations.clone();
        rotations.push(RotationLink {
            key_index,
            public_key,
            endorsement,
        });

        self.save("rotations", &encode_cbor(&rotations)?)?;
        self.save("previous-key", &encode_cbor(&previous)?)?;
        let seed = Zeroizing::new(signing.to_bytes());
        self.save("signing-key", seed.as_slice())?;
        self.save("key-index", &key_index.to_be_bytes())?;

        state.signing = signing;
        state.key_index = key_index;
        state.previous = Some(previous);
        state.rotations = rotations;
        tracing::info!(namespace = %self.config.namespace, device = %state.device_id, key_index, "rotated device key");
        Ok(state.identity())
    }

    /// Endorsements of every key this device has rotated to, oldest first.
    pub fn rotation_chain(&self) -> Vec<RotationLink> {
        self.state
            .read()
            .as_ref()
            .map(|state| state.rotations.clone())
            .unwrap_or_default()
    }

    /// Returns true if `public_key` is the current key or the previous key
    /// inside its grace window.
    pub fn recognizes_own_key(&self, public_key: &[u8]) -> bool {
        let guard = self.state.read();
        let Some(state) = guard.as_ref() else {
            return false;
        };
        if state.signing.verifying_key().as_bytes().as_slice() == public_key {
            return true;
        }
        state
            .previous
            .is_some_and(|prev| prev.public_key.as_slice() == public_key && prev.is_valid(now_ms()))
    }

    /// The trust record for `device`, if the peer is known.
    pub fn peer_trust(&self, device: Uuid) -> KeyResult<Option<PeerTrust>> {
        match self.store.load_secret(&self.peer_secret_name(device))? {
            Some(bytes) => Ok(Some(decode_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_peer(&self, trust: &PeerTrust) -> KeyResult<()> {
        let name = format!("peer/{}", trust.device_id);
        self.save(&name, &encode_cbor(trust)?)
    }

    /// Verifies a handshake from `device` and updates its trust record.
    ///
    /// - unknown device: the offered key is trusted once it verifies
    /// - lower rotation index than trusted: rejected as a downgrade
    /// - same index: must verify against the trusted (or grace) key; a
    ///   different offered key is rejected
    /// - higher index: `rotation` must link the trusted key to the offered
    ///   key one index at a time, and the offered key must verify; it then
    ///   becomes trusted and the old key enters its grace window
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Authentication`] or [`KeyError::Downgrade`] when
    /// the handshake must not be trusted.
    pub fn accept_welcome(
        &self,
        device: Uuid,
        key_index: u32,
        offered_key: Option<&[u8]>,
        rotation: &[RotationLink],
        signature_data: &[u8],
        signature: &[u8],
    ) -> KeyResult<PeerTrust> {
        let Some(mut trust) = self.peer_trust(device)? else {
            let key = offered_key.ok_or_else(|| {
                KeyError::authentication(format!("unknown device {device} offered no key"))
            })?;
            let public_key = public_key_from(key)?;
            if !Self::verify(signature_data, signature, &public_key) {
                return Err(KeyError::authentication(format!(
                    "signature of new device {device} does not verify"
                )));
            }
            let trust = PeerTrust {
                device_id: device,
                key_index,
                public_key,
                previous: None,
            };
            self.save_peer(&trust)?;
            tracing::info!(peer = %device, key_index, "trusted new peer key");
            return Ok(trust);
        };

        if key_index < trust.key_index {
            return Err(KeyError::Downgrade {
                device,
                trusted: trust.key_index,
                offered: key_index,
            });
        }

        if key_index == trust.key_index {
            if offered_key.is_some_and(|key| key != trust.public_key.as_slice()) {
                return Err(KeyError::authentication(format!(
                    "device {device} offered a different key for index {key_index}"
                )));
            }
            if !self.verify_with_trust(&trust, signature_data, signature) {
                return Err(KeyError::authentication(format!(
                    "signature of device {device} does not verify"
                )));
            }
            return Ok(trust);
        }

        let key = offered_key.ok_or_else(|| {
            KeyError::authentication(format!(
                "device {device} rotated to index {key_index} without a key"
            ))
        })?;
        let public_key = public_key_from(key)?;
        verify_rotation(&trust, key_index, &public_key, rotation)?;
        if !Self::verify(signature_data, signature, &public_key) {
            return Err(KeyError::authentication(format!(
                "rotated key of device {device} does not verify"
            )));
        }
        trust.previous = Some(PreviousKey {
            public_key: trust.public_key,
            expires_at_ms: now_ms().saturating_add(self.config.grace_period.as_millis() as u64),
        });
        trust.public_key = public_key;
        trust.key_index = key_index;
        self.save_peer(&trust)?;
        tracing::info!(peer = %device, key_index, "accepted peer key rotation");
        Ok(trust)
    }

    fn verify_with_trust(&self, trust: &PeerTrust, payload: &[u8], signature: &[u8]) -> bool {
        if Self::verify(payload, signature, &trust.public_key) {
            return true;
        }
        trust.previous.is_some_and(|prev| {
            prev.is_valid(now_ms()) && Self::verify(payload, signature, &prev.public_key)
        })
    }

    /// Drops all trust material for `device`. The next handshake from it
    /// is treated as first contact.
    pub fn forget_peer(&self, device: Uuid) -> KeyResult<bool> {
        let removed = self.store.remove_secret(&self.peer_secret_name(device))?;
        if removed {
            tracing::warn!(peer = %device, "forgot peer trust");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for DeviceKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyManager")
            .field("namespace", &self.config.namespace)
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// Walks `chain` from the trusted key up to `key_index`.
fn verify_rotation(
    trust: &PeerTrust,
    key_index: u32,
    public_key: &[u8; PUBLIC_KEY_SIZE],
    chain: &[RotationLink],
) -> KeyResult<()> {
    let device = trust.device_id;
    let mut anchor = trust.public_key;
    let mut index = trust.key_index;
    for link in chain.iter().filter(|link| link.key_index > trust.key_index) {
        if index.checked_add(1) != Some(link.key_index) {
            return Err(KeyError::authentication(format!(
                "rotation chain of device {device} jumps from {index} to {}",
                link.key_index
            )));
        }
        let payload = handshake_payload(link.key_index, SIGNATURE_SCHEME, device, &link.public_key);
        if !DeviceKeyManager::verify(&payload, &link.endorsement, &anchor) {
            return Err(KeyError::authentication(format!(
                "key {} of device {device} is not endorsed by key {index}",
                link.key_index
            )));
        }
        anchor = link.public_key;
        index = link.key_index;
        if index == key_index {
            break;
        }
    }
    if index != key_index || anchor != *public_key {
        return Err(KeyError::authentication(format!(
            "device {device} rotated to index {key_index} without proof from key {}",
            trust.key_index
        )));
    }
    Ok(())
}

fn generate_signing_key() -> SigningKey {
    let mut seed = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut seed[..]);
    SigningKey::from_bytes(&seed)
}

fn signing_key_from(bytes: &[u8]) -> KeyResult<SigningKey> {
    let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
        bytes
            .try_into()
            .map_err(|_| KeyError::invalid_key("signing key must be 32 bytes"))?,
    );
    Ok(SigningKey::from_bytes(&seed))
}

fn public_key_from(bytes: &[u8]) -> KeyResult<[u8; PUBLIC_KEY_SIZE]> {
    bytes
        .try_into()
        .map_err(|_| KeyError::invalid_key(format!("public key must be {PUBLIC_KEY_SIZE} bytes")))
}

fn decode_index(bytes: &[u8]) -> KeyResult<u32> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| KeyError::invalid_key("key index must be 4 bytes"))?;
    Ok(u32::from_be_bytes(bytes))
}

fn encode_cbor<T: Serialize>(value: &T) -> KeyResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| KeyError::Serialization(e.to_string()))?;
    Ok(out)
}

fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> KeyResult<T> {
    ciborium::from_reader(bytes).map_err(|e| KeyError::Serialization(e.to_string()))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyStore;

    fn manager(store: Arc<dyn KeyStore>) -> DeviceKeyManager {
        let manager = DeviceKeyManager::new(store, KeyManagerConfig::new("default"));
        manager.load_or_create_identity().unwrap();
        manager
    }

    fn welcome(from: &DeviceKeyManager) -> (DeviceIdentity, Vec<u8>, Vec<u8>) {
        let identity = from.identity().unwrap();
        let data = handshake_payload(
            identity.key_index,
            SIGNATURE_SCHEME,
            identity.device_id,
            &identity.public_key,
        );
        let signature = from.sign(&data).unwrap();
        (identity, data, signature)
    }

    #[test]
    fn identity_is_stable_across_managers() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let first = manager(store.clone()).identity().unwrap();
        let second = manager(store).identity().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.key_index, 0);
    }

    #[test]
    fn configured_device_id_is_used() {
        let id = Uuid::new_v4();
        let manager = DeviceKeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            KeyManagerConfig::new("x").with_device_id(id),
        );
        assert_eq!(manager.load_or_create_identity().unwrap().device_id, id);
    }

    #[test]
    fn sign_verify_with_own_key_only() {
        let a = manager(Arc::new(MemoryKeyStore::new()));
        let b = manager(Arc::new(MemoryKeyStore::new()));
        let msg = b"hello";
        let sig = a.sign(msg).unwrap();
        assert!(DeviceKeyManager::verify(msg, &sig, &a.identity().unwrap().public_key));
        assert!(!DeviceKeyManager::verify(msg, &sig, &b.identity().unwrap().public_key));
        assert!(!DeviceKeyManager::verify(b"other", &sig, &a.identity().unwrap().public_key));
        assert!(!DeviceKeyManager::verify(msg, b"short", &a.identity().unwrap().public_key));
    }

    #[test]
    fn sign_requires_identity() {
        let manager = DeviceKeyManager::new(Arc::new(MemoryKeyStore::new()), KeyManagerConfig::new("x"));
        assert!(matches!(manager.sign(b"x"), Err(KeyError::IdentityNotLoaded)));
    }

    #[test]
    fn rotation_keeps_previous_key_in_grace() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let manager = manager(store.clone());
        let before = manager.identity().unwrap();
        let after = manager.rotate_key().unwrap();

        assert_eq!(after.key_index, 1);
        assert_ne!(after.public_key, before.public_key);
        assert!(manager.recognizes_own_key(&before.public_key));
        assert!(manager.recognizes_own_key(&after.public_key));

        let reloaded = DeviceKeyManager::new(store, KeyManagerConfig::new("default"));
        assert_eq!(reloaded.load_or_create_identity().unwrap(), after);
        assert!(reloaded.recognizes_own_key(&before.public_key));
    }

    #[test]
    fn previous_key_expires() {
        let manager = DeviceKeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            KeyManagerConfig::new("x").with_grace_period(Duration::ZERO),
        );
        let before = manager.load_or_create_identity().unwrap();
        manager.rotate_key().unwrap();
        assert!(!manager.recognizes_own_key(&before.public_key));
    }

    #[test]
    fn first_contact_trusts_offered_key() {
        let a = manager(Arc::new(MemoryKeyStore::new()));
        let b = manager(Arc::new(MemoryKeyStore::new()));
        let (id, data, sig) = welcome(&a);

        let trust = b
            .accept_welcome(id.device_id, id.key_index, Some(id.public_key.as_slice()), &[], &data, &sig)
            .unwrap();
        assert_eq!(trust.public_key, id.public_key);
        assert_eq!(b.peer_trust(id.device_id).unwrap(), Some(trust));
    }

    #[test]
    fn first_contact_without_key_is_rejected() {
        let a = manager(Arc::new(MemoryKeyStore::new()));
        let b = manager(Arc::new(MemoryKeyStore::new()));
        let (id, data, sig) = welcome(&a);
        let err = b
            .accept_welcome(id.device_id, id.key_index, None, &[], &data, &sig)
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn forged_signature_is_rejected() {
        let a = manager(Arc::new(MemoryKeyStore::new()));
        let mallory = manager(Arc::new(MemoryKeyStore::new()));
        let b = manager(Arc::new(MemoryKeyStore::new()));
        let (id, data, _) = welcome(&a);
        b.accept_welcome(id.device_id, 0, Some(id.public_key.as_slice()), &[], &data, &a.sign(&data).unwrap())
            .unwrap();

        let forged = mallory.sign(&data).unwrap();
        let err = b
            .accept_welcome(id.device_id, 0, None, &[], &data, &forged)
            .unwrap_err();
        assert!(matches!(err, KeyError::Authentication(_)));
    }

    #[test]
    fn rotation_is_accepted_and_downgrade_rejected() {
        let a = manager(Arc::new(MemoryKeyStore::new()));
        let b = manager(Arc::new(MemoryKeyStore::new()));

        let (old, old_data, old_sig) = welcome(&a);
        b.accept_welcome(old.device_id, 0, Some(old.public_key.as_slice()), &[], &old_data, &old_sig)
            .unwrap();

        a.rotate_key().unwrap();
        let (new, new_data, new_sig) = welcome(&a);
        let trust = b
            .accept_welcome(
                new.device_id,
                1,
                Some(new.public_key.as_slice()),
                &a.rotation_chain(),
                &new_data,
                &new_sig,
            )
            .unwrap();
        assert_eq!(trust.key_index, 1);
        assert_eq!(trust.previous.unwrap().public_key, old.public_key);

        let err = b
            .accept_welcome(old.device_id, 0, Some(old.public_key.as_slice()), &[], &old_data, &old_sig)
            .unwrap_err();
        assert!(matches!(
            err,
            KeyError::Downgrade {
                trusted: 1,
                offered: 0,
                ..
            }
        ));
    }

    #[test]
    fn rotation_without_endorsement_is_rejected() {
        let a = manager(Arc::new(MemoryKeyStore::new()));
        let b = manager(Arc::new(MemoryKeyStore::new()));
        let mallory = manager(Arc::new(MemoryKeyStore::new()));
        let (id, data, sig) = welcome(&a);
        b.accept_welcome(id.device_id, 0, Some(id.public_key.as_slice()), &[], &data, &sig)
            .unwrap();

        // Mallory claims the next index of a's device with her own key.
        let key = mallory.identity().unwrap().public_key;
        let claim = handshake_payload(1, SIGNATURE_SCHEME, id.device_id, &key);
        let claim_sig = mallory.sign(&claim).unwrap();
        let err = b
            .accept_welcome(id.device_id, 1, Some(key.as_slice()), &[], &claim, &claim_sig)
            .unwrap_err();
        assert!(err.is_authentication());

        // A chain she signed herself does not help either.
        let forged = [RotationLink {
            key_index: 1,
            public_key: key,
            endorsement: mallory.sign(&claim).unwrap(),
        }];
        let err = b
            .accept_welcome(id.device_id, 1, Some(key.as_slice()), &forged, &claim, &claim_sig)
            .unwrap_err();
        assert!(err.is_authentication());

        // Trust is unchanged and a's own welcome still verifies.
        assert_eq!(b.peer_trust(id.device_id).unwrap().unwrap().public_key, id.public_key);
        b.accept_welcome(id.device_id, 0, None, &[], &data, &sig).unwrap();
    }

    #[test]
    fn rotation_chain_spans_several_indices() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let a = manager(store.clone());
        let b = manager(Arc::new(MemoryKeyStore::new()));
        let (id, data, sig) = welcome(&a);
        b.accept_welcome(id.device_id, 0, Some(id.public_key.as_slice()), &[], &data, &sig)
            .unwrap();

        a.rotate_key().unwrap();
        a.rotate_key().unwrap();
        let chain = manager(store).rotation_chain();
        assert_eq!(chain.len(), 2);

        let (new, new_data, new_sig) = welcome(&a);
        let trust = b
            .accept_welcome(new.device_id, 2, Some(new.public_key.as_slice()), &chain, &new_data, &new_sig)
            .unwrap();
        assert_eq!(trust.key_index, 2);

        // A chain missing its first hop does not reach the trusted key.
        let c = manager(Arc::new(MemoryKeyStore::new()));
        c.accept_welcome(id.device_id, 0, Some(id.public_key.as_slice()), &[], &data, &sig)
            .unwrap();
        let err = c
            .accept_welcome(new.device_id, 2, Some(new.public_key.as_slice()), &chain[1..], &new_data, &new_sig)
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn different_key_at_same_index_is_rejected() {
        let a = manager(Arc::new(MemoryKeyStore::new()));
        let b = manager(Arc::new(MemoryKeyStore::new()));
        let imposter = manager(Arc::new(MemoryKeyStore::new()));
        let (id, data, sig) = welcome(&a);
        b.accept_welcome(id.device_id, 0, Some(id.public_key.as_slice()), &[], &data, &sig)
            .unwrap();

        let other_key = imposter.identity().unwrap().public_key;
        let err = b
            .accept_welcome(id.device_id, 0, Some(other_key.as_slice()), &[], &data, &imposter.sign(&data).unwrap())
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn forget_peer_resets_trust() {
        let a = manager(Arc::new(MemoryKeyStore::new()));
        let b = manager(Arc::new(MemoryKeyStore::new()));
        let (id, data, sig) = welcome(&a);
        b.accept_welcome(id.device_id, 0, Some(id.public_key.as_slice()), &[], &data, &sig)
            .unwrap();
        assert!(b.forget_peer(id.device_id).unwrap());
        assert!(b.peer_trust(id.device_id).unwrap().is_none());
        assert!(!b.forget_peer(id.device_id).unwrap());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn signatures_verify_only_their_payload(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
            flip in proptest::prelude::any::<proptest::sample::Index>(),
        ) {
            let a = manager(Arc::new(MemoryKeyStore::new()));
            let key = a.identity().unwrap().public_key;
            let signature = a.sign(&payload).unwrap();
            proptest::prop_assert!(DeviceKeyManager::verify(&payload, &signature, &key));

            let mut tampered = payload.clone();
            if tampered.is_empty() {
                tampered.push(0);
            } else {
                let i = flip.index(tampered.len());
                tampered[i] ^= 0x01;
            }
            proptest::prop_assert!(!DeviceKeyManager::verify(&tampered, &signature, &key));
        }
    }
}
