//! Protocol messages.

use serde::{Deserialize, Serialize};
use tidesync_core::ChangeRecord;
use tidesync_keys::{handshake_payload, DeviceKeyManager, RotationLink};
use uuid::Uuid;

use crate::error::{ProtocolError, ProtocolResult};

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Signed handshake.
    Welcome(Welcome),
    /// Asks the peer for its changes after a cursor.
    SyncRequest(SyncRequest),
    /// A run of changes.
    ChangeBatch(ChangeBatch),
    /// Confirms a batch was applied.
    Acknowledge(Acknowledge),
    /// Ends the session.
    Close(Close),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::Welcome(_) => 1,
            SyncMessage::SyncRequest(_) => 2,
            SyncMessage::ChangeBatch(_) => 3,
            SyncMessage::Acknowledge(_) => 4,
            SyncMessage::Close(_) => 5,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Welcome(_) => "welcome",
            SyncMessage::SyncRequest(_) => "sync-request",
            SyncMessage::ChangeBatch(_) => "change-batch",
            SyncMessage::Acknowledge(_) => "acknowledge",
            SyncMessage::Close(_) => "close",
        }
    }
}

/// Handshake payload.
///
/// The signature covers, in order: the decimal rotation index, the scheme
/// identifier, the 16 device id bytes and the key bytes (empty when the
/// message carries no key update).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Sender's protocol version.
    pub protocol_version: u16,
    /// Sender device.
    pub device_id: Uuid,
    /// Whether the sender has unacknowledged local changes.
    pub has_changes: bool,
    /// Sender's key rotation index.
    pub key_index: u32,
    /// Signature scheme identifier.
    pub scheme: String,
    /// Sender's public key, empty unless offered.
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    /// Signature over [`signature_data`](Self::signature_data).
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Endorsements leading from earlier keys to the offered one. Sent
    /// along with the key; not covered by the signature.
    #[serde(default)]
    pub rotation: Vec<RotationLink>,
}

impl Welcome {
    /// Builds and signs a welcome for the manager's current identity.
    ///
    /// With `offer_key` set the current public key and its rotation chain
    /// are included so the peer can learn or rotate it.
    ///
    /// # Errors
    ///
    /// Fails if the manager has no identity loaded.
    pub fn signed(
        manager: &DeviceKeyManager,
        has_changes: bool,
        offer_key: bool,
    ) -> ProtocolResult<Self> {
        let identity = manager
            .identity()
            .ok_or(tidesync_keys::KeyError::IdentityNotLoaded)?;
        let mut welcome = Self {
            protocol_version: PROTOCOL_VERSION,
            device_id: identity.device_id,
            has_changes,
            key_index: identity.key_index,
            scheme: manager.scheme().to_string(),
            key: if offer_key {
                identity.public_key.to_vec()
            } else {
                Vec::new()
            },
            signature: Vec::new(),
            rotation: if offer_key {
                manager.rotation_chain()
            } else {
                Vec::new()
            },
        };
        welcome.signature = manager.sign(&welcome.signature_data())?;
        Ok(welcome)
    }

    /// Whether the message offers a public key.
    pub fn has_key_update(&self) -> bool {
        !self.key.is_empty()
    }

    /// The offered key, if any.
    pub fn offered_key(&self) -> Option<&[u8]> {
        self.has_key_update().then_some(self.key.as_slice())
    }

    /// Bytes covered by the signature.
    pub fn signature_data(&self) -> Vec<u8> {
        handshake_payload(self.key_index, &self.scheme, self.device_id, &self.key)
    }

    /// Rejects a peer speaking another protocol version than `local`.
    pub fn check_version(&self, local: u16) -> ProtocolResult<()> {
        if self.protocol_version == local {
            Ok(())
        } else {
            Err(ProtocolError::VersionMismatch {
                local,
                remote: self.protocol_version,
            })
        }
    }
}

/// Asks the peer to stream its changes after `since`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Identifies the request; batches answering it carry the same id.
    pub request_id: u64,
    /// Last applied sequence number of the peer's stream, `None` for a
    /// full load.
    pub since: Option<u64>,
}

/// A run of changes from the sender's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Id of the request this batch answers.
    pub request_id: u64,
    /// Changes in sequence order.
    pub records: Vec<ChangeRecord>,
    /// Sequence number the receiver's cursor moves to once applied.
    pub last_seq: u64,
    /// Whether the sender has nothing further for this request.
    pub complete: bool,
}

/// Confirms that every change up to `cursor` was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    /// Highest applied sequence number of the receiver's stream.
    pub cursor: u64,
}

/// Ends the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    /// Human readable reason.
    pub reason: String,
    /// Whether the sender rejected our handshake.
    pub authentication: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidesync_keys::{KeyManagerConfig, MemoryKeyStore};

    fn manager() -> DeviceKeyManager {
        let manager =
            DeviceKeyManager::new(Arc::new(MemoryKeyStore::new()), KeyManagerConfig::new("t"));
        manager.load_or_create_identity().unwrap();
        manager
    }

    #[test]
    fn empty_key_has_no_update() {
        let welcome = Welcome::signed(&manager(), false, false).unwrap();
        assert!(welcome.key.is_empty());
        assert!(!welcome.has_key_update());
        assert_eq!(welcome.offered_key(), None);
    }

    #[test]
    fn offered_key_is_current_public_key() {
        let manager = manager();
        let welcome = Welcome::signed(&manager, true, true).unwrap();
        assert!(welcome.has_key_update());
        assert_eq!(welcome.key, manager.identity().unwrap().public_key.to_vec());
    }

    #[test]
    fn signature_data_layout() {
        let device_id = Uuid::from_u128(0x0102);
        let welcome = Welcome {
            protocol_version: PROTOCOL_VERSION,
            device_id,
            has_changes: true,
            key_index: 12,
            scheme: "Ed25519".into(),
            key: vec![0xaa, 0xbb],
            signature: Vec::new(),
            rotation: Vec::new(),
        };
        let mut expected = b"12Ed25519".to_vec();
        expected.extend_from_slice(device_id.as_bytes());
        expected.extend_from_slice(&[0xaa, 0xbb]);
        assert_eq!(welcome.signature_data(), expected);
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let manager = manager();
        let public_key = manager.identity().unwrap().public_key;
        let mut welcome = Welcome::signed(&manager, false, true).unwrap();
        assert!(DeviceKeyManager::verify(
            &welcome.signature_data(),
            &welcome.signature,
            &public_key
        ));

        welcome.key_index += 1;
        assert!(!DeviceKeyManager::verify(
            &welcome.signature_data(),
            &welcome.signature,
            &public_key
        ));
    }

    #[test]
    fn rotation_chain_travels_with_offered_key() {
        let manager = manager();
        manager.rotate_key().unwrap();

        let offered = Welcome::signed(&manager, false, true).unwrap();
        assert_eq!(offered.rotation, manager.rotation_chain());
        assert_eq!(offered.rotation.len(), 1);

        let quiet = Welcome::signed(&manager, false, false).unwrap();
        assert!(quiet.rotation.is_empty());
    }

    #[test]
    fn has_changes_is_not_signed() {
        let manager = manager();
        let a = Welcome::signed(&manager, false, false).unwrap();
        let b = Welcome::signed(&manager, true, false).unwrap();
        assert_eq!(a.signature_data(), b.signature_data());
    }

    #[test]
    fn version_check() {
        let mut welcome = Welcome::signed(&manager(), false, false).unwrap();
        assert!(welcome.check_version(PROTOCOL_VERSION).is_ok());
        welcome.protocol_version = 9;
        assert!(matches!(
            welcome.check_version(PROTOCOL_VERSION),
            Err(ProtocolError::VersionMismatch { remote: 9, .. })
        ));
        assert!(welcome.check_version(9).is_ok());
    }
}
