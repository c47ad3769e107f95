//! Identity command implementation.

use super::{open_existing, CommandError};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tidesync_keys::{DeviceIdentity, DeviceKeyManager, FileKeyStore, KeyManagerConfig};
use uuid::Uuid;

/// Printable form of a device identity.
#[derive(Debug, Serialize)]
pub struct IdentityResult {
    /// Key namespace (the setup name).
    pub namespace: String,
    /// Device id.
    pub device_id: String,
    /// Current rotation index.
    pub key_index: u32,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    /// Whether the key was rotated by this invocation.
    pub rotated: bool,
}

/// Runs the identity command.
///
/// When a storage directory is given and holds a database for the setup,
/// a freshly created identity adopts the device id recorded there.
pub fn run(
    key_file: &Path,
    passphrase: &str,
    setup: &str,
    dir: Option<&Path>,
    rotate: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = KeyManagerConfig::new(setup);
    if let Some(device_id) = dir.map(|dir| stored_device_id(dir, setup)).transpose()?.flatten() {
        config = config.with_device_id(device_id);
    }

    let store = Arc::new(FileKeyStore::new(key_file, passphrase));
    let manager = DeviceKeyManager::new(store, config);
    let mut identity = manager.load_or_create_identity()?;
    if rotate {
        identity = manager.rotate_key()?;
        tracing::info!(key_index = identity.key_index, "rotated signing key");
    }

    let result = describe(setup, &identity, rotate);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Namespace:  {}", result.namespace);
            println!("Device:     {}", result.device_id);
            println!("Key index:  {}", result.key_index);
            println!("Public key: {}", result.public_key);
            if result.rotated {
                println!("(rotated)");
            }
        }
    }

    Ok(())
}

fn stored_device_id(dir: &Path, setup: &str) -> Result<Option<Uuid>, CommandError> {
    let backend = match open_existing(dir, setup) {
        Ok(backend) => backend,
        Err(CommandError::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    backend
        .meta(tidesync_core::DEVICE_ID_META)?
        .map(|text| {
            Uuid::parse_str(&text).map_err(|_| CommandError::Invalid(format!("device id {text:?}")))
        })
        .transpose()
}

/// Builds the printable form of `identity`.
pub fn describe(namespace: &str, identity: &DeviceIdentity, rotated: bool) -> IdentityResult {
    IdentityResult {
        namespace: namespace.to_string(),
        device_id: identity.device_id.to_string(),
        key_index: identity.key_index,
        public_key: identity
            .public_key
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect(),
        rotated,
    }
}
