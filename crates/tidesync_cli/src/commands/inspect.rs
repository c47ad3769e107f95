//! Inspect command implementation.

use super::{open_existing, CommandError};
use serde::Serialize;
use std::path::Path;
use tidesync_storage::SqliteBackend;
use uuid::Uuid;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database file path.
    pub path: String,
    /// Device id recorded in the store, if the store has been opened by an engine.
    pub device_id: Option<String>,
    /// Highest committed sequence number.
    pub last_seq: u64,
    /// Rows not yet acknowledged by a peer.
    pub pending: u64,
    /// Live object counts per type.
    pub types: Vec<TypeStats>,
    /// Bookkeeping for the most recently seen peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_peer: Option<PeerStats>,
}

/// Statistics for a single object type.
#[derive(Debug, Serialize)]
pub struct TypeStats {
    /// Type name.
    pub name: String,
    /// Number of live objects.
    pub count: u64,
}

/// Replication state of one peer.
#[derive(Debug, Serialize)]
pub struct PeerStats {
    /// Peer device id.
    pub device_id: String,
    /// Highest peer sequence applied locally.
    pub cursor: Option<u64>,
    /// Highest local sequence the peer acknowledged.
    pub acknowledged: u64,
    /// Local key index the peer has confirmed.
    pub confirmed_key_index: Option<u32>,
    /// Milliseconds since the epoch of the last handshake.
    pub last_seen: u64,
}

/// Runs the inspect command.
pub fn run(dir: &Path, setup: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_existing(dir, setup)?;
    let result = collect(&backend)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Gathers statistics from an open database.
pub fn collect(backend: &SqliteBackend) -> Result<InspectResult, CommandError> {
    let mut types = Vec::new();
    for name in backend.type_names()? {
        let count = backend.count(&name)?;
        types.push(TypeStats { name, count });
    }

    let last_peer = match backend.last_peer()? {
        Some(peer) => {
            let state = backend.peer_state(&peer)?;
            Some(PeerStats {
                device_id: Uuid::from_bytes(peer).to_string(),
                cursor: state.cursor,
                acknowledged: state.acknowledged,
                confirmed_key_index: state.confirmed_key_index,
                last_seen: state.last_seen,
            })
        }
        None => None,
    };

    Ok(InspectResult {
        path: backend.path().display().to_string(),
        device_id: backend.meta(tidesync_core::DEVICE_ID_META)?,
        last_seq: backend.last_seq()?,
        pending: backend.pending_count()?,
        types,
        last_peer,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("TideSync Store Inspection");
    println!("=========================");
    println!();
    println!("Path:      {}", result.path);
    println!(
        "Device:    {}",
        result.device_id.as_deref().unwrap_or("(not assigned)")
    );
    println!();
    println!("Changes:");
    println!("  Last sequence: {}", result.last_seq);
    println!("  Pending:       {}", result.pending);
    println!();
    println!("Types:");
    if result.types.is_empty() {
        println!("  (none)");
    }
    for stats in &result.types {
        println!("  {:<24} {} objects", stats.name, stats.count);
    }

    if let Some(peer) = &result.last_peer {
        println!();
        println!("Last peer: {}", peer.device_id);
        match peer.cursor {
            Some(cursor) => println!("  Cursor:        {cursor}"),
            None => println!("  Cursor:        (initial load pending)"),
        }
        println!("  Acknowledged:  {}", peer.acknowledged);
        match peer.confirmed_key_index {
            Some(index) => println!("  Confirmed key: {index}"),
            None => println!("  Confirmed key: (none)"),
        }
        println!("  Last seen:     {} ms", peer.last_seen);
    }
}
