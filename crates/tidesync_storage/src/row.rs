//! Row types exchanged with the object tables.

/// Length of an origin device identifier in bytes.
pub const ORIGIN_LEN: usize = 16;

/// A stored object row as read back from an object table.
///
/// Tombstones keep their key, version and origin so that deletions
/// replicate like any other write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRow {
    /// Name of the object type (one table per type).
    pub type_name: String,
    /// Object key, unique within its type.
    pub key: String,
    /// Opaque serialized payload. Empty for tombstones.
    pub payload: Vec<u8>,
    /// Logical version (milliseconds, strictly increasing per key).
    pub version: u64,
    /// Device that produced this version.
    pub origin: [u8; ORIGIN_LEN],
    /// Whether this row marks a deletion.
    pub tombstone: bool,
    /// Local commit sequence number of the last write to this row.
    pub seq: u64,
    /// Whether the last write has not yet been acknowledged by a peer.
    pub pending: bool,
}

/// A row to be written inside a [`WriteTxn`](crate::WriteTxn).
///
/// The sequence number is assigned by the transaction.
#[derive(Debug, Clone, Copy)]
pub struct RowWrite<'a> {
    /// Name of the object type.
    pub type_name: &'a str,
    /// Object key.
    pub key: &'a str,
    /// Serialized payload.
    pub payload: &'a [u8],
    /// Logical version.
    pub version: u64,
    /// Origin device.
    pub origin: [u8; ORIGIN_LEN],
    /// Deletion marker.
    pub tombstone: bool,
    /// Whether the write still has to be propagated.
    pub pending: bool,
}

/// Replication bookkeeping kept per remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerState {
    /// Highest sequence number of the peer's stream applied locally.
    pub cursor: Option<u64>,
    /// Highest local sequence number the peer has acknowledged.
    pub acknowledged: u64,
    /// Local signing key index the peer has confirmed.
    pub confirmed_key_index: Option<u32>,
    /// Milliseconds since the epoch of the last handshake with the peer.
    pub last_seen: u64,
}
