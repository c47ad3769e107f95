//! Core data types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one object across all replicas: a type name and a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Name of the object type.
    pub type_name: String,
    /// Key within the type.
    pub id: String,
}

impl ObjectKey {
    /// Creates a key.
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.id)
    }
}

/// A versioned object as held by one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Identity of the object.
    pub key: ObjectKey,
    /// Encoded value. Empty for tombstones.
    pub payload: Vec<u8>,
    /// Milliseconds timestamp, strictly increasing per key.
    pub version: u64,
    /// Device that produced this version.
    pub origin: Uuid,
    /// Whether the object is deleted.
    pub tombstone: bool,
    /// Setup the object belongs to.
    pub setup: String,
}

impl StoredObject {
    /// Ordering used by last-writer-wins: version first, origin breaks ties.
    #[must_use]
    pub fn write_order(&self) -> (u64, Uuid) {
        (self.version, self.origin)
    }

    /// Returns true if both objects carry the same replicated content.
    #[must_use]
    pub fn same_content(&self, other: &StoredObject) -> bool {
        self.key == other.key
            && self.version == other.version
            && self.origin == other.origin
            && self.tombstone == other.tombstone
            && self.payload == other.payload
    }

    pub(crate) fn from_row(row: tidesync_storage::ObjectRow, setup: &str) -> Self {
        Self {
            key: ObjectKey::new(row.type_name, row.key),
            payload: row.payload,
            version: row.version,
            origin: Uuid::from_bytes(row.origin),
            tombstone: row.tombstone,
            setup: setup.to_string(),
        }
    }
}

/// One replicated write, as carried in a change batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Object identity.
    pub key: ObjectKey,
    /// Version of the write.
    pub version: u64,
    /// Device that produced the write.
    pub origin: Uuid,
    /// Whether the write is a deletion.
    pub deleted: bool,
    /// Encoded value. Empty for deletions.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Sender's commit sequence number for this write.
    pub seq: u64,
}

impl ChangeRecord {
    pub(crate) fn from_row(row: tidesync_storage::ObjectRow) -> Self {
        Self {
            key: ObjectKey::new(row.type_name, row.key),
            version: row.version,
            origin: Uuid::from_bytes(row.origin),
            deleted: row.tombstone,
            payload: row.payload,
            seq: row.seq,
        }
    }

    /// Converts the record into the object it describes.
    #[must_use]
    pub fn to_object(&self, setup: &str) -> StoredObject {
        StoredObject {
            key: self.key.clone(),
            payload: self.payload.clone(),
            version: self.version,
            origin: self.origin,
            tombstone: self.deleted,
            setup: setup.to_string(),
        }
    }
}

/// Emitted after a commit changed the visible state of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The object that changed.
    pub key: ObjectKey,
    /// Whether the object is now deleted.
    pub deleted: bool,
}

/// Notifications published by a setup's local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// One object changed.
    Changed(ChangeEvent),
    /// Every object of the setup was erased.
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_by_type_then_id() {
        let mut keys = vec![
            ObjectKey::new("Note", "2"),
            ObjectKey::new("Contact", "9"),
            ObjectKey::new("Note", "10"),
        ];
        keys.sort();
        assert_eq!(keys[0], ObjectKey::new("Contact", "9"));
        assert_eq!(keys[1].id, "10");
    }

    #[test]
    fn write_order_breaks_ties_by_origin() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);
        let a = StoredObject {
            key: ObjectKey::new("Note", "1"),
            payload: vec![1],
            version: 5,
            origin: low,
            tombstone: false,
            setup: "default".into(),
        };
        let b = StoredObject {
            origin: high,
            ..a.clone()
        };
        assert!(b.write_order() > a.write_order());
        assert!(!a.same_content(&b));
    }
}
