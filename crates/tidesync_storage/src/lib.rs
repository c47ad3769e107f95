//! # TideSync Storage
//!
//! SQLite persistence for TideSync setups.
//!
//! This crate owns the on-disk layout: one table per object type, a
//! monotonic commit sequence shared by all tables, and per-peer
//! replication state (cursors, acknowledgements, confirmed key indices).
//! It knows nothing about payload formats or conflict rules.
//!
//! ## Design Principles
//!
//! - A [`SqliteBackend`] is one connection, owned by one thread
//! - Every write runs in an immediate transaction via [`SqliteBackend::write`]
//! - Each committed row gets a fresh sequence number
//! - Tombstones are rows with the deletion flag set, never physical deletes
//!
//! ## Example
//!
//! ```rust
//! use tidesync_storage::{OpenOptions, RowWrite, SqliteBackend};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut backend = SqliteBackend::open(&dir.path().join("store.db"), OpenOptions::default()).unwrap();
//! let seq = backend
//!     .write(|txn| {
//!         txn.put(RowWrite {
//!             type_name: "Note",
//!             key: "42",
//!             payload: b"hello",
//!             version: 1,
//!             origin: [0u8; 16],
//!             tombstone: false,
//!             pending: true,
//!         })
//!     })
//!     .unwrap();
//! assert_eq!(backend.get("Note", "42").unwrap().unwrap().seq, seq);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod row;
mod schema;

pub use backend::{OpenOptions, SqliteBackend, WriteTxn};
pub use error::{StorageError, StorageResult};
pub use row::{ObjectRow, PeerState, RowWrite, ORIGIN_LEN};
