//! # TideSync Engine
//!
//! The sync protocol state machine for TideSync.
//!
//! A [`SyncEngine`] runs one background task per setup and is driven
//! through a cloneable [`SyncController`]:
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Loading -> Synced
//!                                              ^     |      |
//!                                              |     v      v
//!                                              +-- Syncing <-+
//! ```
//!
//! Authentication and protocol failures move the session to
//! [`SyncState::Error`], which only an explicit resync leaves.
//!
//! ## Exchange
//!
//! 1. Each side sends a signed welcome and verifies the peer's.
//! 2. Each side requests the peer's changes after its stored cursor.
//! 3. Batches are applied in one transaction each, conflicts settled by
//!    the setup's resolver, and acknowledged. The cursor only moves with a
//!    successfully applied batch.
//! 4. While connected, local writes are streamed as they commit.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod controller;
mod engine;
mod error;
mod state;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use controller::{ResultCallback, SyncController};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use state::{SyncEvent, SyncState};
pub use transport::{Channel, ConnectFuture, Connector, MemoryConnector, TcpConnector};
