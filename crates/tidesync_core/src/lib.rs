//! # TideSync Core
//!
//! The local half of TideSync: everything an application touches while
//! offline.
//!
//! - [`ConnectionBroker`] registers named setups and hands out
//!   thread-bound, reference-counted [`DatabaseRef`]s.
//! - [`LocalStore`] is the asynchronous object API. Operations run on a
//!   per-setup worker pool and publish [`StoreEvent`]s after commit.
//! - [`ConflictResolver`] and [`reconcile`] settle concurrent writes when a
//!   peer's changes are applied.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tidesync_core::{ConnectionBroker, LocalStore, SetupConfig};
//!
//! # async fn example() -> tidesync_core::CoreResult<()> {
//! let broker = ConnectionBroker::new();
//! broker.create_config(SetupConfig::new("default", "/var/lib/notes"))?;
//! let store = LocalStore::open(&broker, "default")?;
//! store.save("Note", "42", &tidesync_core::Value::Text("hello".into())).await?;
//! assert_eq!(store.keys("Note").await?, vec!["42"]);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod change_feed;
mod config;
mod conflict;
mod error;
mod replica;
mod serializer;
mod store;
mod types;
mod worker;

pub use broker::{ConnectionBroker, DatabaseRef, SetupContext, DEVICE_ID_META};
pub use change_feed::{ChangeFeed, StoreEvents};
pub use config::{database_path, SetupConfig, SetupOptions, DEFAULT_SETUP};
pub use conflict::{reconcile, ConflictResolver, DeletePolicy, LastWriterWins, Reconciliation};
pub use error::{CoreError, CoreResult};
pub use replica::ApplyOutcome;
pub use serializer::{CborSerializer, DataObject, JsonSerializer, Serializer};
pub use store::LocalStore;
pub use types::{ChangeEvent, ChangeRecord, ObjectKey, StoreEvent, StoredObject};

pub use ciborium::Value;
pub use tidesync_storage::PeerState;

/// Version of the core crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
