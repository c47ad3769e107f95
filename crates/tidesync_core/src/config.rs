//! Setup configuration.

use crate::conflict::{ConflictResolver, DeletePolicy, LastWriterWins};
use crate::serializer::{CborSerializer, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Name of the setup used when none is given.
pub const DEFAULT_SETUP: &str = "default";

/// Tunables of a setup's local store.
#[derive(Debug, Clone)]
pub struct SetupOptions {
    /// Number of storage worker threads.
    pub worker_threads: usize,
    /// How delete-versus-update conflicts are settled.
    pub delete_policy: DeletePolicy,
    /// How long a connection waits on a locked database.
    pub busy_timeout: Duration,
    /// Default number of records per change batch.
    pub batch_size: usize,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            delete_policy: DeletePolicy::KeepDeleted,
            busy_timeout: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

impl SetupOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads (at least one).
    #[must_use]
    pub const fn worker_threads(mut self, value: usize) -> Self {
        self.worker_threads = if value == 0 { 1 } else { value };
        self
    }

    /// Sets the delete policy.
    #[must_use]
    pub const fn delete_policy(mut self, value: DeletePolicy) -> Self {
        self.delete_policy = value;
        self
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, value: Duration) -> Self {
        self.busy_timeout = value;
        self
    }

    /// Sets the default batch size (at least one).
    #[must_use]
    pub const fn batch_size(mut self, value: usize) -> Self {
        self.batch_size = if value == 0 { 1 } else { value };
        self
    }
}

/// Everything needed to register a setup with the broker.
#[derive(Clone)]
pub struct SetupConfig {
    /// Unique setup name.
    pub name: String,
    /// Directory holding the setup's database file.
    pub storage_dir: PathBuf,
    /// Address the engine connects to, if it connects out.
    pub remote_address: Option<String>,
    /// Store tunables.
    pub options: SetupOptions,
    /// Object codec.
    pub serializer: Arc<dyn Serializer>,
    /// Conflict resolver for concurrent updates.
    pub resolver: Arc<dyn ConflictResolver>,
}

impl SetupConfig {
    /// Creates a configuration with the CBOR codec and last-writer-wins.
    pub fn new(name: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            storage_dir: storage_dir.into(),
            remote_address: None,
            options: SetupOptions::default(),
            serializer: Arc::new(CborSerializer),
            resolver: Arc::new(LastWriterWins),
        }
    }

    /// Sets the remote address.
    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    /// Sets the store options.
    pub fn with_options(mut self, options: SetupOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the object codec.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sets the conflict resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Path of the setup's database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        database_path(&self.storage_dir, &self.name)
    }
}

/// Path of the database file for setup `name` inside `storage_dir`.
pub fn database_path(storage_dir: &Path, name: &str) -> PathBuf {
    storage_dir.join(format!("{name}.db"))
}

impl fmt::Debug for SetupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupConfig")
            .field("name", &self.name)
            .field("storage_dir", &self.storage_dir)
            .field("remote_address", &self.remote_address)
            .field("options", &self.options)
            .field("serializer", &self.serializer.name())
            .finish_non_exhaustive()
    }
}
