//! Test fixtures.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tidesync_core::{
    ConflictResolver, ConnectionBroker, CoreResult, LastWriterWins, LocalStore, SetupConfig,
    SetupOptions,
};

use crate::resolvers::CountingResolver;

/// A registered setup backed by a temporary directory.
///
/// Each fixture has its own broker, so several devices can live in one
/// test process. The workers are stopped and the directory removed on drop.
pub struct TestSetup {
    /// The setup's broker.
    pub broker: ConnectionBroker,
    /// Store for the setup.
    pub store: LocalStore,
    /// The setup's resolver.
    pub resolver: CountingResolver,
    temp_dir: TempDir,
}

impl TestSetup {
    /// Registers `name` with default options.
    pub fn new(name: &str) -> CoreResult<Self> {
        Self::with_options(name, SetupOptions::default())
    }

    /// Registers `name` with `options`.
    pub fn with_options(name: &str, options: SetupOptions) -> CoreResult<Self> {
        Self::with_resolver(name, options, Arc::new(LastWriterWins))
    }

    /// Registers `name` with `options`, merging through `inner`.
    pub fn with_resolver(
        name: &str,
        options: SetupOptions,
        inner: Arc<dyn ConflictResolver>,
    ) -> CoreResult<Self> {
        let temp_dir = TempDir::new()?;
        let resolver = CountingResolver::wrapping(inner);
        let broker = ConnectionBroker::new();
        broker.create_config(
            SetupConfig::new(name, temp_dir.path())
                .with_options(options)
                .with_resolver(Arc::new(resolver.clone())),
        )?;
        let store = LocalStore::open(&broker, name)?;
        Ok(Self {
            broker,
            store,
            resolver,
            temp_dir,
        })
    }

    /// Directory holding the database file.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

impl Drop for TestSetup {
    fn drop(&mut self) {
        self.store.setup().shutdown();
    }
}

impl std::fmt::Debug for TestSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSetup")
            .field("setup", &self.store.setup_name())
            .field("path", &self.temp_dir.path())
            .finish()
    }
}
