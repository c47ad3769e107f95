//! Setup registry and thread-bound database handles.
//!
//! The broker owns every registered setup. Each setup hands out
//! [`DatabaseRef`]s: reference-counted handles bound to the calling thread.
//! The first handle a thread takes opens a physical connection; the last
//! one it drops closes it. Threads never share a connection.

use crate::change_feed::ChangeFeed;
use crate::config::SetupConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::StoreEvent;
use crate::worker::{Job, WorkerPool};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use tidesync_storage::{OpenOptions, SqliteBackend, WriteTxn};
use uuid::Uuid;

/// Store metadata entry holding the device id.
pub const DEVICE_ID_META: &str = "device_id";

/// Process-wide registry of setups.
#[derive(Default)]
pub struct ConnectionBroker {
    setups: Mutex<HashMap<String, Arc<SetupContext>>>,
}

static GLOBAL: OnceLock<ConnectionBroker> = OnceLock::new();

impl ConnectionBroker {
    /// Creates an empty, independent registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static ConnectionBroker {
        GLOBAL.get_or_init(ConnectionBroker::new)
    }

    /// Registers a setup.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Configuration`] if the name is already taken.
    pub fn create_config(&self, config: SetupConfig) -> CoreResult<Arc<SetupContext>> {
        let mut setups = self.setups.lock();
        if setups.contains_key(&config.name) {
            return Err(CoreError::configuration(format!(
                "setup {:?} is already registered",
                config.name
            )));
        }
        let name = config.name.clone();
        let context = Arc::new(SetupContext::new(config));
        setups.insert(name.clone(), Arc::clone(&context));
        tracing::info!(setup = %name, path = %context.config.database_path().display(), "registered setup");
        Ok(context)
    }

    /// Looks up a registered setup.
    pub fn setup(&self, name: &str) -> CoreResult<Arc<SetupContext>> {
        self.setups
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::configuration(format!("setup {name:?} is not registered")))
    }

    /// Names of all registered setups, sorted.
    pub fn setup_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.setups.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Acquires a handle to setup `name` for the calling thread.
    pub fn acquire(&self, name: &str) -> CoreResult<DatabaseRef> {
        self.setup(name)?.acquire()
    }

    /// Unregisters a setup after stopping its workers.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Configuration`] if the setup is unknown or any
    /// handle is still outstanding.
    pub fn remove_config(&self, name: &str) -> CoreResult<()> {
        let mut setups = self.setups.lock();
        let context = setups
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::configuration(format!("setup {name:?} is not registered")))?;
        context.shutdown();
        let open = context.open_connections();
        if open > 0 {
            return Err(CoreError::configuration(format!(
                "setup {name:?} still has {open} open connection(s)"
            )));
        }
        setups.remove(name);
        tracing::info!(setup = %name, "removed setup");
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBroker")
            .field("setups", &self.setup_names())
            .finish()
    }
}

struct ConnectionSlot {
    backend: Arc<Mutex<SqliteBackend>>,
    refs: usize,
}

/// One registered setup: configuration, connections, workers and events.
pub struct SetupContext {
    config: SetupConfig,
    connections: Mutex<HashMap<ThreadId, ConnectionSlot>>,
    opened: AtomicU64,
    closed: AtomicU64,
    next_route: AtomicU64,
    feed: ChangeFeed,
    workers: Mutex<Option<WorkerPool>>,
    commit_lock: Mutex<()>,
    device_id: RwLock<Option<Uuid>>,
}

impl SetupContext {
    fn new(config: SetupConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(HashMap::new()),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            next_route: AtomicU64::new(0),
            feed: ChangeFeed::new(),
            workers: Mutex::new(None),
            commit_lock: Mutex::new(()),
            device_id: RwLock::new(None),
        }
    }

    /// The setup name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The setup configuration.
    pub fn config(&self) -> &SetupConfig {
        &self.config
    }

    /// The setup's event feed.
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Acquires a handle for the calling thread, opening the thread's
    /// connection on first use.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the connection cannot be opened.
    pub fn acquire(self: &Arc<Self>) -> CoreResult<DatabaseRef> {
        let thread = thread::current().id();
        {
            let mut connections = self.connections.lock();
            if let Some(slot) = connections.get_mut(&thread) {
                slot.refs += 1;
                return Ok(DatabaseRef::new(Arc::clone(self), Arc::clone(&slot.backend)));
            }
        }

        let backend = SqliteBackend::open(
            &self.config.database_path(),
            OpenOptions {
                busy_timeout: self.config.options.busy_timeout,
            },
        )?;
        let backend = Arc::new(Mutex::new(backend));
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(
            thread,
            ConnectionSlot {
                backend: Arc::clone(&backend),
                refs: 1,
            },
        );
        tracing::debug!(setup = %self.config.name, ?thread, "opened connection");
        Ok(DatabaseRef::new(Arc::clone(self), backend))
    }

    /// Releases one handle of the calling thread, closing the connection
    /// when it was the last one.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds no handle. A double release is a
    /// programming error.
    pub fn release_database(&self) {
        let thread = thread::current().id();
        let mut connections = self.connections.lock();
        let Some(slot) = connections.get_mut(&thread) else {
            panic!(
                "release_database on setup {:?} without an outstanding handle on {thread:?}",
                self.config.name
            );
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            connections.remove(&thread);
            self.closed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(setup = %self.config.name, ?thread, "closed connection");
        }
    }

    /// Drops whatever connection `thread` still holds. Returns the number
    /// of handles that were leaked.
    pub fn release_thread(&self, thread: ThreadId) -> usize {
        let Some(slot) = self.connections.lock().remove(&thread) else {
            return 0;
        };
        self.closed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            setup = %self.config.name,
            ?thread,
            leaked = slot.refs,
            "force-closed connection of terminated thread"
        );
        slot.refs
    }

    /// Number of physical connections currently open.
    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Outstanding handles held by `thread`.
    pub fn thread_ref_count(&self, thread: ThreadId) -> usize {
        self.connections
            .lock()
            .get(&thread)
            .map_or(0, |slot| slot.refs)
    }

    /// Physical connections opened since the setup was registered.
    pub fn connections_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Physical connections closed since the setup was registered.
    pub fn connections_closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Stops the worker threads. They restart on the next operation.
    pub fn shutdown(&self) {
        let pool = self.workers.lock().take();
        if let Some(pool) = pool {
            pool.stop();
            tracing::debug!(setup = %self.config.name, "stopped workers");
        }
    }

    pub(crate) fn submit(self: &Arc<Self>, route: Option<u64>, job: Job) -> CoreResult<()> {
        let route = route.unwrap_or_else(|| self.next_route.fetch_add(1, Ordering::Relaxed));
        let mut workers = self.workers.lock();
        if workers.is_none() {
            *workers = Some(WorkerPool::start(self, self.config.options.worker_threads)?);
        }
        match workers.as_ref() {
            Some(pool) => pool.submit(route, job),
            None => Err(CoreError::worker_unavailable("worker pool missing")),
        }
    }

    /// Runs a write transaction and publishes the events it produced while
    /// still holding the commit lock.
    pub(crate) fn commit<T>(
        &self,
        backend: &mut SqliteBackend,
        f: impl FnOnce(&WriteTxn<'_>) -> CoreResult<(T, Vec<StoreEvent>)>,
    ) -> CoreResult<T> {
        let _order = self.commit_lock.lock();
        let (value, events) = backend.write(f)?;
        self.feed.publish_all(events);
        Ok(value)
    }

    /// The device id recorded in this setup's database, created on first use.
    pub(crate) fn device_id(&self, backend: &mut SqliteBackend) -> CoreResult<Uuid> {
        if let Some(id) = *self.device_id.read() {
            return Ok(id);
        }
        let id = backend.write(|txn| -> CoreResult<Uuid> {
            match txn.meta(DEVICE_ID_META)? {
                Some(value) => Uuid::parse_str(&value).map_err(|_| {
                    tidesync_storage::StorageError::corrupted(format!("invalid device id {value:?}"))
                        .into()
                }),
                None => {
                    let id = Uuid::new_v4();
                    txn.set_meta(DEVICE_ID_META, &id.to_string())?;
                    Ok(id)
                }
            }
        })?;
        *self.device_id.write() = Some(id);
        Ok(id)
    }
}

impl std::fmt::Debug for SetupContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupContext")
            .field("name", &self.config.name)
            .field("open_connections", &self.open_connections())
            .finish_non_exhaustive()
    }
}

/// A handle on a setup's connection, bound to the thread that acquired it.
///
/// Dropping the handle releases it.
pub struct DatabaseRef {
    setup: Arc<SetupContext>,
    backend: Arc<Mutex<SqliteBackend>>,
    _thread_bound: PhantomData<*const ()>,
}

impl DatabaseRef {
    fn new(setup: Arc<SetupContext>, backend: Arc<Mutex<SqliteBackend>>) -> Self {
        Self {
            setup,
            backend,
            _thread_bound: PhantomData,
        }
    }

    /// Locks the connection.
    pub fn backend(&self) -> MutexGuard<'_, SqliteBackend> {
        self.backend.lock()
    }

    /// The setup this handle belongs to.
    pub fn setup(&self) -> &Arc<SetupContext> {
        &self.setup
    }
}

impl Drop for DatabaseRef {
    fn drop(&mut self) {
        self.setup.release_database();
    }
}

impl std::fmt::Debug for DatabaseRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseRef")
            .field("setup", &self.setup.name())
            .finish_non_exhaustive()
    }
}
