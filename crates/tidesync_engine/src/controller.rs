//! Cloneable handle to a running engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tidesync_keys::DeviceIdentity;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::state::{SyncEvent, SyncState};
use crate::transport::Channel;

/// One-shot completion for a sync trigger. Receives the terminal state the
/// session reached.
pub type ResultCallback = Box<dyn FnOnce(SyncState) + Send + 'static>;

pub(crate) enum Command {
    Sync(Option<ResultCallback>),
    Resync(Option<ResultCallback>),
    Accept(Channel),
    Disconnect,
    RotateKey(oneshot::Sender<SyncResult<DeviceIdentity>>),
    Shutdown,
}

/// State the engine task publishes for controllers to read.
pub(crate) struct Shared {
    pub(crate) setup: String,
    pub(crate) device_id: Uuid,
    pub(crate) state: RwLock<SyncState>,
    pub(crate) auth_error: RwLock<Option<String>>,
    pub(crate) pending: AtomicUsize,
    pub(crate) identity: RwLock<DeviceIdentity>,
    pub(crate) events: broadcast::Sender<SyncEvent>,
}

impl Shared {
    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Handle to a running sync engine.
///
/// All mutations are queued to the engine task; the getters read the state
/// it last published. Result callbacks run on the engine task, never inside
/// the call that registered them.
#[derive(Clone)]
pub struct SyncController {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SyncController {
    pub(crate) fn new(shared: Arc<Shared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { shared, commands }
    }

    /// Name of the setup this engine synchronizes.
    pub fn setup_name(&self) -> &str {
        &self.shared.setup
    }

    /// This device's id.
    pub fn device_id(&self) -> Uuid {
        self.shared.device_id
    }

    /// Public identity currently presented to peers.
    pub fn identity(&self) -> DeviceIdentity {
        *self.shared.identity.read()
    }

    /// Current session state.
    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    /// The last authentication failure, cleared by a resync.
    pub fn authentication_error(&self) -> Option<String> {
        self.shared.auth_error.read().clone()
    }

    /// Local writes not yet acknowledged by a peer.
    pub fn pending_operations(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Subscribes to state, queue depth and authentication events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Returns true while the engine task is running.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Requests an incremental pass, connecting first when disconnected.
    /// A no-op while one is already running.
    pub fn trigger_sync(&self) {
        self.trigger(Command::Sync, None);
    }

    /// Like [`trigger_sync`](Self::trigger_sync), then calls `callback`
    /// exactly once with the next terminal state.
    pub fn trigger_sync_with_result(&self, callback: impl FnOnce(SyncState) + Send + 'static) {
        self.trigger(Command::Sync, Some(Box::new(callback)));
    }

    /// Forgets the cursor of the current peer and runs a full load. Also
    /// leaves the error state.
    pub fn trigger_resync(&self) {
        self.trigger(Command::Resync, None);
    }

    /// Like [`trigger_resync`](Self::trigger_resync), then calls `callback`
    /// exactly once with the next terminal state.
    pub fn trigger_resync_with_result(
        &self,
        callback: impl FnOnce(SyncState) + Send + 'static,
    ) {
        self.trigger(Command::Resync, Some(Box::new(callback)));
    }

    /// Triggers a sync and waits for the terminal state.
    pub async fn sync(&self) -> SyncState {
        let (tx, rx) = oneshot::channel();
        self.trigger_sync_with_result(move |state| {
            let _ = tx.send(state);
        });
        rx.await.unwrap_or(SyncState::Disconnected)
    }

    /// Triggers a resync and waits for the terminal state.
    pub async fn resync(&self) -> SyncState {
        let (tx, rx) = oneshot::channel();
        self.trigger_resync_with_result(move |state| {
            let _ = tx.send(state);
        });
        rx.await.unwrap_or(SyncState::Disconnected)
    }

    /// Hands an inbound channel to the engine. An existing session is
    /// closed in favor of the new one.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotConnected`] if the engine has stopped.
    pub fn accept(&self, channel: Channel) -> SyncResult<()> {
        self.commands
            .send(Command::Accept(channel))
            .map_err(|_| SyncError::NotConnected)
    }

    /// Closes the current session.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Rotates the device key. An open session is closed so the next one
    /// presents the new key.
    pub async fn rotate_key(&self) -> SyncResult<DeviceIdentity> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RotateKey(tx))
            .map_err(|_| SyncError::NotConnected)?;
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Stops the engine task. Pending callbacks receive
    /// [`SyncState::Disconnected`].
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn trigger(&self, command: fn(Option<ResultCallback>) -> Command, callback: Option<ResultCallback>) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command(callback)) {
            if let Command::Sync(Some(callback)) | Command::Resync(Some(callback)) = command {
                // Engine gone; still complete off the caller's stack.
                std::thread::spawn(move || callback(SyncState::Disconnected));
            }
        }
    }
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("setup", &self.shared.setup)
            .field("device_id", &self.shared.device_id)
            .field("state", &self.state())
            .finish()
    }
}
