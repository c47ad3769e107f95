//! The sync protocol state machine.
//!
//! One task per setup owns the session. It reacts, one at a time, to
//! controller commands, frames from the peer, local store events and the
//! retry timer, so no session state is shared across threads.

use std::future::pending;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use tidesync_core::{CoreError, LocalStore, StoreEvent, StoreEvents};
use tidesync_keys::{DeviceIdentity, DeviceKeyManager, KeyError, KeyManagerConfig, KeyStore};
use tidesync_protocol::{Acknowledge, ChangeBatch, Close, SyncMessage, SyncRequest, Welcome};

use crate::config::SyncConfig;
use crate::controller::{Command, ResultCallback, Shared, SyncController};
use crate::error::{SyncError, SyncResult};
use crate::state::{SyncEvent, SyncState};
use crate::transport::{Channel, Connector, TcpConnector};

/// Builds and starts the engine task for one local store.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tidesync_core::{ConnectionBroker, LocalStore, SetupConfig};
/// use tidesync_engine::{SyncEngine, SyncState};
/// use tidesync_keys::MemoryKeyStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = ConnectionBroker::new();
/// broker.create_config(
///     SetupConfig::new("notes", "/var/lib/notes").with_remote_address("sync.example.com:7400"),
/// )?;
/// let store = LocalStore::open(&broker, "notes")?;
/// let controller = SyncEngine::new(store, Arc::new(MemoryKeyStore::new()))
///     .spawn()
///     .await?;
/// assert_eq!(controller.sync().await, SyncState::Synced);
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    store: LocalStore,
    key_store: Arc<dyn KeyStore>,
    config: SyncConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl SyncEngine {
    /// Creates an engine for `store` whose device keys live in `key_store`.
    pub fn new(store: LocalStore, key_store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            key_store,
            config: SyncConfig::default(),
            connector: None,
        }
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how outbound sessions are opened. Without one, the setup's
    /// remote address is dialed over TCP.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Loads the device identity and starts the engine task.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read or the key store cannot be opened.
    pub async fn spawn(self) -> SyncResult<SyncController> {
        let store_events = self.store.subscribe();
        let device_id = self.store.device_id().await?;
        let setup = self.store.setup_name().to_string();

        let keys = DeviceKeyManager::new(
            self.key_store,
            KeyManagerConfig::new(setup.clone())
                .with_device_id(device_id)
                .with_grace_period(self.config.key_grace_period),
        );
        let identity = keys.load_or_create_identity()?;
        if identity.device_id != device_id {
            return Err(SyncError::Keys(KeyError::invalid_key(format!(
                "key store holds identity {} but the store belongs to device {device_id}",
                identity.device_id
            ))));
        }

        let setup_config = self.store.setup().config();
        let batch_size = self
            .config
            .batch_size
            .unwrap_or(setup_config.options.batch_size)
            .max(1);
        let connector = self.connector.or_else(|| {
            setup_config
                .remote_address
                .as_ref()
                .map(|address| Arc::new(TcpConnector::new(address.clone())) as Arc<dyn Connector>)
        });

        let pending = self.store.pending_count().await? as usize;
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            setup,
            device_id,
            state: RwLock::new(SyncState::Disconnected),
            auth_error: RwLock::new(None),
            pending: pending.into(),
            identity: RwLock::new(identity),
            events,
        });

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let task = EngineTask {
            store: self.store,
            keys,
            config: self.config,
            batch_size,
            connector,
            shared: Arc::clone(&shared),
            commands,
            store_events: Some(store_events),
            callbacks: Vec::new(),
            session: None,
            next_request: 0,
        };
        tokio::spawn(task.run());

        Ok(SyncController::new(shared, commands_tx))
    }
}

/// Per-connection bookkeeping.
struct Session {
    channel: Channel,
    peer: Option<Uuid>,
    welcome_sent: bool,
    /// Id of our outstanding request; batches carrying another id are stale.
    request_id: u64,
    /// The peer's latest request; outbound batches carry it.
    peer_request: Option<u64>,
    inbound_complete: bool,
    unacked: Option<u64>,
    last_sent: u64,
    attempts: u32,
    retry_at: Option<Instant>,
}

impl Session {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            peer: None,
            welcome_sent: false,
            request_id: 0,
            peer_request: None,
            inbound_complete: false,
            unacked: None,
            last_sent: 0,
            attempts: 0,
            retry_at: None,
        }
    }

    fn send(&self, message: SyncMessage) -> SyncResult<()> {
        self.channel.send(&message)
    }

    fn is_settled(&self) -> bool {
        self.inbound_complete && self.unacked.is_none() && self.retry_at.is_none()
    }
}

struct EngineTask {
    store: LocalStore,
    keys: DeviceKeyManager,
    config: SyncConfig,
    batch_size: usize,
    connector: Option<Arc<dyn Connector>>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    store_events: Option<StoreEvents>,
    callbacks: Vec<ResultCallback>,
    session: Option<Session>,
    next_request: u64,
}

async fn next_frame(session: &mut Option<Session>) -> Option<SyncResult<SyncMessage>> {
    match session {
        Some(session) => session.channel.recv().await,
        None => pending().await,
    }
}

async fn next_store_event(events: &mut Option<StoreEvents>) -> Option<StoreEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}

impl EngineTask {
    async fn run(mut self) {
        tracing::info!(setup = %self.shared.setup, device = %self.shared.device_id, "sync engine started");
        loop {
            let retry_at = self.session.as_ref().and_then(|session| session.retry_at);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                frame = next_frame(&mut self.session) => self.handle_frame(frame).await,
                event = next_store_event(&mut self.store_events) => self.handle_store_event(event).await,
                () = retry_timer(retry_at) => self.handle_retry().await,
            }
        }
        self.close_session("engine shut down");
        self.set_state(SyncState::Disconnected);
        tracing::info!(setup = %self.shared.setup, "sync engine stopped");
    }

    fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    /// Publishes `next`. Entering a terminal state completes every queued
    /// callback, even when the state did not change.
    fn set_state(&mut self, next: SyncState) {
        let previous = std::mem::replace(&mut *self.shared.state.write(), next);
        if previous != next {
            tracing::info!(setup = %self.shared.setup, from = %previous, to = %next, "sync state changed");
            self.shared.emit(SyncEvent::StateChanged(next));
        }
        if next.is_terminal() {
            for callback in self.callbacks.drain(..) {
                callback(next);
            }
        }
    }

    fn set_auth_error(&mut self, error: Option<String>) {
        {
            let mut current = self.shared.auth_error.write();
            if *current == error {
                return;
            }
            current.clone_from(&error);
        }
        self.shared.emit(SyncEvent::AuthenticationErrorChanged(error));
    }

    async fn refresh_pending(&mut self) -> SyncResult<()> {
        let count = self.store.pending_count().await? as usize;
        if self.shared.pending.swap(count, Ordering::AcqRel) != count {
            self.shared.emit(SyncEvent::OperationsChanged(count));
        }
        Ok(())
    }

    fn key_index(&self) -> u32 {
        self.keys.identity().map_or(0, |identity| identity.key_index)
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }

    fn session_mut(&mut self) -> SyncResult<&mut Session> {
        self.session.as_mut().ok_or(SyncError::NotConnected)
    }

    fn peer(&self) -> SyncResult<Uuid> {
        self.session
            .as_ref()
            .and_then(|session| session.peer)
            .ok_or_else(|| SyncError::protocol("message received before welcome"))
    }

    fn close_session(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            let _ = session.send(SyncMessage::Close(Close {
                reason: reason.to_string(),
                authentication: false,
            }));
        }
    }

    /// Ends the session according to the kind of failure.
    fn fail(&mut self, err: SyncError) {
        match err {
            SyncError::NotConnected | SyncError::Transport { .. } | SyncError::Cancelled => {
                tracing::warn!(setup = %self.shared.setup, %err, "session lost");
                self.session = None;
                self.set_state(SyncState::Disconnected);
            }
            SyncError::Authentication(reason) => {
                tracing::warn!(setup = %self.shared.setup, %reason, "rejecting peer");
                if let Some(session) = self.session.take() {
                    let _ = session.send(SyncMessage::Close(Close {
                        reason: reason.clone(),
                        authentication: true,
                    }));
                }
                self.set_auth_error(Some(reason));
                self.set_state(SyncState::Error);
            }
            err if err.is_fatal() => {
                tracing::error!(setup = %self.shared.setup, %err, "sync session failed");
                self.close_session(&err.to_string());
                self.set_state(SyncState::Error);
            }
            err => {
                tracing::error!(setup = %self.shared.setup, %err, "sync session aborted");
                self.close_session(&err.to_string());
                self.set_state(SyncState::Disconnected);
            }
        }
    }

    // Commands

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Sync(callback) => {
                self.callbacks.extend(callback);
                self.sync().await;
            }
            Command::Resync(callback) => {
                self.callbacks.extend(callback);
                self.resync().await;
            }
            Command::Accept(channel) => {
                if let Err(err) = self.start_session(channel, false).await {
                    self.fail(err);
                }
            }
            Command::Disconnect => {
                self.close_session("disconnect requested");
                self.set_state(SyncState::Disconnected);
            }
            Command::RotateKey(reply) => {
                let result = self.rotate_key();
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    async fn sync(&mut self) {
        match self.state() {
            // Stays put until an explicit resync.
            SyncState::Error => self.set_state(SyncState::Error),
            SyncState::Disconnected => self.connect().await,
            SyncState::Synced => {
                self.set_state(SyncState::Syncing);
                let result = match self.request_changes(false).await {
                    Ok(()) => self.push_pending().await.map(|_| ()),
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    self.fail(err);
                }
            }
            state => tracing::debug!(setup = %self.shared.setup, %state, "sync already in progress"),
        }
    }

    async fn resync(&mut self) {
        self.set_auth_error(None);

        if self.session.as_ref().is_some_and(|session| session.peer.is_some()) {
            self.set_state(SyncState::Loading);
            if let Err(err) = self.request_changes(true).await {
                self.fail(err);
            }
            return;
        }
        if self.session.is_some() {
            tracing::debug!(setup = %self.shared.setup, "handshake in progress");
            return;
        }

        let cleared = match self.store.last_peer().await {
            Ok(Some(peer)) => self.store.clear_cursor(peer).await,
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = cleared {
            self.fail(err.into());
            return;
        }
        self.connect().await;
    }

    fn rotate_key(&mut self) -> SyncResult<DeviceIdentity> {
        let identity = self.keys.rotate_key()?;
        *self.shared.identity.write() = identity;
        if self.session.is_some() {
            self.close_session("key rotated");
            self.set_state(SyncState::Disconnected);
        }
        Ok(identity)
    }

    async fn connect(&mut self) {
        let Some(connector) = self.connector.clone() else {
            tracing::warn!(setup = %self.shared.setup, "no connector or remote address configured");
            self.set_state(SyncState::Disconnected);
            return;
        };
        self.set_state(SyncState::Connecting);
        let result = match tokio::time::timeout(self.config.timeout, connector.connect()).await {
            Ok(Ok(channel)) => self.start_session(channel, true).await,
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SyncError::transport_retryable(format!(
                "connect timed out after {:?}",
                self.config.timeout
            ))),
        };
        if let Err(err) = result {
            self.fail(err);
        }
    }

    /// Adopts `channel`. The dialing side speaks first; the accepting side
    /// answers once it knows who the peer is.
    async fn start_session(&mut self, channel: Channel, dialing: bool) -> SyncResult<()> {
        if self.session.is_some() {
            tracing::info!(setup = %self.shared.setup, "replacing open session");
            self.close_session("superseded by a new session");
        }
        self.session = Some(Session::new(channel));
        self.set_state(SyncState::Handshaking);

        if dialing {
            let key_index = self.key_index();
            let offer_key = match self.store.last_peer().await? {
                Some(peer) => {
                    self.store.peer_state(peer).await?.confirmed_key_index != Some(key_index)
                }
                None => true,
            };
            let has_changes = self.store.pending_count().await? > 0;
            self.send_welcome(offer_key, has_changes)?;
        }
        Ok(())
    }

    fn send_welcome(&mut self, offer_key: bool, has_changes: bool) -> SyncResult<()> {
        let mut welcome = Welcome::signed(&self.keys, has_changes, offer_key)?;
        welcome.protocol_version = self.config.protocol_version;
        tracing::debug!(setup = %self.shared.setup, key_index = welcome.key_index, offer_key, "sending welcome");
        let session = self.session_mut()?;
        session.send(SyncMessage::Welcome(welcome))?;
        session.welcome_sent = true;
        Ok(())
    }

    /// Sends a request for the peer's changes after our cursor, or for
    /// everything when `full`.
    async fn request_changes(&mut self, full: bool) -> SyncResult<()> {
        let peer = self.peer()?;
        if full {
            self.store.clear_cursor(peer).await?;
        }
        let since = self.store.cursor(peer).await?;
        let request_id = self.next_request_id();
        let session = self.session_mut()?;
        session.retry_at = None;
        session.request_id = request_id;
        session.inbound_complete = false;
        session.send(SyncMessage::SyncRequest(SyncRequest { request_id, since }))
    }

    /// Streams unacknowledged local writes the peer has not been sent yet.
    async fn push_pending(&mut self) -> SyncResult<usize> {
        let Some((request_id, mut since)) = self
            .session
            .as_ref()
            .and_then(|session| Some((session.peer_request?, session.last_sent)))
        else {
            return Ok(0);
        };

        let mut pushed = 0;
        loop {
            let records = self.store.changes_since(since, self.batch_size, true).await?;
            let Some(last_seq) = records.last().map(|record| record.seq) else {
                break;
            };
            let more = records.len() == self.batch_size;
            pushed += records.len();

            let session = self.session_mut()?;
            session.send(SyncMessage::ChangeBatch(ChangeBatch {
                request_id,
                records,
                last_seq,
                complete: true,
            }))?;
            session.unacked = Some(last_seq);
            session.last_sent = last_seq;
            since = last_seq;
            if !more {
                break;
            }
        }

        if pushed > 0 {
            tracing::debug!(setup = %self.shared.setup, pushed, "pushed local changes");
            if self.state() == SyncState::Synced {
                self.set_state(SyncState::Syncing);
            }
        }
        Ok(pushed)
    }

    fn settle(&mut self) {
        let settled = self.session.as_ref().is_some_and(Session::is_settled);
        if settled && self.state().is_active() {
            self.set_state(SyncState::Synced);
        }
    }

    // Peer messages

    async fn handle_frame(&mut self, frame: Option<SyncResult<SyncMessage>>) {
        let result = match frame {
            None => {
                tracing::info!(setup = %self.shared.setup, "peer closed the channel");
                self.session = None;
                self.set_state(SyncState::Disconnected);
                return;
            }
            Some(Ok(message)) => {
                tracing::trace!(setup = %self.shared.setup, kind = message.kind(), "received");
                self.handle_message(message).await
            }
            Some(Err(err)) => Err(err),
        };
        if let Err(err) = result {
            self.fail(err);
        }
    }

    async fn handle_message(&mut self, message: SyncMessage) -> SyncResult<()> {
        match message {
            SyncMessage::Welcome(welcome) => self.on_welcome(welcome).await,
            SyncMessage::SyncRequest(request) => self.on_sync_request(request).await,
            SyncMessage::ChangeBatch(batch) => self.on_change_batch(batch).await,
            SyncMessage::Acknowledge(ack) => self.on_acknowledge(ack).await,
            SyncMessage::Close(close) => {
                self.on_close(close);
                Ok(())
            }
        }
    }

    async fn on_welcome(&mut self, welcome: Welcome) -> SyncResult<()> {
        let (known_peer, welcome_sent) = {
            let session = self.session_mut()?;
            (session.peer, session.welcome_sent)
        };
        if known_peer.is_some() {
            return Err(SyncError::protocol("duplicate welcome"));
        }
        welcome.check_version(self.config.protocol_version)?;
        let peer = welcome.device_id;
        if peer == self.shared.device_id {
            return Err(SyncError::authentication("peer presented this device's id"));
        }
        if welcome.offered_key().is_some_and(|key| self.keys.recognizes_own_key(key)) {
            return Err(SyncError::authentication("peer presented this device's key"));
        }

        self.keys
            .accept_welcome(
                peer,
                welcome.key_index,
                welcome.offered_key(),
                &welcome.rotation,
                &welcome.signature_data(),
                &welcome.signature,
            )
            .map_err(|err| {
                if err.is_authentication() {
                    SyncError::Authentication(err.to_string())
                } else {
                    SyncError::Keys(err)
                }
            })?;

        self.store.touch_peer(peer).await?;
        let has_changes = self.store.pending_count().await? > 0;
        let cursor = self.store.cursor(peer).await?;
        if !welcome_sent {
            let key_index = self.key_index();
            let confirmed = self.store.peer_state(peer).await?.confirmed_key_index;
            self.send_welcome(confirmed != Some(key_index), has_changes)?;
        }

        let request_id = self.next_request_id();
        let session = self.session_mut()?;
        session.peer = Some(peer);
        session.request_id = request_id;
        session.inbound_complete = false;
        session.send(SyncMessage::SyncRequest(SyncRequest {
            request_id,
            since: cursor,
        }))?;

        let local_seq = self.store.last_seq().await?;
        tracing::info!(
            setup = %self.shared.setup,
            %peer,
            key_index = welcome.key_index,
            cursor = ?cursor,
            local_seq,
            "peer authenticated"
        );
        let next = if welcome.has_changes || has_changes || cursor.is_none() {
            SyncState::Loading
        } else {
            SyncState::Synced
        };
        self.set_state(next);
        Ok(())
    }

    async fn on_sync_request(&mut self, request: SyncRequest) -> SyncResult<()> {
        let peer = self.peer()?;
        // The peer verified our welcome before asking.
        self.store.confirm_key_index(peer, self.key_index()).await?;

        let mut since = request.since.unwrap_or(0);
        let mut sent = 0;
        loop {
            let records = self.store.changes_since(since, self.batch_size, false).await?;
            let complete = records.len() < self.batch_size;
            let last_seq = records.last().map_or(since, |record| record.seq);
            sent += records.len();

            let session = self.session_mut()?;
            session.peer_request = Some(request.request_id);
            session.send(SyncMessage::ChangeBatch(ChangeBatch {
                request_id: request.request_id,
                records,
                last_seq,
                complete,
            }))?;
            session.unacked = Some(last_seq);
            session.last_sent = session.last_sent.max(last_seq);
            since = last_seq;
            if complete {
                break;
            }
        }

        tracing::debug!(setup = %self.shared.setup, %peer, since = ?request.since, sent, "answered sync request");
        if sent > 0 && self.state() == SyncState::Synced {
            self.set_state(SyncState::Syncing);
        }
        Ok(())
    }

    async fn on_change_batch(&mut self, batch: ChangeBatch) -> SyncResult<()> {
        let peer = self.peer()?;
        {
            let session = self.session_mut()?;
            if batch.request_id != session.request_id || session.retry_at.is_some() {
                tracing::debug!(
                    request_id = batch.request_id,
                    expected = session.request_id,
                    "dropping stale change batch"
                );
                return Ok(());
            }
        }
        if !batch.records.is_empty() && self.state() == SyncState::Synced {
            self.set_state(SyncState::Syncing);
        }

        let ChangeBatch {
            records,
            last_seq,
            complete,
            ..
        } = batch;
        match self.store.apply_batch(peer, records, last_seq).await {
            Ok(outcome) => {
                let session = self.session_mut()?;
                session.attempts = 0;
                session.send(SyncMessage::Acknowledge(Acknowledge { cursor: last_seq }))?;
                if complete {
                    session.inbound_complete = true;
                }
                if outcome.merged > 0 {
                    tracing::info!(setup = %self.shared.setup, %peer, merged = outcome.merged, "resolved conflicts");
                }
                self.refresh_pending().await?;
                self.settle();
                Ok(())
            }
            Err(err) if err.is_transient() => self.schedule_retry(err),
            Err(err) => Err(err.into()),
        }
    }

    /// Leaves the cursor where it is and re-requests from it later.
    fn schedule_retry(&mut self, err: CoreError) -> SyncResult<()> {
        let retry = self.config.retry.clone();
        let session = self.session_mut()?;
        session.attempts += 1;
        let attempt = session.attempts;
        if attempt >= retry.max_attempts {
            return Err(SyncError::RetriesExhausted {
                attempts: attempt,
                source: err,
            });
        }
        let delay = retry.delay_for_attempt(attempt);
        session.retry_at = Some(Instant::now() + delay);
        tracing::warn!(
            setup = %self.shared.setup,
            %err,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "applying change batch failed, retrying"
        );
        Ok(())
    }

    async fn handle_retry(&mut self) {
        if let Err(err) = self.request_changes(false).await {
            self.fail(err);
        }
    }

    async fn on_acknowledge(&mut self, ack: Acknowledge) -> SyncResult<()> {
        let peer = self.peer()?;
        let cleared = self.store.acknowledge(peer, ack.cursor).await?;
        let session = self.session_mut()?;
        if session.unacked.is_some_and(|seq| seq <= ack.cursor) {
            session.unacked = None;
        }
        tracing::debug!(setup = %self.shared.setup, %peer, cursor = ack.cursor, cleared, "peer acknowledged");
        self.refresh_pending().await?;
        self.settle();
        Ok(())
    }

    fn on_close(&mut self, close: Close) {
        self.session = None;
        if close.authentication {
            tracing::warn!(setup = %self.shared.setup, reason = %close.reason, "peer rejected our welcome");
            self.set_auth_error(Some(close.reason));
            self.set_state(SyncState::Error);
        } else {
            tracing::info!(setup = %self.shared.setup, reason = %close.reason, "peer closed the session");
            self.set_state(SyncState::Disconnected);
        }
    }

    // Local changes

    async fn handle_store_event(&mut self, event: Option<StoreEvent>) {
        if event.is_none() {
            self.store_events = None;
            return;
        }
        if let Some(events) = self.store_events.as_mut() {
            // Coalesce a burst into one pass.
            events.drain();
        }
        let result = match self.refresh_pending().await {
            Ok(()) => self.push_pending().await.map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.fail(err);
        }
    }
}
