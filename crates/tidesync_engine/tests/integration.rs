//! End-to-end sessions between engines in one process.

use std::sync::Arc;
use std::time::Duration;

use tidesync_core::{ChangeRecord, ObjectKey, SetupOptions, StoredObject, Value};
use tidesync_engine::{
    Channel, ConnectFuture, Connector, MemoryConnector, RetryConfig, SyncConfig, SyncController,
    SyncEngine, SyncError, SyncEvent, SyncResult, SyncState,
};
use tidesync_keys::{
    handshake_payload, DeviceKeyManager, KeyManagerConfig, MemoryKeyStore, RotationLink,
};
use tidesync_protocol::{ChangeBatch, SyncMessage, SyncRequest, Welcome, PROTOCOL_VERSION};
use tidesync_testkit::{
    generate_data, generate_key, FailingResolver, LockedKeyStore, TestData, TestSetup,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

async fn spawn(setup: &TestSetup, connector: Option<Arc<dyn Connector>>) -> SyncController {
    let mut engine = SyncEngine::new(setup.store.clone(), Arc::new(MemoryKeyStore::new()));
    if let Some(connector) = connector {
        engine = engine.with_connector(connector);
    }
    engine.spawn().await.unwrap()
}

async fn dialing(setup: &TestSetup, peer: &SyncController) -> SyncController {
    spawn(setup, Some(Arc::new(MemoryConnector::new(peer.clone())))).await
}

async fn wait_for_state(controller: &SyncController, state: SyncState) {
    timeout(WAIT, async {
        while controller.state() != state {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state}, still {}", controller.state()));
}

fn drain_states(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    states
}

async fn note(setup: &TestSetup) -> Option<StoredObject> {
    setup.store.get_object("Note", "42").await.unwrap()
}

async fn next_message(channel: &mut Channel) -> SyncMessage {
    timeout(WAIT, channel.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
        .unwrap()
}

async fn next_request(channel: &mut Channel) -> SyncRequest {
    match next_message(channel).await {
        SyncMessage::SyncRequest(request) => request,
        other => panic!("expected a sync request, got {other:?}"),
    }
}

fn peer_manager(name: &str) -> DeviceKeyManager {
    let manager = DeviceKeyManager::new(Arc::new(MemoryKeyStore::new()), KeyManagerConfig::new(name));
    manager.load_or_create_identity().unwrap();
    manager
}

fn remote_note(id: &str, origin: uuid::Uuid, seq: u64) -> ChangeRecord {
    ChangeRecord {
        key: ObjectKey::new("Note", id),
        version: 1,
        origin,
        deleted: false,
        payload: b"remote".to_vec(),
        seq,
    }
}

/// Hands the far end of every dialed channel to the test.
struct HandOff(mpsc::UnboundedSender<Channel>);

impl Connector for HandOff {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let (near, far) = Channel::pair();
            self.0
                .send(far)
                .map_err(|_| SyncError::transport_fatal("test peer is gone"))?;
            Ok(near)
        })
    }
}

/// Spawns an engine for `setup` that dials a test-driven peer.
async fn scripted(
    setup: &TestSetup,
    config: SyncConfig,
) -> (SyncController, mpsc::UnboundedReceiver<Channel>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = SyncEngine::new(setup.store.clone(), Arc::new(MemoryKeyStore::new()))
        .with_config(config)
        .with_connector(Arc::new(HandOff(tx)))
        .spawn()
        .await
        .unwrap();
    (controller, rx)
}

fn quick_retry(max_attempts: u32) -> SyncConfig {
    SyncConfig::new().with_retry(
        RetryConfig::new(max_attempts)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_load_copies_remote_objects() {
    let b = TestSetup::new("b").unwrap();
    for n in 0..3 {
        b.store.save_typed(&generate_data(n)).await.unwrap();
    }
    let b_sync = spawn(&b, None).await;

    let a = TestSetup::new("a").unwrap();
    let a_sync = dialing(&a, &b_sync).await;
    let mut events = a_sync.subscribe();

    assert_eq!(a_sync.state(), SyncState::Disconnected);
    assert_eq!(a_sync.sync().await, SyncState::Synced);
    assert_eq!(
        drain_states(&mut events),
        vec![
            SyncState::Connecting,
            SyncState::Handshaking,
            SyncState::Loading,
            SyncState::Synced
        ]
    );

    assert_eq!(a.store.count_of::<TestData>().await.unwrap(), 3);
    for n in 0..3 {
        let key = generate_key(n);
        let ours = a.store.get_object(&key.type_name, &key.id).await.unwrap().unwrap();
        let theirs = b.store.get_object(&key.type_name, &key.id).await.unwrap().unwrap();
        assert_eq!(ours.version, theirs.version);
        assert_eq!(ours.payload, theirs.payload);
        assert_eq!(a.store.load_as::<TestData>(&key.id).await.unwrap(), generate_data(n));
    }

    wait_for_state(&b_sync, SyncState::Synced).await;
    assert_eq!(b_sync.pending_operations(), 0);
    assert_eq!(a.resolver.merges(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_edits_merge_once_and_converge() {
    let a = TestSetup::new("a").unwrap();
    let b = TestSetup::new("b").unwrap();
    b.store
        .save("Note", "42", &Value::Text("original".into()))
        .await
        .unwrap();

    let b_sync = spawn(&b, None).await;
    let a_sync = dialing(&a, &b_sync).await;
    assert_eq!(a_sync.sync().await, SyncState::Synced);
    wait_for_state(&b_sync, SyncState::Synced).await;

    a_sync.disconnect();
    wait_for_state(&a_sync, SyncState::Disconnected).await;
    wait_for_state(&b_sync, SyncState::Disconnected).await;

    a.store
        .save("Note", "42", &Value::Text("edited on a".into()))
        .await
        .unwrap();
    b.store
        .save("Note", "42", &Value::Text("edited on b".into()))
        .await
        .unwrap();

    assert_eq!(a_sync.sync().await, SyncState::Synced);
    wait_for_state(&b_sync, SyncState::Synced).await;

    timeout(WAIT, async {
        loop {
            let (ours, theirs) = (note(&a).await.unwrap(), note(&b).await.unwrap());
            if ours.same_content(&theirs) && a_sync.pending_operations() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replicas did not converge");

    assert_eq!(a.resolver.merges(), 1);
    assert_eq!(b.resolver.merges(), 1);

    let winner = note(&a).await.unwrap();
    assert_eq!(winner.version, note(&b).await.unwrap().version);
    assert_eq!(winner.origin, note(&b).await.unwrap().origin);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_writes_stream_while_connected() {
    let a = TestSetup::new("a").unwrap();
    let b = TestSetup::new("b").unwrap();
    let b_sync = spawn(&b, None).await;
    let a_sync = dialing(&a, &b_sync).await;
    assert_eq!(a_sync.sync().await, SyncState::Synced);

    a.store.save_typed(&generate_data(9)).await.unwrap();
    timeout(WAIT, async {
        while b.store.count_of::<TestData>().await.unwrap() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("write was not streamed");

    assert!(a.store.remove_typed::<TestData>("9").await.unwrap());
    timeout(WAIT, async {
        while b.store.count_of::<TestData>().await.unwrap() != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("deletion was not streamed");

    let tombstone = b.store.get_object("TestData", "9").await.unwrap().unwrap();
    assert!(tombstone.tombstone);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downgraded_welcome_is_rejected() {
    let b = TestSetup::new("b").unwrap();
    let b_sync = spawn(&b, None).await;
    let mut events = b_sync.subscribe();

    let fake = DeviceKeyManager::new(Arc::new(MemoryKeyStore::new()), KeyManagerConfig::new("x"));
    fake.load_or_create_identity().unwrap();
    let identity = fake.rotate_key().unwrap();
    assert_eq!(identity.key_index, 1);

    // First contact at index 1 is trusted.
    let (mut local, remote) = Channel::pair();
    b_sync.accept(remote).unwrap();
    local
        .send(&SyncMessage::Welcome(Welcome::signed(&fake, false, true).unwrap()))
        .unwrap();
    assert!(matches!(next_message(&mut local).await, SyncMessage::Welcome(_)));
    assert!(matches!(
        next_message(&mut local).await,
        SyncMessage::SyncRequest(_)
    ));
    drop(local);

    // A validly signed welcome claiming index 0 is a downgrade.
    let (mut local, remote) = Channel::pair();
    b_sync.accept(remote).unwrap();
    let mut downgraded = Welcome {
        protocol_version: PROTOCOL_VERSION,
        device_id: identity.device_id,
        has_changes: false,
        key_index: 0,
        scheme: fake.scheme().to_string(),
        key: identity.public_key.to_vec(),
        signature: Vec::new(),
        rotation: Vec::new(),
    };
    downgraded.signature = fake.sign(&downgraded.signature_data()).unwrap();
    local.send(&SyncMessage::Welcome(downgraded)).unwrap();

    match next_message(&mut local).await {
        SyncMessage::Close(close) => assert!(close.authentication),
        other => panic!("expected close, got {other:?}"),
    }
    wait_for_state(&b_sync, SyncState::Error).await;
    assert!(b_sync.authentication_error().is_some());

    let mut saw_auth_event = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::AuthenticationErrorChanged(Some(_))) {
            saw_auth_event = true;
        }
    }
    assert!(saw_auth_event);

    // Error is sticky for plain syncs; a resync clears the error.
    assert_eq!(b_sync.sync().await, SyncState::Error);
    assert_eq!(b_sync.resync().await, SyncState::Disconnected);
    assert_eq!(b_sync.authentication_error(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forged_signature_is_rejected() {
    let b = TestSetup::new("b").unwrap();
    let b_sync = spawn(&b, None).await;

    let honest = DeviceKeyManager::new(Arc::new(MemoryKeyStore::new()), KeyManagerConfig::new("h"));
    honest.load_or_create_identity().unwrap();
    let mut welcome = Welcome::signed(&honest, false, true).unwrap();
    welcome.device_id = uuid::Uuid::new_v4();

    let (mut local, remote) = Channel::pair();
    b_sync.accept(remote).unwrap();
    local.send(&SyncMessage::Welcome(welcome)).unwrap();

    assert!(matches!(
        next_message(&mut local).await,
        SyncMessage::Close(close) if close.authentication
    ));
    wait_for_state(&b_sync, SyncState::Error).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reflected_key_is_rejected() {
    let b = TestSetup::new("b").unwrap();
    let b_sync = spawn(&b, None).await;
    let own = b_sync.identity();

    let welcome = Welcome {
        protocol_version: PROTOCOL_VERSION,
        device_id: uuid::Uuid::new_v4(),
        has_changes: false,
        key_index: own.key_index,
        scheme: peer_manager("x").scheme().to_string(),
        key: own.public_key.to_vec(),
        signature: vec![0; 64],
        rotation: Vec::new(),
    };
    let (mut local, remote) = Channel::pair();
    b_sync.accept(remote).unwrap();
    local.send(&SyncMessage::Welcome(welcome)).unwrap();

    assert!(matches!(
        next_message(&mut local).await,
        SyncMessage::Close(close) if close.authentication
    ));
    wait_for_state(&b_sync, SyncState::Error).await;
    assert!(b_sync
        .authentication_error()
        .is_some_and(|reason| reason.contains("this device's key")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rotated_key_is_accepted_end_to_end() {
    let a = TestSetup::new("a").unwrap();
    let b = TestSetup::new("b").unwrap();
    let b_sync = spawn(&b, None).await;
    let a_sync = dialing(&a, &b_sync).await;
    assert_eq!(a_sync.sync().await, SyncState::Synced);

    let rotated = a_sync.rotate_key().await.unwrap();
    assert_eq!(rotated.key_index, 1);
    assert_eq!(a_sync.identity(), rotated);
    assert_eq!(a_sync.state(), SyncState::Disconnected);

    a.store.save_typed(&generate_data(1)).await.unwrap();
    assert_eq!(a_sync.sync().await, SyncState::Synced);
    assert_eq!(a_sync.authentication_error(), None);

    let peer_state = a.store.peer_state(b_sync.device_id()).await.unwrap();
    assert_eq!(peer_state.confirmed_key_index, Some(1));

    wait_for_state(&b_sync, SyncState::Synced).await;
    assert_eq!(b_sync.authentication_error(), None);
    assert_eq!(b.store.count_of::<TestData>().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_reloads_everything() {
    let a = TestSetup::new("a").unwrap();
    let b = TestSetup::new("b").unwrap();
    for n in 0..5 {
        b.store.save_typed(&generate_data(n)).await.unwrap();
    }
    let b_sync = SyncEngine::new(b.store.clone(), Arc::new(MemoryKeyStore::new()))
        .with_config(SyncConfig::new().with_batch_size(2))
        .spawn()
        .await
        .unwrap();
    let a_sync = dialing(&a, &b_sync).await;

    assert_eq!(a_sync.sync().await, SyncState::Synced);
    assert_eq!(a.store.count_of::<TestData>().await.unwrap(), 5);
    let cursor = a.store.cursor(b_sync.device_id()).await.unwrap();
    assert!(cursor.is_some());

    a.store.reset().await.unwrap();
    assert_eq!(a.store.count_of::<TestData>().await.unwrap(), 0);

    assert_eq!(a_sync.resync().await, SyncState::Synced);
    assert_eq!(a.store.count_of::<TestData>().await.unwrap(), 5);
    assert_eq!(a.store.cursor(b_sync.device_id()).await.unwrap(), cursor);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callbacks_fire_once_with_terminal_state() {
    let a = TestSetup::new("a").unwrap();
    let a_sync = spawn(&a, None).await;

    // No connector: the trigger settles as disconnected.
    let (tx, rx) = std::sync::mpsc::channel();
    let first = tx.clone();
    a_sync.trigger_sync_with_result(move |state| first.send(state).unwrap());
    a_sync.trigger_resync_with_result(move |state| tx.send(state).unwrap());

    let states: Vec<_> = (0..2)
        .map(|_| rx.recv_timeout(WAIT).unwrap())
        .collect();
    assert_eq!(states, vec![SyncState::Disconnected, SyncState::Disconnected]);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_completes_later_triggers() {
    let a = TestSetup::new("a").unwrap();
    let a_sync = spawn(&a, None).await;
    a_sync.shutdown();

    timeout(WAIT, async {
        while a_sync.is_running() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(a_sync.sync().await, SyncState::Disconnected);
    assert!(matches!(
        a_sync.accept(Channel::pair().0),
        Err(SyncError::NotConnected)
    ));
}

#[tokio::test]
async fn locked_key_store_fails_spawn() {
    let a = TestSetup::new("a").unwrap();
    let err = SyncEngine::new(a.store.clone(), Arc::new(LockedKeyStore))
        .spawn()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Keys(_)));
}

/// Links two engines through a framed byte stream.
struct DuplexConnector {
    peer: SyncController,
}

impl Connector for DuplexConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let (near, far) = tokio::io::duplex(64 * 1024);
            self.peer.accept(Channel::from_stream(far))?;
            Ok(Channel::from_stream(near))
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_over_byte_stream() {
    let a = TestSetup::new("a").unwrap();
    let b = TestSetup::new("b").unwrap();
    b.store.save_typed(&generate_data(3)).await.unwrap();
    let b_sync = spawn(&b, None).await;
    let a_sync = spawn(
        &a,
        Some(Arc::new(DuplexConnector {
            peer: b_sync.clone(),
        })),
    )
    .await;

    assert_eq!(a_sync.sync().await, SyncState::Synced);
    assert_eq!(a.store.load_as::<TestData>("3").await.unwrap(), generate_data(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unendorsed_rotation_is_rejected() {
    let b = TestSetup::new("b").unwrap();
    let b_sync = spawn(&b, None).await;

    let honest = peer_manager("h");
    let identity = honest.identity().unwrap();
    let (mut local, remote) = Channel::pair();
    b_sync.accept(remote).unwrap();
    local
        .send(&SyncMessage::Welcome(Welcome::signed(&honest, false, true).unwrap()))
        .unwrap();
    assert!(matches!(next_message(&mut local).await, SyncMessage::Welcome(_)));
    next_request(&mut local).await;
    drop(local);
    wait_for_state(&b_sync, SyncState::Disconnected).await;

    // Someone else claims the device at the next index and endorses the
    // key with itself.
    let intruder = peer_manager("i");
    let stolen = intruder.identity().unwrap().public_key;
    let scheme = intruder.scheme();
    let endorsement = intruder
        .sign(&handshake_payload(1, scheme, identity.device_id, &stolen))
        .unwrap();
    let mut forged = Welcome {
        protocol_version: PROTOCOL_VERSION,
        device_id: identity.device_id,
        has_changes: false,
        key_index: 1,
        scheme: scheme.to_string(),
        key: stolen.to_vec(),
        signature: Vec::new(),
        rotation: vec![RotationLink {
            key_index: 1,
            public_key: stolen,
            endorsement,
        }],
    };
    forged.signature = intruder.sign(&forged.signature_data()).unwrap();

    let (mut local, remote) = Channel::pair();
    b_sync.accept(remote).unwrap();
    local.send(&SyncMessage::Welcome(forged)).unwrap();
    assert!(matches!(
        next_message(&mut local).await,
        SyncMessage::Close(close) if close.authentication
    ));
    wait_for_state(&b_sync, SyncState::Error).await;
    assert!(b_sync.authentication_error().is_some());

    // The honest device still gets in with its genuine rotation.
    honest.rotate_key().unwrap();
    assert_eq!(b_sync.resync().await, SyncState::Disconnected);
    let (mut local, remote) = Channel::pair();
    b_sync.accept(remote).unwrap();
    local
        .send(&SyncMessage::Welcome(Welcome::signed(&honest, false, true).unwrap()))
        .unwrap();
    assert!(matches!(next_message(&mut local).await, SyncMessage::Welcome(_)));
    next_request(&mut local).await;
    assert_eq!(b_sync.authentication_error(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_merge_is_retried_from_the_same_cursor() {
    let resolver = FailingResolver::transient(1);
    let a = TestSetup::with_resolver("a", SetupOptions::default(), Arc::new(resolver.clone()))
        .unwrap();
    a.store
        .save("Note", "42", &Value::Text("local".into()))
        .await
        .unwrap();
    let (a_sync, mut dialed) = scripted(&a, quick_retry(3)).await;
    let syncing = tokio::spawn({
        let a_sync = a_sync.clone();
        async move { a_sync.sync().await }
    });

    let mut peer = timeout(WAIT, dialed.recv()).await.unwrap().unwrap();
    assert!(matches!(next_message(&mut peer).await, SyncMessage::Welcome(_)));
    let keys = peer_manager("p");
    let peer_id = keys.identity().unwrap().device_id;
    peer.send(&SyncMessage::Welcome(Welcome::signed(&keys, true, true).unwrap()))
        .unwrap();

    let request = next_request(&mut peer).await;
    assert_eq!(request.since, None);
    peer.send(&SyncMessage::ChangeBatch(ChangeBatch {
        request_id: request.request_id,
        records: vec![remote_note("7", peer_id, 1)],
        last_seq: 1,
        complete: false,
    }))
    .unwrap();
    assert!(matches!(
        next_message(&mut peer).await,
        SyncMessage::Acknowledge(ack) if ack.cursor == 1
    ));
    peer.send(&SyncMessage::ChangeBatch(ChangeBatch {
        request_id: request.request_id,
        records: vec![remote_note("42", peer_id, 2)],
        last_seq: 2,
        complete: true,
    }))
    .unwrap();

    // The failed batch is asked for again from where the cursor stopped.
    let retry = next_request(&mut peer).await;
    assert_eq!(retry.since, Some(1));
    assert_ne!(retry.request_id, request.request_id);
    assert_eq!(resolver.remaining(), 0);
    assert_eq!(a.store.cursor(peer_id).await.unwrap(), Some(1));

    peer.send(&SyncMessage::ChangeBatch(ChangeBatch {
        request_id: retry.request_id,
        records: vec![remote_note("42", peer_id, 2)],
        last_seq: 2,
        complete: true,
    }))
    .unwrap();
    assert!(matches!(
        next_message(&mut peer).await,
        SyncMessage::Acknowledge(ack) if ack.cursor == 2
    ));

    assert_eq!(timeout(WAIT, syncing).await.unwrap().unwrap(), SyncState::Synced);
    assert_eq!(a.store.cursor(peer_id).await.unwrap(), Some(2));
    assert_eq!(a.resolver.merges(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_merges_give_up_into_error() {
    let a = TestSetup::with_resolver(
        "a",
        SetupOptions::default(),
        Arc::new(FailingResolver::transient(usize::MAX)),
    )
    .unwrap();
    a.store
        .save("Note", "42", &Value::Text("local".into()))
        .await
        .unwrap();
    let (a_sync, mut dialed) = scripted(&a, quick_retry(2)).await;
    let syncing = tokio::spawn({
        let a_sync = a_sync.clone();
        async move { a_sync.sync().await }
    });

    let mut peer = timeout(WAIT, dialed.recv()).await.unwrap().unwrap();
    assert!(matches!(next_message(&mut peer).await, SyncMessage::Welcome(_)));
    let keys = peer_manager("p");
    let peer_id = keys.identity().unwrap().device_id;
    peer.send(&SyncMessage::Welcome(Welcome::signed(&keys, true, true).unwrap()))
        .unwrap();

    for _ in 0..2 {
        let request = next_request(&mut peer).await;
        assert_eq!(request.since, None);
        peer.send(&SyncMessage::ChangeBatch(ChangeBatch {
            request_id: request.request_id,
            records: vec![remote_note("42", peer_id, 1)],
            last_seq: 1,
            complete: true,
        }))
        .unwrap();
    }
    assert!(matches!(
        next_message(&mut peer).await,
        SyncMessage::Close(close) if !close.authentication
    ));

    assert_eq!(timeout(WAIT, syncing).await.unwrap().unwrap(), SyncState::Error);
    assert_eq!(a.store.cursor(peer_id).await.unwrap(), None);
    assert_eq!(a.resolver.merges(), 2);
    assert_ne!(note(&a).await.unwrap().payload, b"remote".to_vec());
    assert_eq!(a_sync.authentication_error(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_merge_only_ends_the_session() {
    let a = TestSetup::with_resolver(
        "a",
        SetupOptions::default(),
        Arc::new(FailingResolver::rejecting(1)),
    )
    .unwrap();
    let b = TestSetup::new("b").unwrap();
    b.store
        .save("Note", "42", &Value::Text("original".into()))
        .await
        .unwrap();

    let b_sync = spawn(&b, None).await;
    let a_sync = dialing(&a, &b_sync).await;
    assert_eq!(a_sync.sync().await, SyncState::Synced);
    let cursor = a.store.cursor(b_sync.device_id()).await.unwrap();
    a_sync.disconnect();
    wait_for_state(&a_sync, SyncState::Disconnected).await;
    wait_for_state(&b_sync, SyncState::Disconnected).await;

    a.store
        .save("Note", "42", &Value::Text("edited on a".into()))
        .await
        .unwrap();
    b.store
        .save("Note", "42", &Value::Text("edited on b".into()))
        .await
        .unwrap();

    assert_eq!(a_sync.sync().await, SyncState::Disconnected);
    assert_eq!(a_sync.authentication_error(), None);
    assert_eq!(a.store.cursor(b_sync.device_id()).await.unwrap(), cursor);

    // Nothing sticks: the next sync goes through.
    wait_for_state(&b_sync, SyncState::Disconnected).await;
    assert_eq!(a_sync.sync().await, SyncState::Synced);
    timeout(WAIT, async {
        loop {
            let (ours, theirs) = (note(&a).await.unwrap(), note(&b).await.unwrap());
            if ours.same_content(&theirs) && a_sync.pending_operations() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replicas did not converge");
}

/// Never finishes connecting.
struct Unreachable;

impl Connector for Unreachable {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(std::future::pending::<SyncResult<Channel>>())
    }
}

#[tokio::test]
async fn stalled_connect_times_out() {
    let a = TestSetup::new("a").unwrap();
    let a_sync = SyncEngine::new(a.store.clone(), Arc::new(MemoryKeyStore::new()))
        .with_config(SyncConfig::new().with_timeout(Duration::from_millis(50)))
        .with_connector(Arc::new(Unreachable))
        .spawn()
        .await
        .unwrap();
    let mut events = a_sync.subscribe();

    let state = timeout(WAIT, a_sync.sync()).await.expect("connect never gave up");
    assert_eq!(state, SyncState::Disconnected);
    assert_eq!(
        drain_states(&mut events),
        vec![SyncState::Connecting, SyncState::Disconnected]
    );
    assert_eq!(a_sync.authentication_error(), None);
}
