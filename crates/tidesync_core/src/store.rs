//! Asynchronous object store façade.
//!
//! Every operation runs on the setup's worker pool with a scoped
//! connection handle and completes through a future. Writes for one key
//! always go to the same worker.

use crate::broker::{ConnectionBroker, SetupContext};
use crate::change_feed::StoreEvents;
use crate::error::{CoreError, CoreResult};
use crate::replica::{apply_records, ApplyOutcome, BatchContext};
use crate::serializer::{from_value, to_value, DataObject};
use crate::types::{ChangeEvent, ChangeRecord, ObjectKey, StoreEvent, StoredObject};
use ciborium::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tidesync_storage::{ObjectRow, PeerState, RowWrite, SqliteBackend};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Handle on one setup's objects. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LocalStore {
    setup: Arc<SetupContext>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn route_for(type_name: &str, key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    type_name.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

impl LocalStore {
    /// Creates a store for a registered setup.
    pub fn new(setup: Arc<SetupContext>) -> Self {
        Self { setup }
    }

    /// Creates a store for setup `name` of `broker`.
    pub fn open(broker: &ConnectionBroker, name: &str) -> CoreResult<Self> {
        Ok(Self::new(broker.setup(name)?))
    }

    /// The setup name.
    pub fn setup_name(&self) -> &str {
        self.setup.name()
    }

    /// The setup context.
    pub fn setup(&self) -> &Arc<SetupContext> {
        &self.setup
    }

    /// Subscribes to `dataChanged` / `dataResetted` notifications.
    pub fn subscribe(&self) -> StoreEvents {
        self.setup.feed().subscribe()
    }

    async fn run<T, F>(&self, route: Option<u64>, f: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SetupContext, &mut SqliteBackend) -> CoreResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.setup.submit(
            route,
            Box::new(move |db| {
                let result = db.and_then(|db| {
                    let mut backend = db.backend();
                    f(db.setup().as_ref(), &mut *backend)
                });
                let _ = tx.send(result);
            }),
        )?;
        rx.await
            .map_err(|_| CoreError::worker_unavailable("worker dropped the request"))?
    }

    fn decode(setup: &SetupContext, row: &ObjectRow) -> CoreResult<Value> {
        setup.config().serializer.decode(&row.type_name, &row.payload)
    }

    /// Number of live objects of `type_name`.
    pub async fn count(&self, type_name: &str) -> CoreResult<u64> {
        let type_name = type_name.to_string();
        self.run(None, move |_, backend| Ok(backend.count(&type_name)?))
            .await
    }

    /// Keys of all live objects of `type_name`, ascending.
    pub async fn keys(&self, type_name: &str) -> CoreResult<Vec<String>> {
        let type_name = type_name.to_string();
        self.run(None, move |_, backend| Ok(backend.keys(&type_name)?))
            .await
    }

    /// All live objects of `type_name`, ordered by key.
    pub async fn load_all(&self, type_name: &str) -> CoreResult<Vec<Value>> {
        let type_name = type_name.to_string();
        self.run(None, move |setup, backend| {
            backend
                .load_all(&type_name)?
                .iter()
                .map(|row| Self::decode(setup, row))
                .collect()
        })
        .await
    }

    /// Loads one live object.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the key is absent or deleted.
    pub async fn load(&self, type_name: &str, key: &str) -> CoreResult<Value> {
        let object_key = ObjectKey::new(type_name, key);
        self.run(None, move |setup, backend| {
            match backend.get(&object_key.type_name, &object_key.id)? {
                Some(row) if !row.tombstone => Self::decode(setup, &row),
                _ => Err(CoreError::NotFound(object_key)),
            }
        })
        .await
    }

    /// Reads the stored version of an object, tombstones included.
    pub async fn get_object(&self, type_name: &str, key: &str) -> CoreResult<Option<StoredObject>> {
        let (type_name, key) = (type_name.to_string(), key.to_string());
        self.run(None, move |setup, backend| {
            Ok(backend
                .get(&type_name, &key)?
                .map(|row| StoredObject::from_row(row, setup.name())))
        })
        .await
    }

    /// Inserts or replaces an object and returns its new version.
    ///
    /// The version is the current time in milliseconds, raised above the
    /// previous version of the key if the clock lags.
    pub async fn save(&self, type_name: &str, key: &str, value: &Value) -> CoreResult<u64> {
        let payload = self.setup.config().serializer.encode(type_name, value)?;
        let object_key = ObjectKey::new(type_name, key);
        let route = route_for(type_name, key);
        self.run(Some(route), move |setup, backend| {
            let origin = setup.device_id(backend)?;
            setup.commit(backend, |txn| {
                let previous = txn.get(&object_key.type_name, &object_key.id)?;
                let version = previous
                    .map_or(0, |row| row.version.saturating_add(1))
                    .max(now_ms());
                txn.put(RowWrite {
                    type_name: &object_key.type_name,
                    key: &object_key.id,
                    payload: &payload,
                    version,
                    origin: *origin.as_bytes(),
                    tombstone: false,
                    pending: true,
                })?;
                tracing::trace!(setup = %setup.name(), key = %object_key, version, "saved object");
                let event = StoreEvent::Changed(ChangeEvent {
                    key: object_key.clone(),
                    deleted: false,
                });
                Ok((version, vec![event]))
            })
        })
        .await
    }

    /// Marks an object deleted. Returns whether a live object existed.
    pub async fn remove(&self, type_name: &str, key: &str) -> CoreResult<bool> {
        let object_key = ObjectKey::new(type_name, key);
        let route = route_for(type_name, key);
        self.run(Some(route), move |setup, backend| {
            let origin = setup.device_id(backend)?;
            setup.commit(backend, |txn| {
                let previous = match txn.get(&object_key.type_name, &object_key.id)? {
                    Some(row) if !row.tombstone => row,
                    _ => return Ok((false, Vec::new())),
                };
                let version = previous.version.saturating_add(1).max(now_ms());
                txn.put(RowWrite {
                    type_name: &object_key.type_name,
                    key: &object_key.id,
                    payload: &[],
                    version,
                    origin: *origin.as_bytes(),
                    tombstone: true,
                    pending: true,
                })?;
                tracing::trace!(setup = %setup.name(), key = %object_key, version, "removed object");
                let event = StoreEvent::Changed(ChangeEvent {
                    key: object_key.clone(),
                    deleted: true,
                });
                Ok((true, vec![event]))
            })
        })
        .await
    }

    /// Live objects whose key matches a glob pattern (`*`, `?`, `[abc]`).
    pub async fn search(&self, type_name: &str, pattern: &str) -> CoreResult<Vec<Value>> {
        let (type_name, pattern) = (type_name.to_string(), pattern.to_string());
        self.run(None, move |setup, backend| {
            backend
                .search(&type_name, &pattern)?
                .iter()
                .map(|row| Self::decode(setup, row))
                .collect()
        })
        .await
    }

    /// Erases every object and all replication state, then emits
    /// [`StoreEvent::Reset`].
    pub async fn reset(&self) -> CoreResult<()> {
        self.run(None, |setup, backend| {
            setup.commit(backend, |txn| {
                txn.clear()?;
                Ok(((), vec![StoreEvent::Reset]))
            })?;
            tracing::info!(setup = %setup.name(), "reset local store");
            Ok(())
        })
        .await
    }

    /// Object type names present in the store.
    pub async fn type_names(&self) -> CoreResult<Vec<String>> {
        self.run(None, |_, backend| Ok(backend.type_names()?)).await
    }

    // Typed entry points.

    /// Number of live objects of type `T`.
    pub async fn count_of<T: DataObject>(&self) -> CoreResult<u64> {
        self.count(T::TYPE_NAME).await
    }

    /// Keys of all live objects of type `T`.
    pub async fn keys_of<T: DataObject>(&self) -> CoreResult<Vec<String>> {
        self.keys(T::TYPE_NAME).await
    }

    /// All live objects of type `T`.
    pub async fn load_all_of<T: DataObject>(&self) -> CoreResult<Vec<T>> {
        self.load_all(T::TYPE_NAME)
            .await?
            .into_iter()
            .map(from_value)
            .collect()
    }

    /// Loads one object of type `T`.
    pub async fn load_as<T: DataObject>(&self, key: &str) -> CoreResult<T> {
        from_value(self.load(T::TYPE_NAME, key).await?)
    }

    /// Saves `object` under its own key.
    pub async fn save_typed<T: DataObject>(&self, object: &T) -> CoreResult<u64> {
        let value = to_value(object)?;
        self.save(T::TYPE_NAME, &object.key(), &value).await
    }

    /// Deletes the object of type `T` with `key`.
    pub async fn remove_typed<T: DataObject>(&self, key: &str) -> CoreResult<bool> {
        self.remove(T::TYPE_NAME, key).await
    }

    /// Objects of type `T` whose key matches `pattern`.
    pub async fn search_of<T: DataObject>(&self, pattern: &str) -> CoreResult<Vec<T>> {
        self.search(T::TYPE_NAME, pattern)
            .await?
            .into_iter()
            .map(from_value)
            .collect()
    }

    // Replica operations used by the sync engine.

    /// The id this store stamps on local writes.
    pub async fn device_id(&self) -> CoreResult<Uuid> {
        self.run(None, |setup, backend| setup.device_id(backend))
            .await
    }

    /// Up to `limit` records committed after `since`, in sequence order.
    /// With `pending_only`, acknowledged rows are left out.
    pub async fn changes_since(
        &self,
        since: u64,
        limit: usize,
        pending_only: bool,
    ) -> CoreResult<Vec<ChangeRecord>> {
        self.run(None, move |_, backend| {
            Ok(backend
                .changes_since(since, limit, pending_only)?
                .into_iter()
                .map(ChangeRecord::from_row)
                .collect())
        })
        .await
    }

    /// Applies a batch from `peer` in one transaction and advances the
    /// peer's cursor to `last_seq`. On failure nothing is written and the
    /// cursor stays where it was.
    pub async fn apply_batch(
        &self,
        peer: Uuid,
        records: Vec<ChangeRecord>,
        last_seq: u64,
    ) -> CoreResult<ApplyOutcome> {
        self.run(None, move |setup, backend| {
            let config = setup.config();
            let ctx = BatchContext {
                setup: setup.name(),
                resolver: config.resolver.as_ref(),
                policy: config.options.delete_policy,
            };
            let outcome = setup.commit(backend, |txn| {
                apply_records(txn, &ctx, peer, &records, last_seq)
            })?;
            tracing::debug!(
                setup = %setup.name(),
                %peer,
                last_seq,
                applied = outcome.applied,
                merged = outcome.merged,
                skipped = outcome.skipped,
                "applied change batch"
            );
            Ok(outcome)
        })
        .await
    }

    /// Records that `peer` holds every local write up to `seq`. Returns the
    /// number of writes that stopped being pending.
    pub async fn acknowledge(&self, peer: Uuid, seq: u64) -> CoreResult<u64> {
        self.run(None, move |_, backend| {
            Ok(backend.write(|txn| txn.acknowledge(peer.as_bytes(), seq))?)
        })
        .await
    }

    /// Highest sequence number of `peer`'s stream applied locally.
    pub async fn cursor(&self, peer: Uuid) -> CoreResult<Option<u64>> {
        Ok(self.peer_state(peer).await?.cursor)
    }

    /// Forgets the cursor for `peer` so the next exchange is a full load.
    pub async fn clear_cursor(&self, peer: Uuid) -> CoreResult<()> {
        self.run(None, move |_, backend| {
            Ok(backend.write(|txn| txn.set_cursor(peer.as_bytes(), None))?)
        })
        .await
    }

    /// Replication bookkeeping for `peer`.
    pub async fn peer_state(&self, peer: Uuid) -> CoreResult<PeerState> {
        self.run(None, move |_, backend| Ok(backend.peer_state(peer.as_bytes())?))
            .await
    }

    /// Records that `peer` verified our key at `key_index`.
    pub async fn confirm_key_index(&self, peer: Uuid, key_index: u32) -> CoreResult<()> {
        self.run(None, move |_, backend| {
            Ok(backend.write(|txn| txn.set_confirmed_key_index(peer.as_bytes(), key_index))?)
        })
        .await
    }

    /// Marks `peer` as the most recent handshake partner.
    pub async fn touch_peer(&self, peer: Uuid) -> CoreResult<()> {
        self.run(None, move |_, backend| {
            Ok(backend.write(|txn| txn.touch_peer(peer.as_bytes(), now_ms()))?)
        })
        .await
    }

    /// The most recent handshake partner, if any.
    pub async fn last_peer(&self) -> CoreResult<Option<Uuid>> {
        self.run(None, |_, backend| {
            Ok(backend.last_peer()?.map(Uuid::from_bytes))
        })
        .await
    }

    /// Number of local writes not yet acknowledged by a peer.
    pub async fn pending_count(&self) -> CoreResult<u64> {
        self.run(None, |_, backend| Ok(backend.pending_count()?))
            .await
    }

    /// Highest local sequence number.
    pub async fn last_seq(&self) -> CoreResult<u64> {
        self.run(None, |_, backend| Ok(backend.last_seq()?)).await
    }
}
