//! Entity state store

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use super::entities::EntityRecord;
use super::patch::{apply_patch, diff_entities, entity_id, Patch};
use super::types::{PatchOrigin, StreamKey};
use crate::error::StoreError;
use crate::util::{lock, read, write};

/// A batch of patches produced by one mutation of one stream.
#[derive(Debug, Clone)]
pub struct PatchEvent {
    pub stream: StreamKey,
    /// Stream version after the batch was applied; increases by one per batch.
    pub version: u64,
    pub patches: Vec<Patch>,
    pub origin: PatchOrigin,
}

type Listener = Arc<dyn Fn(&PatchEvent) + Send + Sync>;

#[derive(Default, Clone)]
struct StreamState {
    version: u64,
    entities: Vec<Value>,
}

/// Entity state store
///
/// Holds one ordered collection per (entity kind × state kind) stream. Every
/// mutation is diffed against the previous snapshot and the resulting patches
/// are delivered synchronously to every subscriber before the mutating call
/// returns. Mutations are serialized, so per-stream patch order is total.
///
/// Listeners run while the mutation lock is held: they must not mutate the
/// store themselves (forward the event to a channel instead).
#[derive(Clone)]
pub struct EntityStateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    streams: RwLock<HashMap<StreamKey, StreamState>>,
    /// Serializes mutation + notification. Holds the last stream version
    /// applied from each remote peer.
    write_lock: Mutex<HashMap<(String, StreamKey), u64>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
}

impl EntityStateStore {
    pub fn new() -> Self {
        let inner = StoreInner {
            streams: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Current ordered snapshot of a stream, typed.
    pub fn get_current_state<T: EntityRecord>(&self) -> Result<Vec<T>, StoreError> {
        let raw = self.snapshot(T::stream());
        decode_all(T::stream(), &raw)
    }

    /// Current ordered snapshot of a stream as raw JSON records.
    pub fn snapshot(&self, stream: StreamKey) -> Vec<Value> {
        read(&self.inner.streams)
            .get(&stream)
            .map(|s| s.entities.clone())
            .unwrap_or_default()
    }

    /// Snapshot and the version it was taken at, read together.
    pub fn versioned_snapshot(&self, stream: StreamKey) -> (u64, Vec<Value>) {
        read(&self.inner.streams)
            .get(&stream)
            .map(|s| (s.version, s.entities.clone()))
            .unwrap_or_default()
    }

    pub fn version(&self, stream: StreamKey) -> u64 {
        read(&self.inner.streams)
            .get(&stream)
            .map(|s| s.version)
            .unwrap_or(0)
    }

    pub fn get_entity_by_id<T: EntityRecord>(&self, id: &str) -> Result<Option<T>, StoreError> {
        let streams = read(&self.inner.streams);
        let Some(state) = streams.get(&T::stream()) else {
            return Ok(None);
        };
        state
            .entities
            .iter()
            .find(|v| entity_id(v) == Some(id))
            .map(|v| decode(T::stream(), v))
            .transpose()
    }

    /// First entity whose top-level `field` equals `value`.
    pub fn get_by_field<T: EntityRecord>(
        &self,
        field: &str,
        value: &Value,
    ) -> Result<Option<T>, StoreError> {
        let streams = read(&self.inner.streams);
        let Some(state) = streams.get(&T::stream()) else {
            return Ok(None);
        };
        state
            .entities
            .iter()
            .find(|v| v.get(field) == Some(value))
            .map(|v| decode(T::stream(), v))
            .transpose()
    }

    /// Apply a mutation to a stream.
    ///
    /// The mutator works on a typed copy of the snapshot. If it fails the
    /// snapshot is left untouched and nothing is published.
    pub fn update_state<T, R, F>(&self, mutator: F) -> Result<R, StoreError>
    where
        T: EntityRecord,
        F: FnOnce(&mut Vec<T>) -> Result<R, StoreError>,
    {
        let stream = T::stream();
        let _guard = lock(&self.inner.write_lock);

        let old = self.snapshot(stream);
        let mut typed: Vec<T> = decode_all(stream, &old)?;
        let out = mutator(&mut typed)?;
        let new = typed
            .iter()
            .map(|e| serde_json::to_value(e).map_err(|source| StoreError::Encode { stream, source }))
            .collect::<Result<Vec<_>, _>>()?;

        let patches = diff_entities(&old, &new);
        if patches.is_empty() {
            return Ok(out);
        }

        let version = self.commit(stream, new);
        self.publish(&PatchEvent {
            stream,
            version,
            patches,
            origin: PatchOrigin::Local,
        });
        Ok(out)
    }

    /// Update a single entity by id.
    pub fn update_entity<T, F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        T: EntityRecord,
        F: FnOnce(&mut T),
    {
        self.update_state::<T, _, _>(|entities| {
            let entity = entities
                .iter_mut()
                .find(|e| e.id() == id)
                .ok_or_else(|| StoreError::NotFound {
                    stream: T::stream(),
                    id: id.to_string(),
                })?;
            f(entity);
            Ok(())
        })
    }

    /// Insert an entity at the end of its stream (creation order).
    pub fn insert<T: EntityRecord>(&self, entity: T) -> Result<(), StoreError> {
        self.update_state::<T, _, _>(|entities| {
            if entities.iter().any(|e| e.id() == entity.id()) {
                return Err(StoreError::Rejected(format!(
                    "{} already holds '{}'",
                    T::stream(),
                    entity.id()
                )));
            }
            entities.push(entity);
            Ok(())
        })
    }

    /// Remove an entity; emits a tombstone patch if it existed.
    pub fn remove<T: EntityRecord>(&self, id: &str) -> Result<bool, StoreError> {
        self.update_state::<T, _, _>(|entities| {
            let before = entities.len();
            entities.retain(|e| e.id() != id);
            Ok(entities.len() != before)
        })
    }

    /// Apply externally received patches in order.
    ///
    /// Idempotent: patches already reflected in the snapshot are no-ops. Only
    /// the patches that changed something are republished, tagged with
    /// `origin`; a batch that changes nothing publishes nothing.
    pub fn apply_patches(
        &self,
        stream: StreamKey,
        patches: &[Patch],
        origin: PatchOrigin,
    ) -> Result<usize, StoreError> {
        let _guard = lock(&self.inner.write_lock);
        self.apply_locked(stream, patches, origin)
    }

    /// Like [`apply_patches`](Self::apply_patches) for a batch that left the
    /// sender at stream `version`. A batch from a remote peer whose version
    /// is not newer than the last one applied from that peer is stale
    /// (duplicate or reordered delivery) and is dropped.
    pub fn apply_versioned(
        &self,
        stream: StreamKey,
        version: u64,
        patches: &[Patch],
        origin: PatchOrigin,
    ) -> Result<usize, StoreError> {
        let mut seen = lock(&self.inner.write_lock);
        let key = match &origin {
            PatchOrigin::Remote(peer) => (peer.clone(), stream),
            PatchOrigin::Local => return self.apply_locked(stream, patches, origin.clone()),
        };
        if let Some(last) = seen.get(&key).copied() {
            if version <= last {
                tracing::debug!(peer = %key.0, stream = %stream, version, last, "stale patch batch dropped");
                return Ok(0);
            }
        }
        let applied = self.apply_locked(stream, patches, origin)?;
        seen.insert(key, version);
        Ok(applied)
    }

    /// Drop the version marks kept for a disconnected peer.
    pub fn forget_peer(&self, peer: &str) {
        lock(&self.inner.write_lock).retain(|(p, _), _| p != peer);
    }

    fn apply_locked(
        &self,
        stream: StreamKey,
        patches: &[Patch],
        origin: PatchOrigin,
    ) -> Result<usize, StoreError> {
        let mut entities = self.snapshot(stream);
        let mut effective = Vec::new();
        for patch in patches {
            if apply_patch(&mut entities, patch)? {
                effective.push(patch.clone());
            }
        }

        if effective.is_empty() {
            return Ok(0);
        }

        let applied = effective.len();
        let version = self.commit(stream, entities);
        self.publish(&PatchEvent {
            stream,
            version,
            patches: effective,
            origin,
        });
        Ok(applied)
    }

    /// Replace a whole stream (hydration from disk). Emits the diff.
    pub fn replace_stream(&self, stream: StreamKey, entities: Vec<Value>) -> Result<(), StoreError> {
        let _guard = lock(&self.inner.write_lock);

        let old = self.snapshot(stream);
        let patches = diff_entities(&old, &entities);
        if patches.is_empty() {
            return Ok(());
        }
        let version = self.commit(stream, entities);
        self.publish(&PatchEvent {
            stream,
            version,
            patches,
            origin: PatchOrigin::Local,
        });
        Ok(())
    }

    /// Register a patch observer. Dropping the returned handle unsubscribes.
    pub fn subscribe_patches<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PatchEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    fn commit(&self, stream: StreamKey, entities: Vec<Value>) -> u64 {
        let mut streams = write(&self.inner.streams);
        let state = streams.entry(stream).or_default();
        state.version += 1;
        state.entities = entities;
        state.version
    }

    fn publish(&self, event: &PatchEvent) {
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        tracing::trace!(
            stream = %event.stream,
            version = event.version,
            patches = event.patches.len(),
            "publish patches"
        );
        for listener in listeners {
            listener(event);
        }
    }
}

impl Default for EntityStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`EntityStateStore::subscribe_patches`].
pub struct Subscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            lock(&inner.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

fn decode<T: EntityRecord>(stream: StreamKey, value: &Value) -> Result<T, StoreError> {
    serde_json::from_value(value.clone()).map_err(|source| StoreError::Decode { stream, source })
}

fn decode_all<T: EntityRecord>(stream: StreamKey, values: &[Value]) -> Result<Vec<T>, StoreError> {
    values.iter().map(|v| decode(stream, v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::entities::{DerivedTable, PersistentModel};
    use crate::state::types::{EntityStatus, StateKind, EntityKind};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn model(id: &str, name: &str) -> PersistentModel {
        PersistentModel {
            id: id.into(),
            name: name.into(),
            query: "select 1".into(),
            file_name: format!("{name}.sql"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_update_emits_patches_before_returning() {
        let store = EntityStateStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = store.subscribe_patches(move |ev| {
            sink.lock().unwrap().push((ev.stream, ev.version, ev.patches.len()));
        });

        store.insert(model("m1", "orders")).unwrap();
        store
            .update_entity::<PersistentModel, _>("m1", |m| m.query = "select 2".into())
            .unwrap();

        let stream = StreamKey::new(EntityKind::Model, StateKind::Persistent);
        assert_eq!(*seen.lock().unwrap(), vec![(stream, 1, 1), (stream, 2, 1)]);
    }

    #[test]
    fn test_failed_mutator_leaves_snapshot() {
        let store = EntityStateStore::new();
        store.insert(model("m1", "orders")).unwrap();
        let events = Arc::new(AtomicU64::new(0));
        let counter = events.clone();
        let _sub = store.subscribe_patches(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = store.update_state::<PersistentModel, (), _>(|models| {
            models[0].name = "changed".into();
            Err(StoreError::Rejected("nope".into()))
        });

        assert!(result.is_err());
        let models = store.get_current_state::<PersistentModel>().unwrap();
        assert_eq!(models[0].name, "orders");
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_apply_patches_is_idempotent() {
        let source = EntityStateStore::new();
        let replica = EntityStateStore::new();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();
        let _sub = source.subscribe_patches(move |ev| sink.lock().unwrap().push(ev.clone()));

        source
            .insert(DerivedTable::fresh_for_test("t1", EntityStatus::Importing))
            .unwrap();
        source
            .update_entity::<DerivedTable, _>("t1", |t| t.status = EntityStatus::Idle)
            .unwrap();

        let events = recorded.lock().unwrap().clone();
        let peer = PatchOrigin::Remote("peer".into());
        for ev in &events {
            let applied = replica
                .apply_versioned(ev.stream, ev.version, &ev.patches, peer.clone())
                .unwrap();
            assert_eq!(applied, 1);
        }
        // duplicate delivery of the whole sequence
        for ev in &events {
            let applied = replica
                .apply_versioned(ev.stream, ev.version, &ev.patches, peer.clone())
                .unwrap();
            assert_eq!(applied, 0);
        }
        // echo of the latest batch without a version
        let last = &events[1];
        assert_eq!(replica.apply_patches(last.stream, &last.patches, peer).unwrap(), 0);

        let stream = DerivedTable::stream();
        assert_eq!(replica.snapshot(stream), source.snapshot(stream));
    }

    #[test]
    fn test_late_add_does_not_regress_newer_state() {
        let source = EntityStateStore::new();
        let replica = EntityStateStore::new();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();
        let _sub = source.subscribe_patches(move |ev| sink.lock().unwrap().push(ev.clone()));

        source
            .insert(DerivedTable::fresh_for_test("t1", EntityStatus::Importing))
            .unwrap();
        source
            .update_entity::<DerivedTable, _>("t1", |t| t.status = EntityStatus::Idle)
            .unwrap();
        let events = recorded.lock().unwrap().clone();

        let republished = Arc::new(AtomicU64::new(0));
        let counter = republished.clone();
        let _replica_sub = replica.subscribe_patches(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let peer = PatchOrigin::Remote("peer".into());
        for ev in &events {
            replica
                .apply_versioned(ev.stream, ev.version, &ev.patches, peer.clone())
                .unwrap();
        }
        let version = replica.version(DerivedTable::stream());

        let first = &events[0];
        let applied = replica
            .apply_versioned(first.stream, first.version, &first.patches, peer.clone())
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(replica.version(DerivedTable::stream()), version);
        assert_eq!(republished.load(Ordering::SeqCst), 2);
        let t1 = replica.get_entity_by_id::<DerivedTable>("t1").unwrap().unwrap();
        assert_eq!(t1.status, EntityStatus::Idle);

        // Another peer has its own sequence.
        let other = PatchOrigin::Remote("other".into());
        let applied = replica
            .apply_versioned(first.stream, first.version, &first.patches, other)
            .unwrap();
        assert_eq!(applied, 1);

        // A reconnect starts over.
        replica.forget_peer("peer");
        let applied = replica
            .apply_versioned(events[1].stream, events[1].version, &events[1].patches, peer)
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_lookup_helpers() {
        let store = EntityStateStore::new();
        store.insert(model("m1", "orders")).unwrap();
        store.insert(model("m2", "users")).unwrap();

        let by_id = store.get_entity_by_id::<PersistentModel>("m2").unwrap();
        assert_eq!(by_id.map(|m| m.name), Some("users".to_string()));

        let by_name = store
            .get_by_field::<PersistentModel>("name", &Value::from("orders"))
            .unwrap();
        assert_eq!(by_name.map(|m| m.id), Some("m1".to_string()));

        assert!(store
            .get_entity_by_id::<PersistentModel>("missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unsubscribe() {
        let store = EntityStateStore::new();
        let sub = store.subscribe_patches(|_| {});
        assert_eq!(store.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_remove_emits_tombstone() {
        let store = EntityStateStore::new();
        store.insert(model("m1", "orders")).unwrap();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();
        let _sub = store.subscribe_patches(move |ev| sink.lock().unwrap().push(ev.clone()));

        assert!(store.remove::<PersistentModel>("m1").unwrap());
        assert!(!store.remove::<PersistentModel>("m1").unwrap());

        let events = recorded.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].patches, vec![Patch::remove("m1")]);
    }

    impl DerivedTable {
        fn fresh_for_test(id: &str, status: EntityStatus) -> Self {
            use crate::state::entities::DerivedRecord;
            DerivedTable::fresh(id.to_string(), status)
        }
    }
}
