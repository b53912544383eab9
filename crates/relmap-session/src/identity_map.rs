//! Identity Map with single-flight load coordination.
//!
//! The map guarantees one in-memory representation per persisted row within a
//! unit of work. Entries are keyed by `(TypeId, IdentityKey)` and are either
//! resolved (a shared `Arc<T>` plus its version) or loading (a shared handle
//! to the in-flight result).
//!
//! # Single flight
//!
//! [`IdentityMap::get_or_load`] claims a key by installing a loading slot in
//! the same critical section that checks for an existing entry. The claimant
//! runs the loader; everyone else who asks for the key while it is loading
//! waits on the same result. A failed load, a missing row, or a load that is
//! dropped before finishing removes the slot so the key can be retried.
//!
//! ```ignore
//! let hero = map
//!     .get_or_load::<Hero, _, _>(key, || async { load_from_db().await })
//!     .await;
//! ```

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use relmap_core::{Entity, Error, IdentityKey, Outcome, entity_name};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type AnyEntity = Arc<dyn Any + Send + Sync>;

/// Result broadcast from a load to its waiters.
type LoadResult = Result<Option<AnyEntity>, Arc<Error>>;

/// Map key: entity type plus identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    type_id: TypeId,
    key: IdentityKey,
}

impl ObjectKey {
    pub fn of<T: 'static>(key: IdentityKey) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            key,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }
}

enum Slot {
    Loading {
        load_id: u64,
        result: Shared<oneshot::Receiver<LoadResult>>,
    },
    Resolved {
        entity: AnyEntity,
        version: Option<i64>,
    },
}

/// What [`IdentityMap::publish`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// No entry existed (or only an in-flight load).
    Inserted,
    /// An older or equal version was replaced.
    Replaced,
    /// The cached entry has a newer version and was kept.
    Kept,
}

/// What a caller of `get_or_load` ended up doing.
enum Claim {
    Hit(AnyEntity),
    Wait(Shared<oneshot::Receiver<LoadResult>>),
    Lead(u64, oneshot::Sender<LoadResult>),
}

/// Per-unit-of-work identity map.
#[derive(Default)]
pub struct IdentityMap {
    slots: Mutex<HashMap<ObjectKey, Slot>>,
    next_load: AtomicU64,
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.lock();
        let loading = slots
            .values()
            .filter(|s| matches!(s, Slot::Loading { .. }))
            .count();
        f.debug_struct("IdentityMap")
            .field("resolved", &(slots.len() - loading))
            .field("loading", &loading)
            .finish()
    }
}

fn downcast<T: Entity>(entity: AnyEntity) -> Option<Arc<T>> {
    entity.downcast::<T>().ok()
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the entity for `key`, running `loader` only if no entry exists
    /// and no load is already in flight.
    ///
    /// `Ok(None)` means the row does not exist; nothing is cached for it.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: IdentityKey,
        loader: F,
    ) -> Outcome<Option<Arc<T>>, Error>
    where
        T: Entity,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<Option<T>, Error>>,
    {
        let object_key = ObjectKey::of::<T>(key);
        loop {
            match self.claim(&object_key) {
                Claim::Hit(entity) => {
                    tracing::trace!(
                        entity = entity_name::<T>(),
                        key = %object_key.key,
                        "Identity map hit"
                    );
                    return Outcome::Ok(downcast::<T>(entity));
                }
                Claim::Wait(result) => {
                    tracing::trace!(
                        entity = entity_name::<T>(),
                        key = %object_key.key,
                        "Waiting on in-flight load"
                    );
                    match result.await {
                        Ok(Ok(found)) => return Outcome::Ok(found.and_then(downcast::<T>)),
                        Ok(Err(e)) => return Outcome::Err(Error::Shared(e)),
                        // Leader was cancelled or dropped; claim again.
                        Err(oneshot::Canceled) => continue,
                    }
                }
                Claim::Lead(load_id, sender) => {
                    return self.lead(object_key, load_id, sender, loader).await;
                }
            }
        }
    }

    /// The indivisible insert-if-absent step.
    fn claim(&self, object_key: &ObjectKey) -> Claim {
        let mut slots = self.lock();
        match slots.entry(object_key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Resolved { entity, .. } => Claim::Hit(Arc::clone(entity)),
                Slot::Loading { result, .. } => Claim::Wait(result.clone()),
            },
            Entry::Vacant(entry) => {
                let load_id = self.next_load.fetch_add(1, Ordering::Relaxed);
                let (sender, receiver) = oneshot::channel();
                entry.insert(Slot::Loading {
                    load_id,
                    result: receiver.shared(),
                });
                Claim::Lead(load_id, sender)
            }
        }
    }

    async fn lead<T, F, Fut>(
        &self,
        object_key: ObjectKey,
        load_id: u64,
        sender: oneshot::Sender<LoadResult>,
        loader: F,
    ) -> Outcome<Option<Arc<T>>, Error>
    where
        T: Entity,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<Option<T>, Error>>,
    {
        let mut guard = LoadGuard {
            map: self,
            key: Some(object_key),
            load_id,
        };

        match loader().await {
            Outcome::Ok(Some(entity)) => {
                let version = entity.version();
                let loaded: Arc<T> = Arc::new(entity);
                let Some(object_key) = guard.key.take() else {
                    return Outcome::Ok(Some(loaded));
                };
                let resolved = self.install(object_key, load_id, loaded, version);
                let erased: AnyEntity = resolved.clone();
                let _ = sender.send(Ok(Some(erased)));
                Outcome::Ok(Some(resolved))
            }
            Outcome::Ok(None) => {
                guard.release();
                let _ = sender.send(Ok(None));
                Outcome::Ok(None)
            }
            Outcome::Err(e) => {
                guard.release();
                tracing::debug!(
                    entity = entity_name::<T>(),
                    error = %e,
                    "Load failed; identity map entry removed"
                );
                let shared = Arc::new(e);
                let _ = sender.send(Err(Arc::clone(&shared)));
                Outcome::Err(Error::Shared(shared))
            }
            // Dropping the sender wakes waiters, who then retry.
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Resolve the slot installed by `load_id`. If something else was
    /// published meanwhile, that entry wins and is returned instead. If the
    /// slot was evicted or cleared, the result is handed back uncached.
    fn install<T: Entity>(
        &self,
        object_key: ObjectKey,
        load_id: u64,
        loaded: Arc<T>,
        version: Option<i64>,
    ) -> Arc<T> {
        let mut slots = self.lock();
        match slots.get(&object_key) {
            Some(Slot::Loading { load_id: id, .. }) if *id == load_id => {}
            Some(Slot::Resolved { entity, .. }) => {
                if let Some(existing) = downcast::<T>(Arc::clone(entity)) {
                    return existing;
                }
            }
            _ => {
                tracing::trace!(
                    entity = entity_name::<T>(),
                    "Load slot gone; result not cached"
                );
                return loaded;
            }
        }
        let erased: AnyEntity = loaded.clone();
        slots.insert(
            object_key,
            Slot::Resolved {
                entity: erased,
                version,
            },
        );
        loaded
    }

    /// Write `entity` into the map, never replacing a cached entry that has a
    /// higher version. Unversioned entities always replace.
    pub fn publish<T: Entity>(&self, key: IdentityKey, entity: Arc<T>) -> Publish {
        let version = entity.version();
        let mut slots = self.lock();
        let object_key = ObjectKey::of::<T>(key);
        let outcome = match slots.get(&object_key) {
            Some(Slot::Resolved {
                version: Some(cached),
                ..
            }) if version.is_some_and(|incoming| incoming < *cached) => return Publish::Kept,
            Some(Slot::Resolved { .. }) => Publish::Replaced,
            Some(Slot::Loading { .. }) | None => Publish::Inserted,
        };
        let erased: AnyEntity = entity;
        slots.insert(
            object_key,
            Slot::Resolved {
                entity: erased,
                version,
            },
        );
        outcome
    }

    /// Insert `entity` unless the key is already resolved, returning whichever
    /// instance the map holds afterwards. Used for rows found by scans.
    ///
    /// A key that is still loading is resolved with `entity`; the pending
    /// load and its waiters then receive this same instance.
    pub fn adopt<T: Entity>(&self, key: IdentityKey, entity: T) -> Arc<T> {
        let mut slots = self.lock();
        let object_key = ObjectKey::of::<T>(key);
        if let Some(Slot::Resolved { entity: cached, .. }) = slots.get(&object_key) {
            if let Some(existing) = downcast::<T>(Arc::clone(cached)) {
                return existing;
            }
        }
        let version = entity.version();
        let adopted = Arc::new(entity);
        let erased: AnyEntity = adopted.clone();
        slots.insert(
            object_key,
            Slot::Resolved {
                entity: erased,
                version,
            },
        );
        adopted
    }

    /// Remove the entry for `key`, returning the resolved entity it held.
    pub fn evict<T: Entity>(&self, key: &IdentityKey) -> Option<Arc<T>> {
        match self.lock().remove(&ObjectKey::of::<T>(key.clone())) {
            Some(Slot::Resolved { entity, .. }) => downcast::<T>(entity),
            _ => None,
        }
    }

    /// Put a previously evicted entity back, unconditionally.
    pub fn restore<T: Entity>(&self, key: IdentityKey, entity: Arc<T>) {
        let version = entity.version();
        let erased: AnyEntity = entity;
        self.lock().insert(
            ObjectKey::of::<T>(key),
            Slot::Resolved {
                entity: erased,
                version,
            },
        );
    }

    /// The resolved entity for `key`, without loading.
    pub fn peek<T: Entity>(&self, key: &IdentityKey) -> Option<Arc<T>> {
        match self.lock().get(&ObjectKey::of::<T>(key.clone())) {
            Some(Slot::Resolved { entity, .. }) => downcast::<T>(Arc::clone(entity)),
            _ => None,
        }
    }

    /// Cached version of the resolved entity for `key`.
    pub fn version_of<T: Entity>(&self, key: &IdentityKey) -> Option<i64> {
        match self.lock().get(&ObjectKey::of::<T>(key.clone())) {
            Some(Slot::Resolved { version, .. }) => *version,
            _ => None,
        }
    }

    /// Whether `key` is resolved or loading.
    pub fn contains<T: Entity>(&self, key: &IdentityKey) -> bool {
        self.lock().contains_key(&ObjectKey::of::<T>(key.clone()))
    }

    /// Number of entries, resolved or loading.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry. In-flight loads finish but are not cached.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Removes a loading slot unless the load resolved it.
struct LoadGuard<'a> {
    map: &'a IdentityMap,
    key: Option<ObjectKey>,
    load_id: u64,
}

impl LoadGuard<'_> {
    fn release(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut slots = self.map.lock();
        if matches!(slots.get(&key), Some(Slot::Loading { load_id, .. }) if *load_id == self.load_id)
        {
            slots.remove(&key);
        }
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
