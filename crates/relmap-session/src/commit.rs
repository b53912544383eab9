//! Commit Helpers.
//!
//! Each change queue is driven by one helper at commit time:
//!
//! | Helper | Queue | Apply | Undo |
//! |--------|-------|-------|------|
//! | [`CreateHelper`] | new | insert, publish a speculative map entry | evict it, restore what it displaced |
//! | [`DirtyHelper`] | dirty | versioned update | nothing (the map was not touched) |
//! | [`DeleteHelper`] | removed | versioned delete, evict | restore the evicted entry |
//!
//! [`UpdateHelper`] runs after the connection commits and writes refreshed
//! new and dirty entities into the map, highest version first.

use crate::identity_map::{IdentityMap, ObjectKey, Publish};
use crate::mapper::SqlMapper;
use relmap_core::{Connection, Cx, Entity, EntityMeta, Error, IdentityKey, Outcome};
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A queued entity with its type erased, so one queue can hold every type.
pub(crate) trait QueuedEntity<C: Connection>: Send + Sync {
    fn entity_name(&self) -> &'static str;

    /// Identity-map key, once the entity has a complete identity key.
    fn object_key(&self) -> Option<ObjectKey>;

    fn insert<'a>(
        &'a mut self,
        cx: &'a Cx,
        conn: &'a C,
        mapper: SqlMapper,
        initial_version: i64,
    ) -> BoxFuture<'a, Outcome<(), Error>>;

    fn update<'a>(
        &'a mut self,
        cx: &'a Cx,
        conn: &'a C,
        mapper: SqlMapper,
    ) -> BoxFuture<'a, Outcome<(), Error>>;

    fn delete<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a C,
        mapper: SqlMapper,
    ) -> BoxFuture<'a, Outcome<(), Error>>;

    /// Write the current value unless the map holds a newer version.
    fn publish(&self, map: &IdentityMap) -> Option<Publish>;

    /// Publish during commit, remembering any entry that was replaced.
    fn publish_speculative(&mut self, map: &IdentityMap);

    /// Undo [`publish_speculative`](Self::publish_speculative).
    fn withdraw(&mut self, map: &IdentityMap);

    /// Evict the entry for this key, remembering what was there.
    fn evict(&mut self, map: &IdentityMap);

    /// Undo [`evict`](Self::evict).
    fn restore(&mut self, map: &IdentityMap);
}

/// One entity in a change queue.
pub(crate) struct Tracked<E: Entity> {
    entity: E,
    meta: Arc<EntityMeta>,
    /// Key this commit wrote or evicted in the map.
    touched: Option<IdentityKey>,
    /// Entry replaced or evicted by this commit.
    displaced: Option<Arc<E>>,
}

impl<E: Entity> Tracked<E> {
    pub(crate) fn new(entity: E, meta: Arc<EntityMeta>) -> Self {
        Self {
            entity,
            meta,
            touched: None,
            displaced: None,
        }
    }
}

impl<E: Entity, C: Connection> QueuedEntity<C> for Tracked<E> {
    fn entity_name(&self) -> &'static str {
        self.meta.entity()
    }

    fn object_key(&self) -> Option<ObjectKey> {
        self.entity.identity_key().map(ObjectKey::of::<E>)
    }

    fn insert<'a>(
        &'a mut self,
        cx: &'a Cx,
        conn: &'a C,
        mapper: SqlMapper,
        initial_version: i64,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            mapper
                .insert(cx, conn, &self.meta, &mut self.entity, initial_version)
                .await
        })
    }

    fn update<'a>(
        &'a mut self,
        cx: &'a Cx,
        conn: &'a C,
        mapper: SqlMapper,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move { mapper.update(cx, conn, &self.meta, &mut self.entity).await })
    }

    fn delete<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a C,
        mapper: SqlMapper,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move { mapper.delete(cx, conn, &self.meta, &self.entity).await })
    }

    fn publish(&self, map: &IdentityMap) -> Option<Publish> {
        let key = self.entity.identity_key()?;
        Some(map.publish(key, Arc::new(self.entity.clone())))
    }

    fn publish_speculative(&mut self, map: &IdentityMap) {
        let Some(key) = self.entity.identity_key() else {
            return;
        };
        let previous = map.peek::<E>(&key);
        if map.publish(key.clone(), Arc::new(self.entity.clone())) != Publish::Kept {
            self.displaced = previous;
            self.touched = Some(key);
        }
    }

    fn withdraw(&mut self, map: &IdentityMap) {
        let Some(key) = self.touched.take() else {
            return;
        };
        map.evict::<E>(&key);
        if let Some(previous) = self.displaced.take() {
            map.restore(key, previous);
        }
    }

    fn evict(&mut self, map: &IdentityMap) {
        let Some(key) = self.entity.identity_key() else {
            return;
        };
        self.displaced = map.evict::<E>(&key);
        self.touched = Some(key);
    }

    fn restore(&mut self, map: &IdentityMap) {
        let Some(key) = self.touched.take() else {
            return;
        };
        if let Some(previous) = self.displaced.take() {
            map.restore(key, previous);
        }
    }
}

pub(crate) type Queue<C> = Vec<Box<dyn QueuedEntity<C>>>;

/// Inserts the new queue.
pub(crate) struct CreateHelper<'q, C: Connection> {
    queue: &'q mut Queue<C>,
}

impl<'q, C: Connection> CreateHelper<'q, C> {
    pub(crate) fn new(queue: &'q mut Queue<C>) -> Self {
        Self { queue }
    }

    pub(crate) async fn apply(
        &mut self,
        cx: &Cx,
        conn: &C,
        mapper: SqlMapper,
        map: &IdentityMap,
        initial_version: i64,
    ) -> Outcome<(), Error> {
        for entry in self.queue.iter_mut() {
            match entry.insert(cx, conn, mapper, initial_version).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            entry.publish_speculative(map);
        }
        Outcome::Ok(())
    }

    /// Evict speculative entries, newest first.
    pub(crate) fn undo(&mut self, map: &IdentityMap) {
        for entry in self.queue.iter_mut().rev() {
            entry.withdraw(map);
        }
    }
}

/// Updates the dirty queue.
pub(crate) struct DirtyHelper<'q, C: Connection> {
    queue: &'q mut Queue<C>,
}

impl<'q, C: Connection> DirtyHelper<'q, C> {
    pub(crate) fn new(queue: &'q mut Queue<C>) -> Self {
        Self { queue }
    }

    pub(crate) async fn apply(&mut self, cx: &Cx, conn: &C, mapper: SqlMapper) -> Outcome<(), Error> {
        for entry in self.queue.iter_mut() {
            match entry.update(cx, conn, mapper).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }
}

/// Deletes the removed queue.
pub(crate) struct DeleteHelper<'q, C: Connection> {
    queue: &'q mut Queue<C>,
}

impl<'q, C: Connection> DeleteHelper<'q, C> {
    pub(crate) fn new(queue: &'q mut Queue<C>) -> Self {
        Self { queue }
    }

    pub(crate) async fn apply(
        &mut self,
        cx: &Cx,
        conn: &C,
        mapper: SqlMapper,
        map: &IdentityMap,
    ) -> Outcome<(), Error> {
        for entry in self.queue.iter_mut() {
            match entry.delete(cx, conn, mapper).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            entry.evict(map);
        }
        Outcome::Ok(())
    }

    pub(crate) fn undo(&mut self, map: &IdentityMap) {
        for entry in self.queue.iter_mut().rev() {
            entry.restore(map);
        }
    }

    /// Make sure no deleted row is left in the map.
    pub(crate) fn reconcile(&mut self, map: &IdentityMap) {
        for entry in self.queue.iter_mut() {
            entry.evict(map);
        }
    }
}

/// Post-commit reconciliation of the new and dirty queues.
pub(crate) struct UpdateHelper<'q, C: Connection> {
    queue: &'q Queue<C>,
}

impl<'q, C: Connection> UpdateHelper<'q, C> {
    pub(crate) fn new(queue: &'q Queue<C>) -> Self {
        Self { queue }
    }

    /// Publish every entry; returns how many were kept back by a newer
    /// cached version.
    pub(crate) fn reconcile(&self, map: &IdentityMap) -> usize {
        let mut kept = 0;
        for entry in self.queue {
            if entry.publish(map) == Some(Publish::Kept) {
                kept += 1;
                tracing::debug!(
                    entity = entry.entity_name(),
                    key = ?entry.object_key().map(|k| k.key().to_string()),
                    "Identity map holds a newer version; kept it"
                );
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Hero, MockConnection, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::MetadataRegistry;

    fn queue_of(heroes: Vec<Hero>) -> Queue<MockConnection> {
        let registry = MetadataRegistry::new();
        let meta = registry.meta::<Hero>().unwrap();
        heroes
            .into_iter()
            .map(|h| Box::new(Tracked::new(h, Arc::clone(&meta))) as Box<dyn QueuedEntity<MockConnection>>)
            .collect()
    }

    #[test]
    fn create_publishes_and_undo_restores_displaced() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let map = IdentityMap::new();
        let stale = Arc::new(Hero::stored(1, "Old", 0));
        map.restore(IdentityKey::from(1_i64), Arc::clone(&stale));

        let mut queue = queue_of(vec![Hero::stored(1, "New", 0), Hero::unsaved("Fresh")]);
        rt.block_on(async {
            let mut helper = CreateHelper::new(&mut queue);
            unwrap_outcome(helper.apply(&cx, &conn, SqlMapper::new(), &map, 1).await);
        });

        assert_eq!(map.peek::<Hero>(&IdentityKey::from(1_i64)).unwrap().name, "New");
        // The generated key came back from the connection.
        let generated = queue[1].object_key().expect("generated key");
        assert!(map.contains::<Hero>(generated.key()));

        CreateHelper::new(&mut queue).undo(&map);
        assert!(Arc::ptr_eq(
            &map.peek::<Hero>(&IdentityKey::from(1_i64)).unwrap(),
            &stale
        ));
        assert!(!map.contains::<Hero>(generated.key()));
    }

    #[test]
    fn dirty_conflict_leaves_map_untouched() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.script_affected([0]);
        let map = IdentityMap::new();
        let cached = Arc::new(Hero::stored(3, "Cached", 2));
        map.restore(IdentityKey::from(3_i64), Arc::clone(&cached));

        let mut queue = queue_of(vec![Hero::stored(3, "Edited", 2)]);
        let outcome = rt.block_on(async {
            DirtyHelper::new(&mut queue)
                .apply(&cx, &conn, SqlMapper::new())
                .await
        });
        let Outcome::Err(e) = outcome else {
            panic!("expected a conflict");
        };
        assert!(e.is_conflict(), "unexpected error: {e}");
        assert!(Arc::ptr_eq(
            &map.peek::<Hero>(&IdentityKey::from(3_i64)).unwrap(),
            &cached
        ));
    }

    #[test]
    fn delete_evicts_and_undo_restores() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let map = IdentityMap::new();
        let cached = Arc::new(Hero::stored(5, "Doomed", 1));
        map.restore(IdentityKey::from(5_i64), Arc::clone(&cached));

        let mut queue = queue_of(vec![Hero::stored(5, "Doomed", 1)]);
        rt.block_on(async {
            unwrap_outcome(
                DeleteHelper::new(&mut queue)
                    .apply(&cx, &conn, SqlMapper::new(), &map)
                    .await,
            );
        });
        assert!(!map.contains::<Hero>(&IdentityKey::from(5_i64)));

        DeleteHelper::new(&mut queue).undo(&map);
        assert!(Arc::ptr_eq(
            &map.peek::<Hero>(&IdentityKey::from(5_i64)).unwrap(),
            &cached
        ));
    }

    #[test]
    fn update_helper_never_downgrades() {
        let map = IdentityMap::new();
        map.restore(IdentityKey::from(9_i64), Arc::new(Hero::stored(9, "Newer", 4)));

        let queue = queue_of(vec![Hero::stored(9, "Older", 3), Hero::stored(10, "Other", 1)]);
        let kept = UpdateHelper::new(&queue).reconcile(&map);

        assert_eq!(kept, 1);
        assert_eq!(map.peek::<Hero>(&IdentityKey::from(9_i64)).unwrap().name, "Newer");
        assert_eq!(map.version_of::<Hero>(&IdentityKey::from(10_i64)), Some(1));
    }
}
