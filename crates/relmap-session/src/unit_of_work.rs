//! The Unit of Work: one transaction's connection, identity map and change
//! queues.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──commit──▶ Committing ──▶ Committed
//!                      │
//!                      └─failure─▶ RollingBack ──▶ RolledBack (failure re-raised)
//! Idle ──rollback──▶ RollingBack ──▶ RolledBack
//! ```
//!
//! Registration only touches the in-memory queues. The connection is
//! acquired on the first load or at commit, and closed exactly once when the
//! unit of work reaches a terminal state. A finished unit of work rejects
//! every further operation with [`UsageErrorKind::Finished`].
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(provider, registry);
//! let hero = uow.get::<Hero>(&cx, 7_i64).await?;
//! let mut edited = (*hero).clone();
//! edited.name = "Spider-Man".into();
//! uow.register_dirty(edited)?;
//! uow.register_new(Hero::new("Rusty-Man"))?;
//! uow.commit(&cx).await?;
//! ```

use crate::commit::{CreateHelper, DeleteHelper, DirtyHelper, Queue, Tracked, UpdateHelper};
use crate::identity_map::{IdentityMap, ObjectKey};
use crate::mapper::SqlMapper;
use asupersync::sync::Mutex;
use relmap_core::{
    ConfigError, Connection, ConnectionError, ConnectionErrorKind, ConnectionProvider, Cx, Entity,
    EntitySource, Error, IdentityKey, JoinTable, MetadataRegistry, NotFoundError, Outcome, Result,
    TransactionConfig, TransactionError, TransactionErrorKind, UsageErrorKind, Value, entity_name,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Configuration for a [`UnitOfWork`].
#[derive(Debug, Clone)]
pub struct UnitOfWorkConfig {
    /// Passed to the provider when the connection is opened.
    pub transaction: TransactionConfig,
    /// Version written for newly inserted versioned entities.
    pub initial_version: i64,
    /// Emit every statement at debug level.
    pub log_sql: bool,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            transaction: TransactionConfig::default(),
            initial_version: 1,
            log_sql: false,
        }
    }
}

impl UnitOfWorkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn initial_version(mut self, version: i64) -> Self {
        self.initial_version = version;
        self
    }

    pub fn log_sql(mut self, enabled: bool) -> Self {
        self.log_sql = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_version < 0 {
            return Err(Error::Config(ConfigError {
                message: format!(
                    "initial_version must be non-negative, got {}",
                    self.initial_version
                ),
                source: None,
            }));
        }
        Ok(())
    }
}

/// Where a unit of work is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UowState {
    Idle,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl UowState {
    /// Committed or rolled back; nothing more can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, UowState::Committed | UowState::RolledBack)
    }
}

/// Count of queued entities by queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub new: usize,
    /// Entities pending UPDATE.
    pub dirty: usize,
    /// Entities pending DELETE.
    pub removed: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.removed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    New,
    Dirty,
    Removed,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueKind::New => "new",
            QueueKind::Dirty => "dirty",
            QueueKind::Removed => "removed",
        })
    }
}

/// One logical transaction.
pub struct UnitOfWork<P: ConnectionProvider> {
    provider: Arc<P>,
    registry: Arc<MetadataRegistry>,
    config: UnitOfWorkConfig,
    mapper: SqlMapper,
    connection: OnceLock<P::Conn>,
    connect_lock: Mutex<()>,
    identity_map: IdentityMap,
    new: Queue<P::Conn>,
    dirty: Queue<P::Conn>,
    removed: Queue<P::Conn>,
    /// Queue membership of every keyed entity.
    membership: HashMap<ObjectKey, QueueKind>,
    state: UowState,
}

impl<P: ConnectionProvider> fmt::Debug for UnitOfWork<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &self.state)
            .field("pending", &self.pending())
            .field("connected", &self.has_connection())
            .field("identity_map", &self.identity_map)
            .finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider> UnitOfWork<P> {
    /// Create a unit of work with the default configuration.
    pub fn new(provider: Arc<P>, registry: Arc<MetadataRegistry>) -> Self {
        Self::build(provider, registry, UnitOfWorkConfig::default())
    }

    /// Create a unit of work, rejecting an invalid configuration.
    pub fn with_config(
        provider: Arc<P>,
        registry: Arc<MetadataRegistry>,
        config: UnitOfWorkConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(provider, registry, config))
    }

    fn build(provider: Arc<P>, registry: Arc<MetadataRegistry>, config: UnitOfWorkConfig) -> Self {
        Self {
            provider,
            registry,
            mapper: SqlMapper::new().log_sql(config.log_sql),
            config,
            connection: OnceLock::new(),
            connect_lock: Mutex::new(()),
            identity_map: IdentityMap::new(),
            new: Vec::new(),
            dirty: Vec::new(),
            removed: Vec::new(),
            membership: HashMap::new(),
            state: UowState::Idle,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> UowState {
        self.state
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Whether a connection has been acquired and not yet closed.
    pub fn has_connection(&self) -> bool {
        self.connection.get().is_some()
    }

    pub fn pending(&self) -> PendingCounts {
        PendingCounts {
            new: self.new.len(),
            dirty: self.dirty.len(),
            removed: self.removed.len(),
        }
    }

    pub fn is_new<E: Entity>(&self, entity: &E) -> bool {
        self.queue_of(entity) == Some(QueueKind::New)
    }

    pub fn is_dirty<E: Entity>(&self, entity: &E) -> bool {
        self.queue_of(entity) == Some(QueueKind::Dirty)
    }

    pub fn is_removed<E: Entity>(&self, entity: &E) -> bool {
        self.queue_of(entity) == Some(QueueKind::Removed)
    }

    fn queue_of<E: Entity>(&self, entity: &E) -> Option<QueueKind> {
        let key = entity.identity_key()?;
        self.membership.get(&ObjectKey::of::<E>(key)).copied()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            UowState::Idle => Ok(()),
            UowState::Committing | UowState::RollingBack => Err(Error::usage(
                UsageErrorKind::Busy,
                None,
                format!("unit of work is {:?}; an earlier commit or rollback did not finish", self.state),
            )),
            UowState::Committed | UowState::RolledBack => Err(Error::usage(
                UsageErrorKind::Finished,
                None,
                format!("unit of work is already {:?}", self.state),
            )),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Queue `entity` for insertion.
    ///
    /// The entity needs an identity key unless its type has a database
    /// generated key. Registering an entity that is already new refreshes the
    /// queued value; one that is dirty or removed is rejected.
    pub fn register_new<E: Entity>(&mut self, entity: E) -> Result<()> {
        self.ensure_open()?;
        let meta = self.registry.meta::<E>()?;
        let Some(key) = entity.identity_key() else {
            if !meta.has_generated_key() {
                return Err(Error::usage(
                    UsageErrorKind::MissingKey,
                    Some(meta.entity()),
                    "register_new requires an identity key",
                ));
            }
            tracing::debug!(entity = meta.entity(), "Registered new entity, key pending");
            self.new.push(Box::new(Tracked::new(entity, meta)));
            return Ok(());
        };

        let object_key = ObjectKey::of::<E>(key);
        match self.membership.get(&object_key).copied() {
            Some(QueueKind::New) => {
                self.refresh(QueueKind::New, &object_key, Tracked::new(entity, meta));
                Ok(())
            }
            Some(kind) => Err(Error::usage(
                UsageErrorKind::ConflictingRegistration,
                Some(meta.entity()),
                format!("{} is already registered {kind}", object_key.key()),
            )),
            None => {
                tracing::debug!(entity = meta.entity(), key = %object_key.key(), "Registered new");
                self.new.push(Box::new(Tracked::new(entity, meta)));
                self.membership.insert(object_key, QueueKind::New);
                Ok(())
            }
        }
    }

    /// Queue `entity` for update.
    ///
    /// Fails if the entity is already removed. An entity already new or dirty
    /// stays where it is, with its queued value refreshed.
    pub fn register_dirty<E: Entity>(&mut self, entity: E) -> Result<()> {
        self.ensure_open()?;
        let meta = self.registry.meta::<E>()?;
        let Some(key) = entity.identity_key() else {
            return Err(Error::usage(
                UsageErrorKind::MissingKey,
                Some(meta.entity()),
                "register_dirty requires an identity key",
            ));
        };

        let object_key = ObjectKey::of::<E>(key);
        match self.membership.get(&object_key).copied() {
            Some(QueueKind::Removed) => Err(Error::usage(
                UsageErrorKind::ConflictingRegistration,
                Some(meta.entity()),
                format!("{} is already registered removed", object_key.key()),
            )),
            Some(kind) => {
                self.refresh(kind, &object_key, Tracked::new(entity, meta));
                Ok(())
            }
            None => {
                tracing::debug!(entity = meta.entity(), key = %object_key.key(), "Registered dirty");
                self.dirty.push(Box::new(Tracked::new(entity, meta)));
                self.membership.insert(object_key, QueueKind::Dirty);
                Ok(())
            }
        }
    }

    /// Queue `entity` for deletion.
    ///
    /// An entity that is still new is simply dropped from the new queue, so a
    /// row that was never written is never deleted. A dirty entity moves to
    /// the removed queue.
    pub fn register_removed<E: Entity>(&mut self, entity: E) -> Result<()> {
        self.ensure_open()?;
        let meta = self.registry.meta::<E>()?;
        let Some(key) = entity.identity_key() else {
            return Err(Error::usage(
                UsageErrorKind::MissingKey,
                Some(meta.entity()),
                "register_removed requires an identity key",
            ));
        };

        let object_key = ObjectKey::of::<E>(key);
        match self.membership.get(&object_key).copied() {
            Some(QueueKind::New) => {
                Self::take(&mut self.new, &object_key);
                self.membership.remove(&object_key);
                tracing::debug!(
                    entity = meta.entity(),
                    key = %object_key.key(),
                    "Removed a new entity before it was written"
                );
            }
            Some(QueueKind::Removed) => {
                self.refresh(QueueKind::Removed, &object_key, Tracked::new(entity, meta));
            }
            Some(QueueKind::Dirty) | None => {
                Self::take(&mut self.dirty, &object_key);
                tracing::debug!(entity = meta.entity(), key = %object_key.key(), "Registered removed");
                self.removed.push(Box::new(Tracked::new(entity, meta)));
                self.membership.insert(object_key, QueueKind::Removed);
            }
        }
        Ok(())
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut Queue<P::Conn> {
        match kind {
            QueueKind::New => &mut self.new,
            QueueKind::Dirty => &mut self.dirty,
            QueueKind::Removed => &mut self.removed,
        }
    }

    fn position(queue: &Queue<P::Conn>, object_key: &ObjectKey) -> Option<usize> {
        queue
            .iter()
            .position(|entry| entry.object_key().as_ref() == Some(object_key))
    }

    fn take(queue: &mut Queue<P::Conn>, object_key: &ObjectKey) {
        if let Some(index) = Self::position(queue, object_key) {
            queue.remove(index);
        }
    }

    fn refresh<E: Entity>(&mut self, kind: QueueKind, object_key: &ObjectKey, tracked: Tracked<E>) {
        let queue = self.queue_mut(kind);
        if let Some(index) = Self::position(queue, object_key) {
            queue[index] = Box::new(tracked);
        }
        tracing::trace!(key = %object_key.key(), queue = %kind, "Refreshed queued entity");
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Acquire the connection on first use.
    async fn acquire(&self, cx: &Cx) -> Outcome<&P::Conn, Error> {
        if let Some(conn) = self.connection.get() {
            return Outcome::Ok(conn);
        }
        let Ok(_guard) = self.connect_lock.lock(cx).await else {
            return Outcome::Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Failed to acquire connection lock".to_string(),
                source: None,
            }));
        };
        if let Some(conn) = self.connection.get() {
            return Outcome::Ok(conn);
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        match self.provider.connect(cx, &self.config.transaction).await {
            Outcome::Ok(conn) => {
                tracing::debug!(
                    isolation = self.config.transaction.isolation.as_sql(),
                    read_only = self.config.transaction.read_only,
                    "Connection acquired"
                );
                Outcome::Ok(self.connection.get_or_init(|| conn))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn load<T: Entity>(&self, cx: &Cx, key: IdentityKey) -> Outcome<Option<Arc<T>>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let meta = match self.registry.meta::<T>() {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        let mapper = self.mapper;
        let lookup = key.clone();
        self.identity_map
            .get_or_load::<T, _, _>(key, || async move {
                let conn = match self.acquire(cx).await {
                    Outcome::Ok(conn) => conn,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                mapper.fetch_by_key::<T, _>(cx, conn, &meta, &lookup).await
            })
            .await
    }

    async fn load_where<T: Entity>(
        &self,
        cx: &Cx,
        filter: &[(&'static str, Value)],
    ) -> Outcome<Vec<Arc<T>>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let meta = match self.registry.meta::<T>() {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        let conn = match self.acquire(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let found: Vec<T> = match self.mapper.fetch_where(cx, conn, &meta, filter).await {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let adopted = found
            .into_iter()
            .map(|entity| match entity.identity_key() {
                Some(key) => self.identity_map.adopt(key, entity),
                None => Arc::new(entity),
            })
            .collect::<Vec<_>>();
        tracing::debug!(entity = meta.entity(), rows = adopted.len(), "Scan complete");
        Outcome::Ok(adopted)
    }

    /// Look up an entity by key through the identity map.
    ///
    /// Concurrent lookups of the same key share one database round trip.
    /// `None` means no such row exists.
    #[tracing::instrument(level = "debug", skip(self, cx, key), fields(entity = entity_name::<T>()))]
    pub async fn find<T: Entity>(
        &self,
        cx: &Cx,
        key: impl Into<IdentityKey>,
    ) -> Outcome<Option<Arc<T>>, Error> {
        self.load::<T>(cx, key.into()).await
    }

    /// Like [`find`](Self::find), but a missing row is [`Error::NotFound`].
    pub async fn get<T: Entity>(&self, cx: &Cx, key: impl Into<IdentityKey>) -> Outcome<Arc<T>, Error> {
        let key = key.into();
        match self.load::<T>(cx, key.clone()).await {
            Outcome::Ok(Some(entity)) => Outcome::Ok(entity),
            Outcome::Ok(None) => {
                let table = self
                    .registry
                    .get::<T>()
                    .map(|meta| meta.table().to_string())
                    .unwrap_or_default();
                Outcome::Err(Error::NotFound(NotFoundError {
                    entity: entity_name::<T>(),
                    table,
                    key: key.to_string(),
                }))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Every entity whose columns match `filter`; an empty filter scans the
    /// whole table. Rows already in the identity map come back as the cached
    /// instance.
    #[tracing::instrument(level = "debug", skip(self, cx, filter), fields(entity = entity_name::<T>()))]
    pub async fn find_where<T: Entity>(
        &self,
        cx: &Cx,
        filter: &[(&'static str, Value)],
    ) -> Outcome<Vec<Arc<T>>, Error> {
        self.load_where::<T>(cx, filter).await
    }

    // ========================================================================
    // Commit / Rollback
    // ========================================================================

    /// Write every queued change and commit the transaction.
    ///
    /// Inserts run first, then updates, then deletes. On success the identity
    /// map is reconciled with the written entities. On any failure the
    /// transaction is rolled back, speculative map entries are undone and the
    /// original failure is returned. The connection is closed either way; a
    /// close failure is logged, never returned.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let pending = self.pending();
        if pending.is_empty() && !self.has_connection() {
            self.state = UowState::Committed;
            tracing::debug!("Nothing to commit");
            return Outcome::Ok(());
        }

        self.state = UowState::Committing;
        tracing::info!(
            new = pending.new,
            dirty = pending.dirty,
            removed = pending.removed,
            "Commit started"
        );

        match self.write_changes(cx).await {
            Outcome::Ok(()) => {}
            failure => return self.abort(cx, failure).await,
        }

        let kept = UpdateHelper::new(&self.new).reconcile(&self.identity_map)
            + UpdateHelper::new(&self.dirty).reconcile(&self.identity_map);
        DeleteHelper::new(&mut self.removed).reconcile(&self.identity_map);
        self.discard_queues();
        self.state = UowState::Committed;
        tracing::info!(kept_newer = kept, "Committed");

        // Already committed; close failures are only logged.
        if let Err(e) = self.close_connection(cx).await {
            tracing::warn!(error = %e, "Connection close failed after commit");
        }
        Outcome::Ok(())
    }

    /// Run the three helpers and the connection-level commit.
    async fn write_changes(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.acquire(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let Some(conn) = self.connection.get() else {
            return Outcome::Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "connection released before commit".to_string(),
                source: None,
            }));
        };
        let mapper = self.mapper;
        let map = &self.identity_map;

        match CreateHelper::new(&mut self.new)
            .apply(cx, conn, mapper, map, self.config.initial_version)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match DirtyHelper::new(&mut self.dirty).apply(cx, conn, mapper).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match DeleteHelper::new(&mut self.removed)
            .apply(cx, conn, mapper, map)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        conn.commit(cx).await
    }

    /// Roll back after a failed commit and re-raise `failure`.
    async fn abort(&mut self, cx: &Cx, failure: Outcome<(), Error>) -> Outcome<(), Error> {
        self.state = UowState::RollingBack;
        let cause = match &failure {
            Outcome::Err(e) => e.to_string(),
            Outcome::Cancelled(r) => format!("cancelled: {r:?}"),
            Outcome::Panicked(p) => format!("panicked: {p:?}"),
            Outcome::Ok(()) => "no failure".to_string(),
        };
        tracing::warn!(cause = %cause, "Commit failed; rolling back");

        let rollback_error = match self.connection.get() {
            Some(conn) => match conn.rollback(cx).await {
                Outcome::Ok(()) => None,
                Outcome::Err(e) => Some(e.to_string()),
                Outcome::Cancelled(r) => Some(format!("rollback cancelled: {r:?}")),
                Outcome::Panicked(p) => Some(format!("rollback panicked: {p:?}")),
            },
            None => None,
        };

        if rollback_error.is_none() {
            CreateHelper::new(&mut self.new).undo(&self.identity_map);
            DeleteHelper::new(&mut self.removed).undo(&self.identity_map);
        }
        self.discard_queues();
        if let Err(e) = self.close_connection(cx).await {
            tracing::warn!(error = %e, "Connection close failed during rollback");
        }
        self.state = UowState::RolledBack;

        match rollback_error {
            None => {
                tracing::warn!("Rolled back");
                failure
            }
            Some(rollback) => {
                tracing::warn!(error = %rollback, "Rollback failed; identity map left as is");
                let source = match failure {
                    Outcome::Err(e) => Some(Box::new(e)),
                    _ => None,
                };
                Outcome::Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::RollbackFailed,
                    message: format!("{rollback} (while handling: {cause})"),
                    source,
                }))
            }
        }
    }

    /// Abandon the unit of work: drop every queued change and roll back and
    /// close any acquired connection.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        self.state = UowState::RollingBack;
        let discarded = self.pending();
        self.discard_queues();

        let rolled_back = match self.connection.get() {
            Some(conn) => conn.rollback(cx).await,
            None => Outcome::Ok(()),
        };
        let closed = self.close_connection(cx).await;
        self.state = UowState::RolledBack;
        tracing::info!(discarded = discarded.total(), "Rolled back");

        match rolled_back {
            Outcome::Ok(()) => match closed {
                Ok(()) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            },
            other => other,
        }
    }

    fn discard_queues(&mut self) {
        self.new.clear();
        self.dirty.clear();
        self.removed.clear();
        self.membership.clear();
    }

    /// Close the connection if one was acquired. Runs at most once.
    async fn close_connection(&mut self, cx: &Cx) -> Result<()> {
        match self.connection.take() {
            Some(conn) => {
                let closed = conn.close(cx).await;
                tracing::debug!(ok = closed.is_ok(), "Connection closed");
                closed
            }
            None => Ok(()),
        }
    }
}

impl<P: ConnectionProvider> EntitySource for UnitOfWork<P> {
    fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    fn find<T: Entity>(
        &self,
        cx: &Cx,
        key: &IdentityKey,
    ) -> impl Future<Output = Outcome<Option<Arc<T>>, Error>> + Send {
        self.load::<T>(cx, key.clone())
    }

    fn find_where<T: Entity>(
        &self,
        cx: &Cx,
        filter: &[(&'static str, Value)],
    ) -> impl Future<Output = Outcome<Vec<Arc<T>>, Error>> + Send {
        self.load_where::<T>(cx, filter)
    }

    async fn join_keys(
        &self,
        cx: &Cx,
        join: &JoinTable,
        owner: &IdentityKey,
    ) -> Outcome<Vec<IdentityKey>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let conn = match self.acquire(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.mapper.fetch_join_keys(cx, conn, join, owner).await
    }
}

impl<P: ConnectionProvider> Drop for UnitOfWork<P> {
    fn drop(&mut self) {
        if self.has_connection() {
            tracing::warn!(
                state = ?self.state,
                "Unit of work dropped while holding an open connection"
            );
        }
    }
}
