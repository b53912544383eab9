//! Relationship resolvers and deferred accessors.
//!
//! Converting a row into an entity never touches the database. Each
//! relationship field instead receives a deferred accessor built by one of
//! three resolvers, chosen by the strategy inferred at metadata-build time:
//!
//! | Strategy | Resolver | Accessor | Query issued on `resolve` |
//! |----------|----------|----------|---------------------------|
//! | N:1 | [`SingleReferenceResolver`] | [`DeferredRef`] | key lookup on the target |
//! | 1:N | [`MultiReferenceResolver`] | [`DeferredList`] | `WHERE foreign = owner key` |
//! | N:N | [`JoinTableResolver`] | [`DeferredList`] | association ids, then one lookup per id |
//!
//! Accessors resolve against an [`EntitySource`], normally the unit of work
//! that loaded the owner, so every lookup goes through its identity map.

use crate::Result;
use crate::entity::{Entity, entity_name};
use crate::error::{Error, NotFoundError};
use crate::key::IdentityKey;
use crate::metadata::{EntityMeta, JoinTable, MetadataRegistry, ReferenceMeta, ResolveStrategy};
use crate::row::{FromValue, Row};
use crate::value::Value;
use asupersync::{Cx, Outcome};
use futures::future::join_all;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Anything that can look up entities for deferred accessors.
pub trait EntitySource: Send + Sync {
    /// Metadata registry used to describe targets.
    fn registry(&self) -> &MetadataRegistry;

    /// Look up one entity by key. `None` when no row exists.
    fn find<T: Entity>(
        &self,
        cx: &Cx,
        key: &IdentityKey,
    ) -> impl Future<Output = Outcome<Option<Arc<T>>, Error>> + Send;

    /// All entities whose `column = value` pairs all match.
    fn find_where<T: Entity>(
        &self,
        cx: &Cx,
        filter: &[(&'static str, Value)],
    ) -> impl Future<Output = Outcome<Vec<Arc<T>>, Error>> + Send;

    /// Target keys linked to `owner` through an association table.
    fn join_keys(
        &self,
        cx: &Cx,
        join: &JoinTable,
        owner: &IdentityKey,
    ) -> impl Future<Output = Outcome<Vec<IdentityKey>, Error>> + Send;
}

/// A fetched row together with the metadata of the entity being built.
pub struct RowContext<'a> {
    row: &'a Row,
    meta: &'a EntityMeta,
}

impl<'a> RowContext<'a> {
    pub fn new(row: &'a Row, meta: &'a EntityMeta) -> Self {
        Self { row, meta }
    }

    pub fn row(&self) -> &'a Row {
        self.row
    }

    pub fn meta(&self) -> &'a EntityMeta {
        self.meta
    }

    /// Typed column value.
    #[allow(clippy::result_large_err)]
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        self.row.get_named(column)
    }

    /// The owner's identity key, read from the key columns.
    #[allow(clippy::result_large_err)]
    pub fn key(&self) -> Result<IdentityKey> {
        let values = self.row.project(&self.meta.key_columns())?;
        IdentityKey::from_values(values).ok_or_else(|| {
            Error::metadata(self.meta.entity(), "row has a NULL key column")
        })
    }

    /// Deferred N:1 accessor for the relationship `name`.
    #[allow(clippy::result_large_err)]
    pub fn reference<T: Entity>(&self, name: &str) -> Result<DeferredRef<T>> {
        match Resolver::for_reference(self.lookup(name)?) {
            Resolver::Single(resolver) => resolver.attach(self.row),
            other => Err(self.wrong_strategy(name, other.label(), "reference")),
        }
    }

    /// Deferred 1:N or N:N accessor for the relationship `name`.
    #[allow(clippy::result_large_err)]
    pub fn collection<T: Entity>(&self, name: &str) -> Result<DeferredList<T>> {
        match Resolver::for_reference(self.lookup(name)?) {
            Resolver::Multi(resolver) => Ok(resolver.attach(self.key()?)),
            Resolver::Join(resolver) => Ok(resolver.attach(self.key()?)),
            Resolver::Single(_) => {
                Err(self.wrong_strategy(name, "single-reference", "collection"))
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn lookup(&self, name: &str) -> Result<&'a ReferenceMeta> {
        self.meta.reference(name).ok_or_else(|| {
            Error::metadata(self.meta.entity(), format!("unknown relationship '{name}'"))
        })
    }

    fn wrong_strategy(&self, name: &str, strategy: &str, accessor: &str) -> Error {
        Error::metadata(
            self.meta.entity(),
            format!("relationship '{name}' is {strategy} and cannot be read as a {accessor}"),
        )
    }
}

/// Resolver selected for one relationship.
pub enum Resolver<'m> {
    Single(SingleReferenceResolver<'m>),
    Multi(MultiReferenceResolver<'m>),
    Join(JoinTableResolver<'m>),
}

impl<'m> Resolver<'m> {
    pub fn for_reference(reference: &'m ReferenceMeta) -> Self {
        match &reference.strategy {
            ResolveStrategy::SingleReference { local_columns } => {
                Resolver::Single(SingleReferenceResolver { local_columns })
            }
            ResolveStrategy::MultiReference { foreign_columns } => {
                Resolver::Multi(MultiReferenceResolver { foreign_columns })
            }
            ResolveStrategy::JoinTable(join) => Resolver::Join(JoinTableResolver { join }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Resolver::Single(_) => "single-reference",
            Resolver::Multi(_) => "multi-reference",
            Resolver::Join(_) => "join-table",
        }
    }
}

/// Captures the foreign key carried by the owner row.
pub struct SingleReferenceResolver<'m> {
    local_columns: &'m [&'static str],
}

impl SingleReferenceResolver<'_> {
    /// A NULL foreign key yields a null accessor.
    #[allow(clippy::result_large_err)]
    pub fn attach<T: Entity>(&self, row: &Row) -> Result<DeferredRef<T>> {
        let values = row.project(self.local_columns)?;
        Ok(DeferredRef::new(IdentityKey::from_values(values)))
    }
}

/// Captures the owner key for a filtered scan of the target.
pub struct MultiReferenceResolver<'m> {
    foreign_columns: &'m [&'static str],
}

impl MultiReferenceResolver<'_> {
    pub fn attach<T: Entity>(&self, owner: IdentityKey) -> DeferredList<T> {
        DeferredList::from_source(ListSource::Foreign {
            columns: self.foreign_columns.to_vec(),
            owner,
        })
    }
}

/// Captures the owner key for an association-table query.
pub struct JoinTableResolver<'m> {
    join: &'m JoinTable,
}

impl JoinTableResolver<'_> {
    pub fn attach<T: Entity>(&self, owner: IdentityKey) -> DeferredList<T> {
        DeferredList::from_source(ListSource::JoinTable {
            join: self.join.clone(),
            owner,
        })
    }
}

fn not_found<T: Entity>(registry: &MetadataRegistry, key: &IdentityKey) -> Error {
    let table = match registry.meta::<T>() {
        Ok(meta) => meta.table().to_string(),
        Err(e) => return e,
    };
    Error::NotFound(NotFoundError {
        entity: entity_name::<T>(),
        table,
        key: key.to_string(),
    })
}

/// Deferred N:1 accessor.
///
/// Holds the target key captured from the owner row; nothing is fetched
/// until [`resolve`](DeferredRef::resolve) is called. A successful lookup is
/// memoized.
pub struct DeferredRef<T: Entity> {
    key: Option<IdentityKey>,
    loaded: OnceLock<Arc<T>>,
}

impl<T: Entity> DeferredRef<T> {
    pub fn new(key: Option<IdentityKey>) -> Self {
        Self {
            key,
            loaded: OnceLock::new(),
        }
    }

    /// Accessor for a NULL foreign key.
    pub fn null() -> Self {
        Self::new(None)
    }

    /// Point at `target` without fetching it.
    pub fn to(key: impl Into<IdentityKey>) -> Self {
        Self::new(Some(key.into()))
    }

    pub fn key(&self) -> Option<&IdentityKey> {
        self.key.as_ref()
    }

    /// The first key component, or NULL. Only for single-column references;
    /// use [`key_values`](DeferredRef::key_values) when the target key is
    /// composite.
    pub fn key_value(&self) -> Value {
        self.key
            .as_ref()
            .and_then(|k| k.values().first().cloned())
            .unwrap_or(Value::Null)
    }

    /// Every key component in column order. A null reference yields one
    /// NULL per key column of `T`.
    pub fn key_values(&self) -> Vec<Value> {
        match &self.key {
            Some(key) => key.values().to_vec(),
            None => vec![Value::Null; T::describe().key_arity()],
        }
    }

    pub fn is_null(&self) -> bool {
        self.key.is_none()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// The target, if already resolved.
    pub fn get(&self) -> Option<&Arc<T>> {
        self.loaded.get()
    }

    /// Fetch the target. `None` for a NULL foreign key; a dangling foreign
    /// key is a [`Error::NotFound`].
    pub async fn resolve<S: EntitySource>(
        &self,
        cx: &Cx,
        source: &S,
    ) -> Outcome<Option<Arc<T>>, Error> {
        let Some(key) = &self.key else {
            return Outcome::Ok(None);
        };
        if let Some(target) = self.loaded.get() {
            return Outcome::Ok(Some(Arc::clone(target)));
        }

        match source.find::<T>(cx, key).await {
            Outcome::Ok(Some(target)) => {
                let _ = self.loaded.set(Arc::clone(&target));
                Outcome::Ok(Some(target))
            }
            Outcome::Ok(None) => {
                tracing::warn!(
                    target_entity = entity_name::<T>(),
                    key = %key,
                    "Dangling reference"
                );
                Outcome::Err(not_found::<T>(source.registry(), key))
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}

impl<T: Entity> Clone for DeferredRef<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            loaded: self.loaded.clone(),
        }
    }
}

impl<T: Entity> Default for DeferredRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Entity> PartialEq for DeferredRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T: Entity> fmt::Debug for DeferredRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredRef")
            .field("target", &entity_name::<T>())
            .field("key", &self.key)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ListSource {
    /// Owner not persisted; resolves to an empty list.
    Detached,
    Foreign {
        columns: Vec<&'static str>,
        owner: IdentityKey,
    },
    JoinTable {
        join: JoinTable,
        owner: IdentityKey,
    },
}

/// Deferred 1:N or N:N accessor.
pub struct DeferredList<T: Entity> {
    source: ListSource,
    loaded: OnceLock<Vec<Arc<T>>>,
}

impl<T: Entity> DeferredList<T> {
    fn from_source(source: ListSource) -> Self {
        Self {
            source,
            loaded: OnceLock::new(),
        }
    }

    /// Accessor for an entity that has not been loaded from the database.
    pub fn detached() -> Self {
        Self::from_source(ListSource::Detached)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    pub fn get(&self) -> Option<&[Arc<T>]> {
        self.loaded.get().map(Vec::as_slice)
    }

    /// The owner key this accessor was captured with.
    pub fn owner(&self) -> Option<&IdentityKey> {
        match &self.source {
            ListSource::Detached => None,
            ListSource::Foreign { owner, .. } | ListSource::JoinTable { owner, .. } => Some(owner),
        }
    }

    /// Fetch the related entities.
    ///
    /// For a join table, every id is looked up concurrently; one missing or
    /// failed lookup fails the whole list.
    pub async fn resolve<S: EntitySource>(
        &self,
        cx: &Cx,
        source: &S,
    ) -> Outcome<Vec<Arc<T>>, Error> {
        if let Some(items) = self.loaded.get() {
            return Outcome::Ok(items.clone());
        }

        let outcome = match &self.source {
            ListSource::Detached => Outcome::Ok(Vec::new()),
            ListSource::Foreign { columns, owner } => {
                let filter: Vec<(&'static str, Value)> = columns
                    .iter()
                    .copied()
                    .zip(owner.values().iter().cloned())
                    .collect();
                source.find_where::<T>(cx, &filter).await
            }
            ListSource::JoinTable { join, owner } => {
                resolve_join_table::<T, S>(cx, source, join, owner).await
            }
        };

        if let Outcome::Ok(items) = &outcome {
            let _ = self.loaded.set(items.clone());
        }
        outcome
    }
}

async fn resolve_join_table<T: Entity, S: EntitySource>(
    cx: &Cx,
    source: &S,
    join: &JoinTable,
    owner: &IdentityKey,
) -> Outcome<Vec<Arc<T>>, Error> {
    let keys = match source.join_keys(cx, join, owner).await {
        Outcome::Ok(keys) => keys,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    tracing::debug!(
        join_table = join.table,
        owner = %owner,
        count = keys.len(),
        "Resolving join-table relationship"
    );

    let results = join_all(keys.iter().map(|key| source.find::<T>(cx, key))).await;

    let mut items = Vec::with_capacity(results.len());
    for (key, outcome) in keys.iter().zip(results) {
        match outcome {
            Outcome::Ok(Some(item)) => items.push(item),
            Outcome::Ok(None) => return Outcome::Err(not_found::<T>(source.registry(), key)),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    Outcome::Ok(items)
}

impl<T: Entity> Clone for DeferredList<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            loaded: self.loaded.clone(),
        }
    }
}

impl<T: Entity> Default for DeferredList<T> {
    fn default() -> Self {
        Self::detached()
    }
}

impl<T: Entity> PartialEq for DeferredList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl<T: Entity> fmt::Debug for DeferredList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredList")
            .field("target", &entity_name::<T>())
            .field("source", &self.source)
            .field("loaded", &self.loaded.get().map(Vec::len))
            .finish()
    }
}
