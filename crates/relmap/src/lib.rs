//! relmap - a transactional unit of work over relational stores.
//!
//! relmap binds plain Rust structs to tables and tracks their changes inside
//! one logical transaction:
//!
//! - An identity map that keeps one instance per row and collapses concurrent
//!   loads of the same key into a single query
//! - New, dirty and removed queues flushed in order at commit
//! - Optimistic concurrency through a version column
//! - Rollback that restores the identity map to its pre-commit state
//! - Lazy single-reference, multi-reference and join-table relationships
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! #[derive(Debug, Clone)]
//! struct Hero {
//!     id: Option<i64>,
//!     name: String,
//!     version: i64,
//!     team: DeferredRef<Team>,
//! }
//!
//! impl Entity for Hero {
//!     fn describe() -> EntityDescriptor {
//!         EntityDescriptor::new("heroes")
//!             .key(KeyField::new("id").generated())
//!             .columns(&["name", "team_id"])
//!             .version("version")
//!             .reference(ReferenceDecl::to::<Team>("team").local_columns(&["team_id"]))
//!     }
//!     // to_row, from_row, primary_key_value, version, set_version ...
//! }
//!
//! async fn rename(cx: &Cx, store: &Store<MyProvider>) -> Outcome<(), Error> {
//!     let mut uow = match store.unit_of_work() {
//!         Ok(uow) => uow,
//!         Err(e) => return Outcome::Err(e),
//!     };
//!     let hero = match uow.get::<Hero>(cx, 7_i64).await {
//!         Outcome::Ok(hero) => hero,
//!         Outcome::Err(e) => return Outcome::Err(e),
//!         Outcome::Cancelled(r) => return Outcome::Cancelled(r),
//!         Outcome::Panicked(p) => return Outcome::Panicked(p),
//!     };
//!     let mut edited = (*hero).clone();
//!     edited.name = "Spider-Man".to_string();
//!     if let Err(e) = uow.register_dirty(edited) {
//!         return Outcome::Err(e);
//!     }
//!     uow.commit(cx).await
//! }
//! ```

pub use relmap_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Values and rows
    FromValue,
    Row,
    Value,
    // Errors
    ConfigError,
    ConflictError,
    ConnectionError,
    ConnectionErrorKind,
    Error,
    MetadataError,
    NotFoundError,
    QueryError,
    QueryErrorKind,
    Result,
    TransactionError,
    TransactionErrorKind,
    TypeError,
    UsageError,
    UsageErrorKind,
    // Connections
    Connection,
    ConnectionProvider,
    ExecResult,
    IsolationLevel,
    TransactionConfig,
    // Entities and metadata
    CompositeKey,
    Entity,
    EntityDescriptor,
    EntityMeta,
    IdentityKey,
    JoinTable,
    KeyField,
    MetadataRegistry,
    ReferenceDecl,
    TableLayer,
    // Relationships
    DeferredList,
    DeferredRef,
    EntitySource,
    RowContext,
};

pub use relmap_session::{
    IdentityMap, PendingCounts, SqlMapper, Statement, UnitOfWork, UnitOfWorkConfig, UowState,
};

pub mod store;
pub use store::{Store, StoreBuilder};

/// Everything needed to declare entities and run units of work.
pub mod prelude {
    pub use crate::{
        Connection, ConnectionProvider, Cx, DeferredList, DeferredRef, Entity, EntityDescriptor,
        Error, IdentityKey, JoinTable, KeyField, Outcome, ReferenceDecl, Result, Row, RowContext,
        Store, TableLayer, TransactionConfig, UnitOfWork, UnitOfWorkConfig, Value,
    };
}
