//! Core types and traits for relmap.
//!
//! This crate provides the foundations the unit of work is built on:
//!
//! - `Value` and `Row` for parameters and results
//! - `Error`, the shared error taxonomy
//! - `Connection` and `ConnectionProvider`, the database contracts
//! - `IdentityKey` for scalar and composite primary keys
//! - `Entity` and the explicit `MetadataRegistry`
//! - Relationship resolvers producing `DeferredRef` / `DeferredList`
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod entity;
pub mod error;
pub mod key;
pub mod metadata;
pub mod resolver;
pub mod row;
pub mod value;

pub use connection::{
    Connection, ConnectionProvider, ExecResult, IsolationLevel, TransactionConfig,
};
pub use entity::{Entity, entity_name};
pub use error::{
    ConfigError, ConflictError, ConnectionError, ConnectionErrorKind, Error, MetadataError,
    NotFoundError, QueryError, QueryErrorKind, Result, TransactionError, TransactionErrorKind,
    TypeError, UsageError, UsageErrorKind,
};
pub use key::{CompositeKey, IdentityKey};
pub use metadata::{
    EntityDescriptor, EntityMeta, JoinTable, KeyField, MetadataRegistry, ReferenceDecl,
    ReferenceMeta, ResolveStrategy, TableLayer,
};
pub use resolver::{
    DeferredList, DeferredRef, EntitySource, JoinTableResolver, MultiReferenceResolver, Resolver,
    RowContext, SingleReferenceResolver,
};
pub use row::{FromValue, Row};
pub use value::Value;
