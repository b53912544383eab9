//! Unit of Work for relmap.
//!
//! `relmap-session` is the **transactional layer**. It coordinates object
//! identity, change queues and commit/rollback over one connection per unit of
//! work.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per persisted row, with
//!   concurrent lookups of the same key collapsed into one load.
//! - **Change queues**: new, dirty and removed entities recorded before commit.
//! - **Commit protocol**: inserts, updates, deletes, connection commit, then
//!   reconciliation; any failure rolls back and restores the identity map.
//! - **Mapper**: parameterized SQL built from each entity's metadata table.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(MetadataRegistry::new());
//! let mut uow = UnitOfWork::new(Arc::clone(&provider), registry);
//!
//! let hero = uow.get::<Hero>(&cx, 1_i64).await?;
//! let team = hero.team.resolve(&cx, &uow).await?;
//!
//! uow.register_removed((*hero).clone())?;
//! uow.commit(&cx).await?;
//! ```

pub mod commit;
pub mod identity_map;
pub mod mapper;
pub mod unit_of_work;

#[cfg(test)]
mod testing;

pub use identity_map::{IdentityMap, ObjectKey, Publish};
pub use mapper::{SqlMapper, Statement, quote_ident};
pub use unit_of_work::{PendingCounts, UnitOfWork, UnitOfWorkConfig, UowState};
