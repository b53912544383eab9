//! The `Entity` trait for domain records mapped to tables.
//!
//! Mapping is described by a statically written metadata table
//! ([`EntityDescriptor`]) instead of runtime inspection. A typical entity:
//!
//! ```ignore
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
//!
//!     fn to_row(&self) -> Vec<(&'static str, Value)> {
//!         vec![
//!             ("id", self.id.into()),
//!             ("name", self.name.clone().into()),
//!             ("team_id", self.team.key().cloned().map(|k| k.values()[0].clone()).into()),
//!             ("version", self.version.into()),
//!         ]
//!     }
//!
//!     fn from_row(row: &RowContext<'_>) -> Result<Self> {
//!         Ok(Self {
//!             id: row.get("id")?,
//!             name: row.get("name")?,
//!             version: row.get("version")?,
//!             team: row.reference("team")?,
//!         })
//!     }
//!
//!     fn primary_key_value(&self) -> Vec<Value> {
//!         vec![self.id.into()]
//!     }
//! }
//! ```

use crate::Result;
use crate::key::IdentityKey;
use crate::metadata::EntityDescriptor;
use crate::resolver::RowContext;
use crate::value::Value;

/// A domain record persisted through a unit of work.
pub trait Entity: Clone + Send + Sync + 'static {
    /// The metadata table for this type. Called once per registry.
    fn describe() -> EntityDescriptor;

    /// Column values for every persisted column, across all table layers.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an entity from a fetched row.
    ///
    /// Relationship fields are attached through the row context as deferred
    /// accessors; this must not perform any I/O.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &RowContext<'_>) -> Result<Self>;

    /// Primary key column values in key order. NULL components mean the
    /// entity has not been assigned a key yet.
    fn primary_key_value(&self) -> Vec<Value>;

    /// The identity key, if every key component is set.
    fn identity_key(&self) -> Option<IdentityKey> {
        IdentityKey::from_values(self.primary_key_value())
    }

    /// Current optimistic-lock version, for versioned types.
    fn version(&self) -> Option<i64> {
        None
    }

    /// Store a new version after a successful insert or update.
    #[allow(unused_variables)]
    fn set_version(&mut self, version: i64) {}

    /// Store database-generated key values after insert, in key order.
    #[allow(unused_variables)]
    fn set_generated_keys(&mut self, keys: &[Value]) {}
}

/// Short type name used in logs and errors (`Hero` rather than `app::model::Hero`).
pub fn entity_name<E: ?Sized>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}
