//! Entity metadata and the explicit metadata registry.
//!
//! Each [`Entity`] describes itself once with an [`EntityDescriptor`]. The
//! [`MetadataRegistry`] validates that description, infers the resolution
//! strategy of every relationship, and memoizes the result as an
//! `Arc<EntityMeta>`. The registry is an ordinary value: construct it at
//! startup, register types in whatever order you need, and pass it to each
//! unit of work.
//!
//! # Inheritance
//!
//! Entity hierarchies are modelled as composition over table layers. A
//! `Manager` that extends `Employee` declares the `employees` table as a base
//! layer; the persistence layer walks the layers root-first when inserting
//! and reading, and most-derived-first when deleting. Every layer shares the
//! key columns; the version column lives on the root layer.

use crate::Result;
use crate::entity::{Entity, entity_name};
use crate::error::Error;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// A primary-key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyField {
    pub column: &'static str,
    /// Value is assigned by the database on insert.
    pub generated: bool,
}

impl KeyField {
    pub const fn new(column: &'static str) -> Self {
        Self {
            column,
            generated: false,
        }
    }

    pub const fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// One table of an entity and the non-key columns stored in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayer {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
}

impl TableLayer {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: &'static str) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: &[&'static str]) -> Self {
        self.columns.extend_from_slice(columns);
        self
    }
}

/// Association table backing a many-to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: &'static str,
    /// Columns holding the owner's key, in the owner's key order.
    pub owner_columns: Vec<&'static str>,
    /// Columns holding the target's key, in the target's key order.
    pub target_columns: Vec<&'static str>,
}

impl JoinTable {
    pub fn new(
        table: &'static str,
        owner_columns: &[&'static str],
        target_columns: &[&'static str],
    ) -> Self {
        Self {
            table,
            owner_columns: owner_columns.to_vec(),
            target_columns: target_columns.to_vec(),
        }
    }
}

/// Declaration of an external-reference field.
///
/// Exactly one of local columns, foreign columns or a join table must be
/// declared; the strategy is inferred from which one it is.
#[derive(Debug, Clone)]
pub struct ReferenceDecl {
    pub name: &'static str,
    pub target: &'static str,
    pub local_columns: Vec<&'static str>,
    pub foreign_columns: Vec<&'static str>,
    pub join_table: Option<JoinTable>,
}

impl ReferenceDecl {
    /// Declare a reference named `name` to entity type `T`.
    pub fn to<T: 'static>(name: &'static str) -> Self {
        Self {
            name,
            target: entity_name::<T>(),
            local_columns: Vec::new(),
            foreign_columns: Vec::new(),
            join_table: None,
        }
    }

    /// The owner's row holds the target's key in these columns (N:1).
    pub fn local_columns(mut self, columns: &[&'static str]) -> Self {
        self.local_columns = columns.to_vec();
        self
    }

    /// The target's rows hold the owner's key in these columns (1:N).
    pub fn foreign_columns(mut self, columns: &[&'static str]) -> Self {
        self.foreign_columns = columns.to_vec();
        self
    }

    /// Owner and target are linked through an association table (N:N).
    pub fn join_table(mut self, join: JoinTable) -> Self {
        self.join_table = Some(join);
        self
    }
}

/// Static metadata table for one entity type.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    table: &'static str,
    keys: Vec<KeyField>,
    columns: Vec<&'static str>,
    version: Option<&'static str>,
    references: Vec<ReferenceDecl>,
    bases: Vec<TableLayer>,
}

impl EntityDescriptor {
    /// Describe an entity whose own columns live in `table`.
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            keys: Vec::new(),
            columns: Vec::new(),
            version: None,
            references: Vec::new(),
            bases: Vec::new(),
        }
    }

    pub fn key(mut self, key: KeyField) -> Self {
        self.keys.push(key);
        self
    }

    pub fn column(mut self, column: &'static str) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: &[&'static str]) -> Self {
        self.columns.extend_from_slice(columns);
        self
    }

    /// Optimistic-lock version column.
    pub fn version(mut self, column: &'static str) -> Self {
        self.version = Some(column);
        self
    }

    pub fn reference(mut self, reference: ReferenceDecl) -> Self {
        self.references.push(reference);
        self
    }

    /// Add a base table layer. Call root-first.
    pub fn base(mut self, layer: TableLayer) -> Self {
        self.bases.push(layer);
        self
    }

    /// Number of primary key columns declared so far.
    pub fn key_arity(&self) -> usize {
        self.keys.len()
    }
}

/// How a relationship field is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// N:1, the owner row carries the target key.
    SingleReference { local_columns: Vec<&'static str> },
    /// 1:N, target rows carry the owner key.
    MultiReference { foreign_columns: Vec<&'static str> },
    /// N:N through an association table.
    JoinTable(JoinTable),
}

impl ResolveStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            ResolveStrategy::SingleReference { .. } => "single-reference",
            ResolveStrategy::MultiReference { .. } => "multi-reference",
            ResolveStrategy::JoinTable(_) => "join-table",
        }
    }
}

/// A validated relationship with its inferred strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMeta {
    pub name: &'static str,
    pub target: &'static str,
    pub strategy: ResolveStrategy,
}

/// Validated, immutable metadata for one entity type.
#[derive(Debug)]
pub struct EntityMeta {
    entity: &'static str,
    keys: Vec<KeyField>,
    layers: Vec<TableLayer>,
    version: Option<&'static str>,
    references: Vec<ReferenceMeta>,
}

impl EntityMeta {
    /// Validate `descriptor` and infer relationship strategies.
    #[allow(clippy::result_large_err)]
    pub fn build(entity: &'static str, descriptor: EntityDescriptor) -> Result<Self> {
        let EntityDescriptor {
            table,
            keys,
            columns,
            version,
            references,
            bases,
        } = descriptor;

        if keys.is_empty() {
            return Err(Error::metadata(entity, "at least one key column is required"));
        }

        let mut layers = bases;
        layers.push(TableLayer { table, columns });
        if let Some(version) = version {
            layers[0].columns.push(version);
        }

        let mut tables = HashSet::new();
        let mut seen = HashSet::new();
        for key in &keys {
            if !seen.insert(key.column) {
                return Err(Error::metadata(
                    entity,
                    format!("duplicate key column '{}'", key.column),
                ));
            }
        }
        for layer in &layers {
            if !tables.insert(layer.table) {
                return Err(Error::metadata(
                    entity,
                    format!("table '{}' appears in more than one layer", layer.table),
                ));
            }
            for column in &layer.columns {
                if !seen.insert(*column) {
                    let message = if Some(*column) == version {
                        format!("version column '{column}' collides with another column")
                    } else {
                        format!("column '{column}' declared more than once")
                    };
                    return Err(Error::metadata(entity, message));
                }
            }
        }

        let references = references
            .into_iter()
            .map(|decl| infer_strategy(entity, &keys, &seen, decl))
            .collect::<Result<Vec<_>>>()?;

        let mut names = HashSet::new();
        for reference in &references {
            if !names.insert(reference.name) {
                return Err(Error::metadata(
                    entity,
                    format!("duplicate relationship '{}'", reference.name),
                ));
            }
        }

        Ok(Self {
            entity,
            keys,
            layers,
            version,
            references,
        })
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// The root table, which owns generated keys and the version column.
    pub fn table(&self) -> &'static str {
        self.layers[0].table
    }

    pub fn layers(&self) -> &[TableLayer] {
        &self.layers
    }

    pub fn is_layered(&self) -> bool {
        self.layers.len() > 1
    }

    pub fn keys(&self) -> &[KeyField] {
        &self.keys
    }

    pub fn key_columns(&self) -> Vec<&'static str> {
        self.keys.iter().map(|k| k.column).collect()
    }

    pub fn generated_key_columns(&self) -> Vec<&'static str> {
        self.keys
            .iter()
            .filter(|k| k.generated)
            .map(|k| k.column)
            .collect()
    }

    pub fn has_generated_key(&self) -> bool {
        self.keys.iter().any(|k| k.generated)
    }

    pub fn version_column(&self) -> Option<&'static str> {
        self.version
    }

    /// Key columns followed by every layer's columns, root-first.
    pub fn select_columns(&self) -> Vec<&'static str> {
        let mut columns = self.key_columns();
        for layer in &self.layers {
            columns.extend(layer.columns.iter().copied());
        }
        columns
    }

    pub fn references(&self) -> &[ReferenceMeta] {
        &self.references
    }

    pub fn reference(&self, name: &str) -> Option<&ReferenceMeta> {
        self.references.iter().find(|r| r.name == name)
    }
}

#[allow(clippy::result_large_err)]
fn infer_strategy(
    entity: &'static str,
    keys: &[KeyField],
    columns: &HashSet<&'static str>,
    decl: ReferenceDecl,
) -> Result<ReferenceMeta> {
    let ReferenceDecl {
        name,
        target,
        local_columns,
        foreign_columns,
        join_table,
    } = decl;

    let strategy = match (
        local_columns.is_empty(),
        foreign_columns.is_empty(),
        join_table,
    ) {
        (false, true, None) => {
            if let Some(missing) = local_columns.iter().find(|c| !columns.contains(*c)) {
                return Err(Error::metadata(
                    entity,
                    format!("relationship '{name}' uses undeclared column '{missing}'"),
                ));
            }
            ResolveStrategy::SingleReference { local_columns }
        }
        (true, false, None) => {
            if foreign_columns.len() != keys.len() {
                return Err(Error::metadata(
                    entity,
                    format!(
                        "relationship '{name}' has {} foreign columns but the key has {}",
                        foreign_columns.len(),
                        keys.len()
                    ),
                ));
            }
            ResolveStrategy::MultiReference { foreign_columns }
        }
        (true, true, Some(join)) => {
            if join.owner_columns.len() != keys.len() || join.target_columns.is_empty() {
                return Err(Error::metadata(
                    entity,
                    format!(
                        "join table '{}' for relationship '{name}' must map all {} key columns",
                        join.table,
                        keys.len()
                    ),
                ));
            }
            ResolveStrategy::JoinTable(join)
        }
        (true, true, None) => {
            return Err(Error::metadata(
                entity,
                format!("relationship '{name}' declares no resolution columns"),
            ));
        }
        _ => {
            return Err(Error::metadata(
                entity,
                format!(
                    "relationship '{name}' mixes local columns, foreign columns and a join table"
                ),
            ));
        }
    };

    Ok(ReferenceMeta {
        name,
        target,
        strategy,
    })
}

/// Explicit, shareable cache of entity metadata keyed by type.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entries: RwLock<HashMap<TypeId, Arc<EntityMeta>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, validate and store metadata for `E`. Idempotent.
    #[allow(clippy::result_large_err)]
    pub fn register<E: Entity>(&self) -> Result<Arc<EntityMeta>> {
        self.meta::<E>()
    }

    /// Metadata for `E`, building it on first use.
    #[allow(clippy::result_large_err)]
    pub fn meta<E: Entity>(&self) -> Result<Arc<EntityMeta>> {
        let type_id = TypeId::of::<E>();
        if let Some(meta) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
        {
            return Ok(Arc::clone(meta));
        }

        let built = Arc::new(EntityMeta::build(entity_name::<E>(), E::describe())?);
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let meta = entries.entry(type_id).or_insert_with(|| {
            tracing::debug!(
                entity = built.entity(),
                table = built.table(),
                layers = built.layers().len(),
                references = built.references().len(),
                "Registered entity metadata"
            );
            Arc::clone(&built)
        });
        Ok(Arc::clone(meta))
    }

    /// Metadata for `E` if it has already been built.
    pub fn get<E: Entity>(&self) -> Option<Arc<EntityMeta>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
