//! Mapping metadata: how entity types map onto tables, columns, and
//! associations.
//!
//! Metadata is resolved once at startup, validated, and then treated as
//! immutable for the process lifetime -- the engine receives it as an
//! `Arc<MetadataRegistry>` and never mutates it. The declarative surface
//! that *produces* this model (derive macros, attribute parsing) is a
//! separate concern; this module is only the resolved form the engine
//! consumes.
//!
//! # Structure
//!
//! - [`EntityMeta`] -- one mapped entity type: table, key strategy, scalar
//!   columns, optional optimistic-version column, associations.
//! - [`AssociationMeta`] -- one declared association with its cascade policy
//!   and orphan-removal flag.
//! - [`MetadataRegistry`] -- the validated, immutable set of entity types.
//!   Declaration order is preserved; the flush planner uses it as the
//!   primary tie-break for deterministic statement ordering.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::ident::EntityName;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Cascade policy
// ---------------------------------------------------------------------------

/// An operation kind that can cascade across an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CascadeOp {
    /// Propagate `persist` to associated entities.
    Persist,
    /// Propagate `remove` to associated entities.
    Remove,
    /// Propagate `refresh` to associated entities.
    Refresh,
    /// Propagate `merge` to associated entities.
    Merge,
}

/// The set of operation kinds an association cascades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeSet {
    /// Whether `persist` cascades.
    pub persist: bool,
    /// Whether `remove` cascades.
    pub remove: bool,
    /// Whether `refresh` cascades.
    pub refresh: bool,
    /// Whether `merge` cascades.
    pub merge: bool,
}

impl CascadeSet {
    /// No operation cascades.
    pub const fn none() -> Self {
        Self {
            persist: false,
            remove: false,
            refresh: false,
            merge: false,
        }
    }

    /// Every operation cascades.
    pub const fn all() -> Self {
        Self {
            persist: true,
            remove: true,
            refresh: true,
            merge: true,
        }
    }

    /// Only `persist` cascades.
    pub const fn persist_only() -> Self {
        Self {
            persist: true,
            ..Self::none()
        }
    }

    /// Return whether the given operation kind is in the set.
    pub const fn contains(self, op: CascadeOp) -> bool {
        match op {
            CascadeOp::Persist => self.persist,
            CascadeOp::Remove => self.remove,
            CascadeOp::Refresh => self.refresh,
            CascadeOp::Merge => self.merge,
        }
    }
}

// ---------------------------------------------------------------------------
// Lock modes
// ---------------------------------------------------------------------------

/// Lock levels a caller can request on a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared row lock (`SELECT ... FOR SHARE`), taken immediately.
    PessimisticRead,
    /// Exclusive row lock (`SELECT ... FOR UPDATE`), taken immediately.
    PessimisticWrite,
    /// Force a version increment at the next flush, even if the entity is
    /// otherwise clean. Requires a declared version column.
    ForceIncrement,
}

// ---------------------------------------------------------------------------
// Identifier strategies
// ---------------------------------------------------------------------------

/// Error produced by a pluggable key producer.
#[derive(Debug, thiserror::Error)]
#[error("key producer failed: {0}")]
pub struct KeyProducerError(pub String);

/// A pluggable source of primary-key values.
///
/// Producers run asynchronously because a strategy may need a round trip of
/// its own (a remote allocator, a coordination service). The executor calls
/// the producer when it reaches the corresponding key-generation step of a
/// flush plan.
pub trait KeyProducer: Send + Sync {
    /// Produce the next key value.
    fn next_key(&self) -> BoxFuture<'static, Result<Value, KeyProducerError>>;
}

/// How primary-key values are produced for an entity type.
#[derive(Clone)]
pub enum IdStrategy {
    /// Client-side UUID v7 (time-ordered); no database round trip.
    Uuid,
    /// The caller assigns the key before `persist`.
    Assigned,
    /// Draw the next value from a database sequence; one round trip per key.
    Sequence {
        /// The sequence name (e.g. `"book_id_seq"`).
        sequence: String,
    },
    /// Allocate keys from a counter row in a dedicated table; one round trip
    /// per key (`UPDATE ... RETURNING`).
    TableRow {
        /// The allocator table name.
        table: String,
        /// The column identifying the counter row.
        key_column: String,
        /// The column holding the next value.
        value_column: String,
        /// The counter-row key for this entity type.
        row_key: String,
    },
    /// A caller-supplied [`KeyProducer`].
    Custom(Arc<dyn KeyProducer>),
}

impl IdStrategy {
    /// Whether producing a key requires asynchronous work scheduled into
    /// the flush plan (as opposed to resolving synchronously at planning
    /// time).
    pub const fn requires_round_trip(&self) -> bool {
        match self {
            Self::Uuid | Self::Assigned => false,
            Self::Sequence { .. } | Self::TableRow { .. } | Self::Custom(_) => true,
        }
    }
}

impl core::fmt::Debug for IdStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Uuid => write!(f, "Uuid"),
            Self::Assigned => write!(f, "Assigned"),
            Self::Sequence { sequence } => f.debug_struct("Sequence").field("sequence", sequence).finish(),
            Self::TableRow { table, .. } => f.debug_struct("TableRow").field("table", table).finish_non_exhaustive(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fields and associations
// ---------------------------------------------------------------------------

/// One mapped scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    /// The field name on the live entity.
    pub name: String,
    /// The column name in the table.
    pub column: String,
}

/// The structural kind of an association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationKind {
    /// This entity's row holds a foreign key to the target's row.
    ManyToOne {
        /// The foreign-key column on this entity's table.
        column: String,
        /// Whether the foreign-key column accepts NULL. Nullable edges are
        /// what make insert cycles resolvable.
        nullable: bool,
    },
    /// The target's rows hold foreign keys back to this entity's row.
    OneToMany {
        /// The name of the owning `ManyToOne` association on the target
        /// entity.
        mapped_by: String,
    },
}

/// One declared association between two entity types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationMeta {
    /// The association slot name on the live entity.
    pub name: String,
    /// The target entity type.
    pub target: EntityName,
    /// Structural kind and foreign-key placement.
    pub kind: AssociationKind,
    /// Which operations cascade across this association.
    pub cascade: CascadeSet,
    /// Whether this association owns its children exclusively: a child
    /// dropped from the collection is deleted at the next flush even
    /// without an explicit remove. Only meaningful on `OneToMany`.
    pub orphan_removal: bool,
}

// ---------------------------------------------------------------------------
// Entity metadata
// ---------------------------------------------------------------------------

/// The resolved mapping for one entity type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    /// The declared entity name.
    pub name: EntityName,
    /// The mapped table name.
    pub table: String,
    /// The primary-key column.
    pub key_column: String,
    /// How key values are produced.
    pub id_strategy: IdStrategy,
    /// The optimistic-version column, if versioning is enabled.
    pub version_column: Option<String>,
    /// Mapped scalar fields, in declaration order.
    pub fields: Vec<FieldMeta>,
    /// Declared associations, in declaration order.
    pub associations: Vec<AssociationMeta>,
    /// Position of this entity in registry declaration order. Used as the
    /// primary tie-break when ordering actions within a dependency tier.
    pub decl_index: usize,
}

impl EntityMeta {
    /// Start defining an entity mapping.
    pub fn define(name: impl Into<EntityName>, table: impl Into<String>) -> EntityDef {
        EntityDef {
            name: name.into(),
            table: table.into(),
            key_column: "id".to_owned(),
            id_strategy: IdStrategy::Uuid,
            version_column: None,
            fields: Vec::new(),
            associations: Vec::new(),
        }
    }

    /// Look up an association by slot name.
    pub fn association(&self, name: &str) -> Option<&AssociationMeta> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Iterate the `ManyToOne` associations (the ones holding foreign-key
    /// columns on this entity's table).
    pub fn many_to_one(&self) -> impl Iterator<Item = &AssociationMeta> {
        self.associations
            .iter()
            .filter(|a| matches!(a.kind, AssociationKind::ManyToOne { .. }))
    }

    /// Whether optimistic versioning is enabled for this type.
    pub const fn versioned(&self) -> bool {
        self.version_column.is_some()
    }
}

/// Builder for [`EntityMeta`]; finished by [`RegistryBuilder::entity`].
#[derive(Debug)]
pub struct EntityDef {
    name: EntityName,
    table: String,
    key_column: String,
    id_strategy: IdStrategy,
    version_column: Option<String>,
    fields: Vec<FieldMeta>,
    associations: Vec<AssociationMeta>,
}

impl EntityDef {
    /// Set the key column and identifier strategy.
    #[must_use]
    pub fn key(mut self, column: impl Into<String>, strategy: IdStrategy) -> Self {
        self.key_column = column.into();
        self.id_strategy = strategy;
        self
    }

    /// Declare a scalar field whose column name equals the field name.
    #[must_use]
    pub fn field(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let column = name.clone();
        self.field_as(name, column)
    }

    /// Declare a scalar field with an explicit column name.
    #[must_use]
    pub fn field_as(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.fields.push(FieldMeta {
            name: name.into(),
            column: column.into(),
        });
        self
    }

    /// Enable optimistic versioning on the given column.
    #[must_use]
    pub fn versioned(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }

    /// Declare a to-one association holding a foreign key on this entity.
    #[must_use]
    pub fn many_to_one(
        mut self,
        name: impl Into<String>,
        target: impl Into<EntityName>,
        column: impl Into<String>,
        nullable: bool,
        cascade: CascadeSet,
    ) -> Self {
        self.associations.push(AssociationMeta {
            name: name.into(),
            target: target.into(),
            kind: AssociationKind::ManyToOne {
                column: column.into(),
                nullable,
            },
            cascade,
            orphan_removal: false,
        });
        self
    }

    /// Declare a to-many association whose foreign key lives on the target.
    #[must_use]
    pub fn one_to_many(
        mut self,
        name: impl Into<String>,
        target: impl Into<EntityName>,
        mapped_by: impl Into<String>,
        cascade: CascadeSet,
        orphan_removal: bool,
    ) -> Self {
        self.associations.push(AssociationMeta {
            name: name.into(),
            target: target.into(),
            kind: AssociationKind::OneToMany {
                mapped_by: mapped_by.into(),
            },
            cascade,
            orphan_removal,
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Errors detected while validating a metadata registry.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// Two entities were declared with the same name.
    #[error("entity {0} declared twice")]
    DuplicateEntity(EntityName),

    /// An association names a target entity that was never declared.
    #[error("association {entity}.{association} targets unknown entity {target}")]
    UnknownTarget {
        /// The declaring entity.
        entity: EntityName,
        /// The association name.
        association: String,
        /// The missing target.
        target: EntityName,
    },

    /// A `OneToMany` association's `mapped_by` does not resolve to a
    /// `ManyToOne` association on the target entity.
    #[error("association {entity}.{association}: mapped_by {mapped_by} is not a many-to-one on {target}")]
    BadMappedBy {
        /// The declaring entity.
        entity: EntityName,
        /// The association name.
        association: String,
        /// The target entity.
        target: EntityName,
        /// The unresolved `mapped_by` name.
        mapped_by: String,
    },

    /// Two associations on the same entity share a slot name.
    #[error("entity {entity} declares association {association} twice")]
    DuplicateAssociation {
        /// The declaring entity.
        entity: EntityName,
        /// The duplicated slot name.
        association: String,
    },
}

/// The validated, immutable set of mapped entity types.
#[derive(Debug, Clone)]
pub struct MetadataRegistry {
    entities: BTreeMap<EntityName, Arc<EntityMeta>>,
}

impl MetadataRegistry {
    /// Start building a registry.
    pub const fn builder() -> RegistryBuilder {
        RegistryBuilder {
            entities: Vec::new(),
        }
    }

    /// Look up the mapping for an entity type.
    pub fn get(&self, name: &EntityName) -> Option<Arc<EntityMeta>> {
        self.entities.get(name).map(Arc::clone)
    }

    /// Iterate entity mappings in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityMeta>> {
        self.entities.values()
    }

    /// The number of registered entity types.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Builder for [`MetadataRegistry`].
#[derive(Debug)]
pub struct RegistryBuilder {
    entities: Vec<EntityDef>,
}

impl RegistryBuilder {
    /// Add an entity definition. Declaration order is preserved and becomes
    /// the planner's primary tie-break.
    #[must_use]
    pub fn entity(mut self, def: EntityDef) -> Self {
        self.entities.push(def);
        self
    }

    /// Validate the definitions and freeze them into a registry.
    pub fn build(self) -> Result<MetadataRegistry, MetadataError> {
        let mut entities: BTreeMap<EntityName, Arc<EntityMeta>> = BTreeMap::new();

        for (decl_index, def) in self.entities.into_iter().enumerate() {
            let meta = EntityMeta {
                name: def.name,
                table: def.table,
                key_column: def.key_column,
                id_strategy: def.id_strategy,
                version_column: def.version_column,
                fields: def.fields,
                associations: def.associations,
                decl_index,
            };
            if entities.contains_key(&meta.name) {
                return Err(MetadataError::DuplicateEntity(meta.name));
            }
            entities.insert(meta.name.clone(), Arc::new(meta));
        }

        let registry = MetadataRegistry { entities };
        registry.validate()?;
        Ok(registry)
    }
}

impl MetadataRegistry {
    fn validate(&self) -> Result<(), MetadataError> {
        for meta in self.entities.values() {
            let mut seen: Vec<&str> = Vec::new();
            for assoc in &meta.associations {
                if seen.contains(&assoc.name.as_str()) {
                    return Err(MetadataError::DuplicateAssociation {
                        entity: meta.name.clone(),
                        association: assoc.name.clone(),
                    });
                }
                seen.push(assoc.name.as_str());

                let Some(target) = self.entities.get(&assoc.target) else {
                    return Err(MetadataError::UnknownTarget {
                        entity: meta.name.clone(),
                        association: assoc.name.clone(),
                        target: assoc.target.clone(),
                    });
                };

                if let AssociationKind::OneToMany { mapped_by } = &assoc.kind {
                    let resolves = target.association(mapped_by).is_some_and(|back| {
                        matches!(back.kind, AssociationKind::ManyToOne { .. })
                            && back.target == meta.name
                    });
                    if !resolves {
                        return Err(MetadataError::BadMappedBy {
                            entity: meta.name.clone(),
                            association: assoc.name.clone(),
                            target: assoc.target.clone(),
                            mapped_by: mapped_by.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author_book_registry() -> Result<MetadataRegistry, MetadataError> {
        MetadataRegistry::builder()
            .entity(
                EntityMeta::define("Author", "authors")
                    .key("id", IdStrategy::Uuid)
                    .field("name")
                    .versioned("version")
                    .one_to_many("books", "Book", "author", CascadeSet::all(), true),
            )
            .entity(
                EntityMeta::define("Book", "books")
                    .key("id", IdStrategy::Uuid)
                    .field("title")
                    .many_to_one("author", "Author", "author_id", false, CascadeSet::none()),
            )
            .build()
    }

    #[test]
    fn valid_registry_builds() {
        let registry = author_book_registry();
        assert!(registry.is_ok_and(|r| r.len() == 2));
    }

    #[test]
    fn declaration_order_is_recorded() {
        let Ok(registry) = author_book_registry() else {
            return;
        };
        let author = registry.get(&EntityName::from("Author"));
        let book = registry.get(&EntityName::from("Book"));
        assert_eq!(author.map(|m| m.decl_index), Some(0));
        assert_eq!(book.map(|m| m.decl_index), Some(1));
    }

    #[test]
    fn unknown_target_is_rejected() {
        let result = MetadataRegistry::builder()
            .entity(EntityMeta::define("Book", "books").many_to_one(
                "author",
                "Author",
                "author_id",
                false,
                CascadeSet::none(),
            ))
            .build();
        assert!(matches!(result, Err(MetadataError::UnknownTarget { .. })));
    }

    #[test]
    fn bad_mapped_by_is_rejected() {
        let result = MetadataRegistry::builder()
            .entity(EntityMeta::define("Author", "authors").one_to_many(
                "books",
                "Book",
                "writer",
                CascadeSet::all(),
                false,
            ))
            .entity(EntityMeta::define("Book", "books").many_to_one(
                "author",
                "Author",
                "author_id",
                false,
                CascadeSet::none(),
            ))
            .build();
        assert!(matches!(result, Err(MetadataError::BadMappedBy { .. })));
    }

    #[test]
    fn cascade_set_contains() {
        let set = CascadeSet::persist_only();
        assert!(set.contains(CascadeOp::Persist));
        assert!(!set.contains(CascadeOp::Remove));
        assert!(CascadeSet::all().contains(CascadeOp::Merge));
    }

    #[test]
    fn round_trip_strategies() {
        assert!(!IdStrategy::Uuid.requires_round_trip());
        assert!(!IdStrategy::Assigned.requires_round_trip());
        assert!(
            IdStrategy::Sequence {
                sequence: "s".into()
            }
            .requires_round_trip()
        );
    }
}
