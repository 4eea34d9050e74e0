//! Shared type definitions for the Tidemark persistence engine.
//!
//! This crate is the single source of truth for the types that cross crate
//! boundaries in the Tidemark workspace: dynamic column values, entity
//! identities (including keys that have not been generated yet), the live
//! entity representation callers mutate, and the immutable mapping-metadata
//! model the engine consumes.
//!
//! # Modules
//!
//! - [`value`] -- Dynamic column values and decoded result rows
//! - [`ident`] -- Entity names and identities with pending-key support
//! - [`entity`] -- Live entities, association slots, and shared handles
//! - [`meta`] -- Mapping metadata: tables, columns, id strategies, cascades

pub mod entity;
pub mod ident;
pub mod meta;
pub mod value;

// Re-export the primary types at crate root for convenience.
pub use entity::{AssocValue, Entity, EntityHandle, WeakEntityHandle};
pub use ident::{EntityName, Ident, KeyRef};
pub use meta::{
    AssociationKind, AssociationMeta, CascadeOp, CascadeSet, EntityDef, EntityMeta, FieldMeta,
    IdStrategy, KeyProducer, KeyProducerError, LockMode, MetadataError, MetadataRegistry,
    RegistryBuilder,
};
pub use value::{Row, Value};
