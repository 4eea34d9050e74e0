//! The per-unit-of-work engine state for the Tidemark persistence engine.
//!
//! This crate is pure in-memory logic: it never talks to a database. It
//! tracks which entities one unit of work manages, decides what has to be
//! written, and produces an ordered plan of atomic actions. Executing that
//! plan is the session crate's job.
//!
//! # Architecture
//!
//! ```text
//! persist/remove/merge/refresh intents
//!     |
//!     +-- cascade::resolve()      -- expand across the live object graph
//!     |
//!     +-- PersistenceContext      -- entry table: status, snapshot, version
//!         |
//!         +-- FlushPlanner::plan() -- dirty diff, dependency graph,
//!             |                      topological order, cycle resolution
//!             +-- FlushPlan        -- ordered Vec<Action>
//! ```
//!
//! # Modules
//!
//! - [`entry`] -- One tracked entity: status tag, snapshot, version
//! - [`context`] -- The identity-keyed entry table for one unit of work
//! - [`cascade`] -- Cascade resolution and orphan detection
//! - [`action`] -- Planned atomic database operations
//! - [`planner`] -- Flush planning: ordering, batched shapes, cycles

pub mod action;
pub mod cascade;
pub mod context;
pub mod entry;
pub mod planner;

// Re-export primary types at crate root.
pub use action::{Action, ActionKind, ActionShape, ParamSource};
pub use cascade::CascadeItem;
pub use context::PersistenceContext;
pub use entry::{EntityEntry, EntryStatus};
pub use planner::{FlushPlan, FlushPlanner};

use tidemark_types::{EntityName, Ident};

/// Errors raised while tracking entities or planning a flush.
///
/// All of these are detected before any statement is sent; a flush that
/// fails with a `ContextError` has had no partial effect on the database.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// A second live instance was registered for an identity that is
    /// already managed.
    #[error("identity {0} is already managed by a different instance")]
    IdentityConflict(Ident),

    /// The foreign-key dependency graph contains a cycle with no nullable
    /// edge, so no valid statement order exists.
    #[error("unresolvable dependency cycle among {}", format_cycle(.0))]
    UnresolvableCycle(Vec<Ident>),

    /// No mapping metadata is registered for an entity type.
    #[error("no mapping metadata for entity {0}")]
    NoMetadata(EntityName),

    /// A tracked live object was dropped by the caller before the flush
    /// could read its state.
    #[error("live instance for {0} was dropped before flush")]
    DeadReference(Ident),

    /// An entity uses the caller-assigned key strategy but reached the
    /// flush without a key.
    #[error("entity {0} uses assigned keys but has no key value")]
    MissingKey(Ident),

    /// A foreign key references an entity that is neither persisted nor
    /// scheduled for insertion, and has no key of its own.
    #[error("association {entity}.{association} references an unmanaged, keyless instance")]
    UnresolvedReference {
        /// The referencing entity type.
        entity: EntityName,
        /// The association slot holding the reference.
        association: String,
    },
}

fn format_cycle(members: &[Ident]) -> String {
    let names: Vec<String> = members.iter().map(ToString::to_string).collect();
    names.join(", ")
}
