//! Planned atomic database operations.
//!
//! Actions are value objects produced fresh by every flush; they are never
//! kept across flushes. An [`Action`] carries everything the executor
//! needs to render one statement: the operation kind, the target identity,
//! the column payload, and the optimistic-version expectation for updates
//! and deletes.
//!
//! Column parameters are [`ParamSource`]s rather than plain values because
//! an insert may reference the key of a row whose key is generated earlier
//! in the same plan; those references resolve at execution time.

use tidemark_types::{EntityName, Ident, Value};

/// The operation kind of a planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Produce a key via a round-trip identifier strategy.
    GenerateKey,
    /// Insert one row.
    Insert,
    /// Update columns of one row.
    Update,
    /// Delete one row.
    Delete,
}

/// One column parameter of a planned action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSource {
    /// A literal value known at planning time.
    Value(Value),
    /// The primary key of another tracked entity, resolved at execution
    /// time (after any pending key generation).
    KeyOf(Ident),
}

/// A planned, atomic database operation.
#[derive(Debug, Clone)]
pub struct Action {
    /// The operation kind.
    pub kind: ActionKind,
    /// The target entity type.
    pub entity: EntityName,
    /// The identity the action applies to. Pending until key generation
    /// for inserts of generated-key entities.
    pub ident: Ident,
    /// Column payload: insert values or update assignments, in column
    /// order. Empty for deletes and key generation.
    pub columns: Vec<(String, ParamSource)>,
    /// Version value the row is expected to hold, for updates and deletes
    /// of versioned entities. `None` disables the version predicate.
    pub expected_version: Option<i64>,
    /// Whether this update also increments the version column.
    pub bump_version: bool,
    /// Identities whose actions must have executed before this one.
    /// Consulted when deciding whether adjacent actions may share a batch.
    pub depends_on: Vec<Ident>,
}

impl Action {
    /// Build a key-generation action for a pending identity.
    pub const fn generate_key(entity: EntityName, ident: Ident) -> Self {
        Self {
            kind: ActionKind::GenerateKey,
            entity,
            ident,
            columns: Vec::new(),
            expected_version: None,
            bump_version: false,
            depends_on: Vec::new(),
        }
    }

    /// The structural shape of the action, for batching eligibility.
    pub fn shape(&self) -> ActionShape {
        ActionShape {
            kind: self.kind,
            entity: self.entity.clone(),
            columns: self.columns.iter().map(|(c, _)| c.clone()).collect(),
            versioned: self.expected_version.is_some(),
        }
    }
}

/// The batching key of an action: two actions may share a batched
/// statement only if their shapes are equal (and no dependency links
/// them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionShape {
    /// The operation kind.
    pub kind: ActionKind,
    /// The target entity type.
    pub entity: EntityName,
    /// The column names, in payload order.
    pub columns: Vec<String>,
    /// Whether a version predicate applies.
    pub versioned: bool,
}
