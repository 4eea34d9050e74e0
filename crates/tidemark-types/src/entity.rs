//! The live, caller-owned entity representation.
//!
//! An [`Entity`] holds the runtime state of one object: its entity name, an
//! optional primary-key value, scalar fields, and association slots that
//! point at *other live entities* through shared handles. The object graph
//! may be cyclic; handles are reference-counted and the persistence context
//! only ever keeps `Weak` references to them, so the caller alone controls
//! entity lifetimes.
//!
//! An [`EntityHandle`] is `Arc<RwLock<Entity>>`: callers mutate entities
//! freely between operations, and the engine reads a consistent view when
//! it needs one (registration, dirty check, flush). Guard acquisition
//! recovers from poisoning rather than panicking, matching the workspace's
//! no-panic policy.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::ident::EntityName;
use crate::value::Value;

/// Shared handle to a live entity.
pub type EntityHandle = Arc<RwLock<Entity>>;

/// Non-owning handle to a live entity, held by the persistence context.
pub type WeakEntityHandle = Weak<RwLock<Entity>>;

/// Acquire a read guard, recovering the inner data if the lock is poisoned.
pub fn read(handle: &EntityHandle) -> RwLockReadGuard<'_, Entity> {
    handle.read().unwrap_or_else(PoisonError::into_inner)
}

/// Acquire a write guard, recovering the inner data if the lock is poisoned.
pub fn write(handle: &EntityHandle) -> RwLockWriteGuard<'_, Entity> {
    handle.write().unwrap_or_else(PoisonError::into_inner)
}

/// The value of one association slot on a live entity.
///
/// `Unset` and `Cleared` are deliberately distinct: an entity loaded from
/// the database never materializes its associations (on-demand fetching is
/// out of scope), so an untouched slot means "whatever the stored foreign
/// key says", while an explicitly cleared slot means "set the foreign key
/// to NULL at the next flush".
#[derive(Debug, Clone, Default)]
pub enum AssocValue {
    /// The slot has never been touched on this live instance.
    #[default]
    Unset,
    /// A to-one association pointing at another live entity.
    One(EntityHandle),
    /// A to-one association explicitly cleared by the caller.
    Cleared,
    /// A to-many association holding an ordered collection of live entities.
    Many(Vec<EntityHandle>),
}

/// The live state of one object under (or about to come under) management.
#[derive(Debug, Clone)]
pub struct Entity {
    name: EntityName,
    key: Option<Value>,
    fields: BTreeMap<String, Value>,
    associations: BTreeMap<String, AssocValue>,
}

impl Entity {
    /// Create an empty entity of the given declared type.
    pub fn new(name: impl Into<EntityName>) -> Self {
        Self {
            name: name.into(),
            key: None,
            fields: BTreeMap::new(),
            associations: BTreeMap::new(),
        }
    }

    /// The declared entity name.
    pub const fn name(&self) -> &EntityName {
        &self.name
    }

    /// The primary-key value, if one has been assigned.
    pub const fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// Assign the primary-key value.
    pub fn set_key(&mut self, key: Value) {
        self.key = Some(key);
    }

    /// Builder-style key assignment for test and seed data.
    #[must_use]
    pub fn with_key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    /// Read a scalar field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a scalar field value.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Iterate over scalar fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Read an association slot.
    pub fn association(&self, name: &str) -> &AssocValue {
        static UNSET: AssocValue = AssocValue::Unset;
        self.associations.get(name).unwrap_or(&UNSET)
    }

    /// The target of a to-one association, if set.
    pub fn assoc_one(&self, name: &str) -> Option<EntityHandle> {
        match self.associations.get(name) {
            Some(AssocValue::One(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// The members of a to-many association (empty if unset).
    pub fn assoc_many(&self, name: &str) -> Vec<EntityHandle> {
        match self.associations.get(name) {
            Some(AssocValue::Many(handles)) => handles.iter().map(Arc::clone).collect(),
            _ => Vec::new(),
        }
    }

    /// Point a to-one association at another live entity.
    pub fn set_assoc(&mut self, name: impl Into<String>, target: &EntityHandle) {
        self.associations
            .insert(name.into(), AssocValue::One(Arc::clone(target)));
    }

    /// Explicitly clear a to-one association: the foreign key becomes NULL
    /// at the next flush (unlike a never-touched slot, which keeps the
    /// stored value).
    pub fn clear_assoc(&mut self, name: &str) {
        self.associations.insert(name.to_owned(), AssocValue::Cleared);
    }

    /// Return an association slot to the untouched state, making the
    /// stored foreign key authoritative again. Used when reloading.
    pub fn unset_assoc(&mut self, name: &str) {
        self.associations.remove(name);
    }

    /// Replace the full membership of a to-many association.
    pub fn set_children(&mut self, name: impl Into<String>, children: Vec<EntityHandle>) {
        self.associations
            .insert(name.into(), AssocValue::Many(children));
    }

    /// Append one member to a to-many association.
    pub fn add_child(&mut self, name: impl Into<String>, child: &EntityHandle) {
        let slot = self
            .associations
            .entry(name.into())
            .or_insert_with(|| AssocValue::Many(Vec::new()));
        match slot {
            AssocValue::Many(children) => children.push(Arc::clone(child)),
            other => *other = AssocValue::Many(vec![Arc::clone(child)]),
        }
    }

    /// Remove one member from a to-many association by handle identity.
    ///
    /// Returns whether a member was removed. Used by callers to detach a
    /// child; with orphan removal declared, the next flush deletes it.
    pub fn remove_child(&mut self, name: &str, child: &EntityHandle) -> bool {
        if let Some(AssocValue::Many(children)) = self.associations.get_mut(name) {
            let before = children.len();
            children.retain(|c| !Arc::ptr_eq(c, child));
            return children.len() < before;
        }
        false
    }

    /// Wrap this entity into a shared [`EntityHandle`].
    pub fn into_handle(self) -> EntityHandle {
        Arc::new(RwLock::new(self))
    }
}
