//! The identity-keyed entry table for one unit of work.
//!
//! A [`PersistenceContext`] is exclusively owned by its session and lives
//! exactly as long as the unit of work. It maps identities to
//! [`EntityEntry`] records in a [`BTreeMap`], so iteration order -- and
//! therefore everything the planner derives from it -- is deterministic.
//!
//! The context never owns live objects. It can only reach them while the
//! caller keeps them alive; see [`EntityEntry::live`].

use std::collections::BTreeMap;

use tidemark_types::{AssocValue, EntityHandle, EntityMeta, Ident, Value, entity};
use tracing::debug;

use crate::ContextError;
use crate::entry::{EntityEntry, EntryStatus};

/// The full entry table plus flush bookkeeping for one unit of work.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: BTreeMap<Ident, EntityEntry>,
    next_pending: u64,
    flushing: bool,
}

impl PersistenceContext {
    /// Create an empty context.
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_pending: 0,
            flushing: false,
        }
    }

    /// The number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the context tracks no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate a pending-key serial, unique within this context.
    pub const fn allocate_pending(&mut self) -> u64 {
        let serial = self.next_pending;
        self.next_pending = self.next_pending.wrapping_add(1);
        serial
    }

    /// Register an entry.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::IdentityConflict`] if the identity is
    /// already tracked through a *different* live instance. Re-registering
    /// the same instance is a no-op.
    pub fn register(&mut self, entry: EntityEntry) -> Result<(), ContextError> {
        if let Some(existing) = self.entries.get(entry.ident()) {
            let same = match (existing.live(), entry.live()) {
                (Some(a), Some(b)) => std::sync::Arc::ptr_eq(&a, &b),
                _ => false,
            };
            if same {
                return Ok(());
            }
            return Err(ContextError::IdentityConflict(entry.ident().clone()));
        }
        debug!(ident = %entry.ident(), status = ?entry.status(), "registering entry");
        self.entries.insert(entry.ident().clone(), entry);
        Ok(())
    }

    /// Look up an entry by identity.
    pub fn lookup(&self, ident: &Ident) -> Option<&EntityEntry> {
        self.entries.get(ident)
    }

    /// Look up an entry mutably by identity.
    pub fn lookup_mut(&mut self, ident: &Ident) -> Option<&mut EntityEntry> {
        self.entries.get_mut(ident)
    }

    /// Find the identity tracking a given live instance, if any.
    pub fn ident_of(&self, handle: &EntityHandle) -> Option<Ident> {
        self.entries
            .values()
            .find(|e| e.tracks(handle))
            .map(|e| e.ident().clone())
    }

    /// Force an update for the identity at the next flush.
    pub fn mark_dirty(&mut self, ident: &Ident) {
        if let Some(entry) = self.entries.get_mut(ident) {
            entry.mark_dirty();
        }
    }

    /// Transition the identity to [`EntryStatus::Removed`].
    ///
    /// The entry stays in the table until the delete action executes; only
    /// then does [`forget`] drop it.
    ///
    /// [`forget`]: Self::forget
    pub fn mark_removed(&mut self, ident: &Ident) {
        if let Some(entry) = self.entries.get_mut(ident) {
            entry.set_status(EntryStatus::Removed);
        }
    }

    /// The persisted snapshot for an identity, if any.
    pub fn snapshot(&self, ident: &Ident) -> Option<&BTreeMap<String, Value>> {
        self.entries.get(ident).and_then(EntityEntry::snapshot)
    }

    /// Drop an entry entirely (detach, or completion of a delete).
    pub fn forget(&mut self, ident: &Ident) -> Option<EntityEntry> {
        self.entries.remove(ident)
    }

    /// Re-key an entry whose pending key has been assigned.
    ///
    /// Returns the new identity, or `None` if the old identity is unknown.
    pub fn rekey(&mut self, old: &Ident, key: Value) -> Option<Ident> {
        let mut entry = self.entries.remove(old)?;
        let ident = old.with_assigned_key(key);
        entry.rekey(ident.clone());
        self.entries.insert(ident.clone(), entry);
        Some(ident)
    }

    /// Iterate entries in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    /// Iterate entries mutably in identity order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EntityEntry> {
        self.entries.values_mut()
    }

    /// Drop every entry. Used when the owning session closes or clears.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether a flush is currently in progress.
    pub const fn flushing(&self) -> bool {
        self.flushing
    }

    /// Mark the start of a flush.
    pub const fn begin_flush(&mut self) {
        self.flushing = true;
    }

    /// Mark the end of a flush.
    pub const fn end_flush(&mut self) {
        self.flushing = false;
    }

    /// Compute the current owned-collection membership of a live entity:
    /// association name to the identities of the children present in the
    /// live collection and tracked by this context.
    ///
    /// Children the context does not track have no identity yet and are
    /// skipped; they become relevant once registered.
    pub fn owned_membership(
        &self,
        handle: &EntityHandle,
        meta: &EntityMeta,
    ) -> BTreeMap<String, Vec<Ident>> {
        let guard = entity::read(handle);
        let mut membership = BTreeMap::new();
        for assoc in &meta.associations {
            if !assoc.orphan_removal {
                continue;
            }
            if let AssocValue::Many(children) = guard.association(&assoc.name) {
                let idents: Vec<Ident> = children
                    .iter()
                    .filter_map(|child| self.ident_of(child))
                    .collect();
                membership.insert(assoc.name.clone(), idents);
            } else {
                membership.insert(assoc.name.clone(), Vec::new());
            }
        }
        membership
    }
}
