//! One tracked entity inside a unit of work.
//!
//! An [`EntityEntry`] is the context's record of a single managed instance:
//! its identity, status tag, the last-known persisted column snapshot (the
//! basis for per-column dirty diffing), the membership snapshot of owned
//! collections (the basis for orphan removal), and the optimistic version
//! value. The entry holds only a [`Weak`] reference to the live object --
//! the caller owns the object, the context owns the bookkeeping.
//!
//! [`Weak`]: std::sync::Weak

use std::collections::BTreeMap;

use tidemark_types::{EntityHandle, Ident, Value, WeakEntityHandle};

/// The lifecycle tag of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Registered for insertion; no row exists yet.
    New,
    /// Loaded from or written to the database; updates flow on flush.
    Managed,
    /// Scheduled for deletion; the entry is dropped once the delete runs.
    Removed,
    /// Tracked for repeatable reads but never written.
    ReadOnly,
}

/// The context's record of one managed instance.
#[derive(Debug)]
pub struct EntityEntry {
    ident: Ident,
    status: EntryStatus,
    live: WeakEntityHandle,
    /// Last-known persisted column values; `None` until the first
    /// successful insert (or the load that produced the entry).
    snapshot: Option<BTreeMap<String, Value>>,
    /// Identity membership of owned to-many associations at load / last
    /// flush, keyed by association name. Children that disappear from the
    /// live collection relative to this snapshot are orphans.
    children: BTreeMap<String, Vec<Ident>>,
    /// Current optimistic version value, if the type is versioned.
    version: Option<i64>,
    /// A lock request asked for a version increment at the next flush.
    force_version_bump: bool,
    /// `mark_dirty` was called: plan an update even if the diff is empty.
    force_dirty: bool,
}

impl EntityEntry {
    /// Create an entry for a live instance in the given status.
    pub fn new(ident: Ident, live: &EntityHandle, status: EntryStatus) -> Self {
        Self {
            ident,
            status,
            live: std::sync::Arc::downgrade(live),
            snapshot: None,
            children: BTreeMap::new(),
            version: None,
            force_version_bump: false,
            force_dirty: false,
        }
    }

    /// The entry's identity.
    pub const fn ident(&self) -> &Ident {
        &self.ident
    }

    /// The current status tag.
    pub const fn status(&self) -> EntryStatus {
        self.status
    }

    /// Set the status tag.
    pub const fn set_status(&mut self, status: EntryStatus) {
        self.status = status;
    }

    /// Upgrade the weak reference to the live object, if it still exists.
    pub fn live(&self) -> Option<EntityHandle> {
        self.live.upgrade()
    }

    /// Whether this entry tracks the given live instance.
    pub fn tracks(&self, handle: &EntityHandle) -> bool {
        self.live
            .upgrade()
            .is_some_and(|l| std::sync::Arc::ptr_eq(&l, handle))
    }

    /// The persisted column snapshot, if one exists.
    pub const fn snapshot(&self) -> Option<&BTreeMap<String, Value>> {
        self.snapshot.as_ref()
    }

    /// Replace the persisted column snapshot.
    pub fn set_snapshot(&mut self, snapshot: BTreeMap<String, Value>) {
        self.snapshot = Some(snapshot);
    }

    /// Merge freshly-written column values into the snapshot.
    pub fn merge_snapshot(&mut self, written: impl IntoIterator<Item = (String, Value)>) {
        let snapshot = self.snapshot.get_or_insert_with(BTreeMap::new);
        for (column, value) in written {
            snapshot.insert(column, value);
        }
    }

    /// The owned-collection membership snapshot.
    pub const fn children(&self) -> &BTreeMap<String, Vec<Ident>> {
        &self.children
    }

    /// Replace the owned-collection membership snapshot.
    pub fn set_children(&mut self, children: BTreeMap<String, Vec<Ident>>) {
        self.children = children;
    }

    /// The current optimistic version value.
    pub const fn version(&self) -> Option<i64> {
        self.version
    }

    /// Set the optimistic version value.
    pub const fn set_version(&mut self, version: i64) {
        self.version = Some(version);
    }

    /// Request a version increment at the next flush.
    pub const fn force_version_bump(&mut self) {
        self.force_version_bump = true;
    }

    /// Whether a version increment was requested.
    pub const fn version_bump_forced(&self) -> bool {
        self.force_version_bump
    }

    /// Clear the version-increment request (after the flush honors it).
    pub const fn clear_version_bump(&mut self) {
        self.force_version_bump = false;
    }

    /// Force an update at the next flush regardless of the diff.
    pub const fn mark_dirty(&mut self) {
        self.force_dirty = true;
    }

    /// Whether an update was forced.
    pub const fn dirty_forced(&self) -> bool {
        self.force_dirty
    }

    /// Clear the forced-dirty flag.
    pub const fn clear_dirty(&mut self) {
        self.force_dirty = false;
    }

    /// Re-key the entry after its pending key was assigned.
    pub fn rekey(&mut self, ident: Ident) {
        self.ident = ident;
    }

    /// Column-by-column diff of `current` against the snapshot.
    ///
    /// Returns the columns whose values differ (or are new). With no
    /// snapshot, every column counts as changed.
    pub fn dirty_columns(
        &self,
        current: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let Some(snapshot) = &self.snapshot else {
            return current.clone();
        };
        current
            .iter()
            .filter(|(column, value)| snapshot.get(*column) != Some(*value))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_types::Entity;

    fn entry_with_snapshot() -> (EntityEntry, EntityHandle) {
        let handle = Entity::new("Book")
            .with_key(Value::Int(1))
            .with_field("title", "Dune")
            .into_handle();
        let mut entry = EntityEntry::new(
            Ident::assigned("Book", Value::Int(1)),
            &handle,
            EntryStatus::Managed,
        );
        entry.set_snapshot(BTreeMap::from([
            ("id".to_owned(), Value::Int(1)),
            ("title".to_owned(), Value::from("Dune")),
        ]));
        (entry, handle)
    }

    #[test]
    fn diff_reports_only_changed_columns() {
        let (entry, _handle) = entry_with_snapshot();
        let current = BTreeMap::from([
            ("id".to_owned(), Value::Int(1)),
            ("title".to_owned(), Value::from("Dune Messiah")),
        ]);
        let dirty = entry.dirty_columns(&current);
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty.get("title"), Some(&Value::from("Dune Messiah")));
    }

    #[test]
    fn diff_without_snapshot_reports_everything() {
        let handle = Entity::new("Book").into_handle();
        let entry = EntityEntry::new(Ident::pending("Book", 1), &handle, EntryStatus::New);
        let current = BTreeMap::from([("title".to_owned(), Value::from("Dune"))]);
        assert_eq!(entry.dirty_columns(&current).len(), 1);
    }

    #[test]
    fn weak_reference_does_not_keep_object_alive() {
        let handle = Entity::new("Book").into_handle();
        let entry = EntityEntry::new(Ident::pending("Book", 1), &handle, EntryStatus::New);
        assert!(entry.live().is_some());
        drop(handle);
        assert!(entry.live().is_none());
    }

    #[test]
    fn tracks_compares_pointer_identity() {
        let (entry, handle) = entry_with_snapshot();
        let other = Entity::new("Book").with_key(Value::Int(1)).into_handle();
        assert!(entry.tracks(&handle));
        assert!(!entry.tracks(&other));
    }
}
