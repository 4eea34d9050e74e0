//! Flush planning: from tracked entries to an ordered action sequence.
//!
//! The planner walks the entry table, decides which rows must be inserted,
//! updated, or deleted, and orders the resulting actions so that every
//! foreign-key dependency is satisfied:
//!
//! - the insert of a referenced row precedes the inserts that reference it;
//! - the delete of a referencing row precedes the delete it references;
//! - within a dependency tier, ties break on (entity declaration index,
//!   identity), so plans are fully deterministic for batching and tests.
//!
//! Insert cycles are resolvable when at least one edge in the cycle is
//! nullable: the planner inserts that row with a NULL foreign key and
//! appends a follow-up update that patches the reference once both rows
//! exist. Delete cycles break symmetrically with a foreign-key-clearing
//! update ahead of the deletes. A cycle with no nullable edge fails with
//! [`ContextError::UnresolvableCycle`] before anything is sent.
//!
//! Key generation is part of the plan: strategies with no round trip
//! resolve while planning; round-trip strategies become leading
//! `GenerateKey` actions whose results substitute into dependent inserts
//! at execution time.

use std::collections::{BTreeMap, BTreeSet};

use tidemark_types::{
    AssocValue, AssociationKind, Entity, EntityMeta, IdStrategy, Ident, MetadataRegistry, Value,
    entity,
};
use tracing::debug;
use uuid::Uuid;

use crate::ContextError;
use crate::action::{Action, ActionKind, ParamSource};
use crate::context::PersistenceContext;
use crate::entry::EntryStatus;

/// An ordered sequence of actions produced by one flush.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// The actions, in execution order.
    pub actions: Vec<Action>,
}

impl FlushPlan {
    /// The number of planned actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the plan is empty (nothing to flush).
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One foreign-key reference discovered while extracting a row.
#[derive(Debug, Clone)]
struct EdgeRef {
    column: String,
    target: Ident,
    nullable: bool,
}

/// A work item: an action plus the references that order it.
#[derive(Debug)]
struct WorkItem {
    action: Action,
    refs: Vec<EdgeRef>,
    decl_index: usize,
}

/// Plans flushes against an immutable metadata registry.
#[derive(Debug, Clone, Copy)]
pub struct FlushPlanner<'a> {
    registry: &'a MetadataRegistry,
}

impl<'a> FlushPlanner<'a> {
    /// Create a planner over the given registry.
    pub const fn new(registry: &'a MetadataRegistry) -> Self {
        Self { registry }
    }

    /// Produce the ordered flush plan for the context's current state.
    ///
    /// Mutates the context only by resolving non-round-trip keys (UUID
    /// strategies assign here and re-key their entries). No statement is
    /// sent; any error leaves the database untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] for planning failures: missing metadata,
    /// dead references on new entries, missing assigned keys, unmanaged
    /// foreign-key targets, or unresolvable dependency cycles.
    pub fn plan(&self, context: &mut PersistenceContext) -> Result<FlushPlan, ContextError> {
        self.resolve_immediate_keys(context)?;

        let (generate_keys, inserts, updates, deletes) = self.collect_work(context)?;

        let (ordered_inserts, insert_fixups) = order_inserts(inserts)?;
        let (delete_fixups, ordered_deletes) = order_deletes(deletes)?;

        let mut actions = generate_keys;
        actions.extend(ordered_inserts);
        actions.extend(updates);
        actions.extend(insert_fixups);
        actions.extend(delete_fixups);
        actions.extend(ordered_deletes);

        debug!(actions = actions.len(), "flush plan ready");
        Ok(FlushPlan { actions })
    }

    /// Assign keys for new entries whose strategy needs no round trip.
    fn resolve_immediate_keys(
        &self,
        context: &mut PersistenceContext,
    ) -> Result<(), ContextError> {
        let mut assignments: Vec<(Ident, Value)> = Vec::new();

        for entry in context.iter() {
            if entry.status() != EntryStatus::New || !entry.ident().key().is_pending() {
                continue;
            }
            let ident = entry.ident().clone();
            let Some(handle) = entry.live() else {
                return Err(ContextError::DeadReference(ident));
            };
            let meta = self
                .registry
                .get(ident.entity())
                .ok_or_else(|| ContextError::NoMetadata(ident.entity().clone()))?;

            // A key the caller set by hand wins over any strategy.
            if let Some(key) = entity::read(&handle).key() {
                assignments.push((ident, key.clone()));
                continue;
            }

            match &meta.id_strategy {
                IdStrategy::Uuid => {
                    let key = Value::Uuid(Uuid::now_v7());
                    entity::write(&handle).set_key(key.clone());
                    assignments.push((ident, key));
                }
                IdStrategy::Assigned => return Err(ContextError::MissingKey(ident)),
                IdStrategy::Sequence { .. }
                | IdStrategy::TableRow { .. }
                | IdStrategy::Custom(_) => {}
            }
        }

        for (old, key) in assignments {
            context.rekey(&old, key);
        }
        Ok(())
    }

    /// Walk the entry table and build the unordered work items.
    #[allow(clippy::type_complexity)]
    fn collect_work(
        &self,
        context: &PersistenceContext,
    ) -> Result<(Vec<Action>, Vec<WorkItem>, Vec<Action>, Vec<WorkItem>), ContextError> {
        let mut generate_keys: Vec<(usize, Action)> = Vec::new();
        let mut inserts: Vec<WorkItem> = Vec::new();
        let mut updates: Vec<(usize, Action)> = Vec::new();
        let mut deletes: Vec<WorkItem> = Vec::new();

        for entry in context.iter() {
            let ident = entry.ident().clone();
            let meta = self
                .registry
                .get(ident.entity())
                .ok_or_else(|| ContextError::NoMetadata(ident.entity().clone()))?;

            match entry.status() {
                EntryStatus::ReadOnly => {}
                EntryStatus::New => {
                    let Some(handle) = entry.live() else {
                        return Err(ContextError::DeadReference(ident));
                    };
                    if ident.key().is_pending() {
                        generate_keys.push((
                            meta.decl_index,
                            Action::generate_key(meta.name.clone(), ident.clone()),
                        ));
                    }

                    let guard = entity::read(&handle);
                    let (columns, refs) =
                        self.extract_insert(context, &guard, &meta, &ident)?;
                    drop(guard);

                    let depends_on = refs.iter().map(|r| r.target.clone()).collect();
                    inserts.push(WorkItem {
                        action: Action {
                            kind: ActionKind::Insert,
                            entity: meta.name.clone(),
                            ident,
                            columns,
                            expected_version: None,
                            bump_version: false,
                            depends_on,
                        },
                        refs,
                        decl_index: meta.decl_index,
                    });
                }
                EntryStatus::Managed => {
                    // A dropped live object cannot have pending changes.
                    let Some(handle) = entry.live() else {
                        continue;
                    };
                    let guard = entity::read(&handle);
                    let current = self.extract_current(context, &guard, &meta)?;
                    drop(guard);

                    let changed = changed_columns(entry.snapshot(), &current);
                    let wants_update = !changed.is_empty()
                        || entry.dirty_forced()
                        || entry.version_bump_forced();
                    if !wants_update {
                        continue;
                    }
                    if changed.is_empty() && !meta.versioned() {
                        // Nothing to write and no version to bump.
                        continue;
                    }
                    updates.push((
                        meta.decl_index,
                        Action {
                            kind: ActionKind::Update,
                            entity: meta.name.clone(),
                            ident: ident.clone(),
                            columns: changed,
                            expected_version: entry.version(),
                            bump_version: meta.versioned(),
                            depends_on: Vec::new(),
                        },
                    ));
                }
                EntryStatus::Removed => {
                    // Delete ordering follows the *stored* foreign keys, so
                    // references come from the snapshot, not the live object.
                    let refs = delete_refs(entry.snapshot(), &meta);
                    let depends_on = Vec::new();
                    deletes.push(WorkItem {
                        action: Action {
                            kind: ActionKind::Delete,
                            entity: meta.name.clone(),
                            ident: ident.clone(),
                            columns: Vec::new(),
                            expected_version: entry.version(),
                            bump_version: false,
                            depends_on,
                        },
                        refs,
                        decl_index: meta.decl_index,
                    });
                }
            }
        }

        generate_keys.sort_by(|a, b| (a.0, &a.1.ident).cmp(&(b.0, &b.1.ident)));
        updates.sort_by(|a, b| (a.0, &a.1.ident).cmp(&(b.0, &b.1.ident)));

        Ok((
            generate_keys.into_iter().map(|(_, a)| a).collect(),
            inserts,
            updates.into_iter().map(|(_, a)| a).collect(),
            deletes,
        ))
    }

    /// Extract the full insert payload for a new entity, in declaration
    /// order: key, scalar fields, foreign keys, version.
    fn extract_insert(
        &self,
        context: &PersistenceContext,
        guard: &Entity,
        meta: &EntityMeta,
        ident: &Ident,
    ) -> Result<(Vec<(String, ParamSource)>, Vec<EdgeRef>), ContextError> {
        let mut columns: Vec<(String, ParamSource)> = Vec::new();
        let mut refs: Vec<EdgeRef> = Vec::new();

        let key_param = match ident.key_value() {
            Some(key) => ParamSource::Value(key.clone()),
            None => ParamSource::KeyOf(ident.clone()),
        };
        columns.push((meta.key_column.clone(), key_param));

        for field in &meta.fields {
            let value = guard
                .field(&field.name)
                .cloned()
                .unwrap_or(Value::Null);
            columns.push((field.column.clone(), ParamSource::Value(value)));
        }

        for assoc in &meta.associations {
            let AssociationKind::ManyToOne { column, nullable } = &assoc.kind else {
                continue;
            };
            let (param, target) =
                self.reference_param(context, guard, &assoc.name, &meta.name)?;
            if let Some(target) = target {
                refs.push(EdgeRef {
                    column: column.clone(),
                    target,
                    nullable: *nullable,
                });
            }
            columns.push((column.clone(), param));
        }

        if let Some(version_column) = &meta.version_column {
            columns.push((version_column.clone(), ParamSource::Value(Value::Int(0))));
        }

        Ok((columns, refs))
    }

    /// Extract the current column state of a managed entity for diffing.
    ///
    /// Untouched association slots and absent fields fall back to the
    /// snapshot value, so only genuine caller changes count as dirty.
    fn extract_current(
        &self,
        context: &PersistenceContext,
        guard: &Entity,
        meta: &EntityMeta,
    ) -> Result<Vec<(String, ParamSource)>, ContextError> {
        let ident = guard
            .key()
            .map(|k| Ident::assigned(meta.name.clone(), k.clone()));
        let snapshot = ident
            .as_ref()
            .and_then(|i| context.snapshot(i));

        let mut columns: Vec<(String, ParamSource)> = Vec::new();
        for field in &meta.fields {
            let value = guard.field(&field.name).cloned().or_else(|| {
                snapshot.and_then(|s| s.get(&field.column).cloned())
            });
            columns.push((
                field.column.clone(),
                ParamSource::Value(value.unwrap_or(Value::Null)),
            ));
        }

        for assoc in &meta.associations {
            let AssociationKind::ManyToOne { column, .. } = &assoc.kind else {
                continue;
            };
            match guard.association(&assoc.name) {
                AssocValue::Unset => {
                    let value = snapshot
                        .and_then(|s| s.get(column).cloned())
                        .unwrap_or(Value::Null);
                    columns.push((column.clone(), ParamSource::Value(value)));
                }
                AssocValue::Cleared => {
                    columns.push((column.clone(), ParamSource::Value(Value::Null)));
                }
                AssocValue::One(_) | AssocValue::Many(_) => {
                    let (param, _target) =
                        self.reference_param(context, guard, &assoc.name, &meta.name)?;
                    columns.push((column.clone(), param));
                }
            }
        }

        Ok(columns)
    }

    /// Resolve a to-one association slot into a column parameter, plus the
    /// referenced identity when the target is tracked.
    fn reference_param(
        &self,
        context: &PersistenceContext,
        guard: &Entity,
        assoc_name: &str,
        entity_name: &tidemark_types::EntityName,
    ) -> Result<(ParamSource, Option<Ident>), ContextError> {
        let Some(target) = guard.assoc_one(assoc_name) else {
            return Ok((ParamSource::Value(Value::Null), None));
        };

        let target_guard = entity::read(&target);
        if let Some(key) = target_guard.key() {
            let ident = Ident::assigned(target_guard.name().clone(), key.clone());
            return Ok((ParamSource::Value(key.clone()), Some(ident)));
        }
        drop(target_guard);

        // Keyless target: it must be tracked (its key arrives during this
        // flush), otherwise the reference can never be satisfied.
        match context.ident_of(&target) {
            Some(ident) => Ok((ParamSource::KeyOf(ident.clone()), Some(ident))),
            None => Err(ContextError::UnresolvedReference {
                entity: entity_name.clone(),
                association: assoc_name.to_owned(),
            }),
        }
    }
}

/// Diff extracted columns against a snapshot. `KeyOf` parameters always
/// count as changed; their targets are new rows.
fn changed_columns(
    snapshot: Option<&BTreeMap<String, Value>>,
    current: &[(String, ParamSource)],
) -> Vec<(String, ParamSource)> {
    current
        .iter()
        .filter(|(column, param)| match param {
            ParamSource::KeyOf(_) => true,
            ParamSource::Value(value) => {
                snapshot.is_none_or(|s| s.get(column) != Some(value))
            }
        })
        .cloned()
        .collect()
}

/// Stored foreign-key references of a removed row, from its snapshot.
fn delete_refs(
    snapshot: Option<&BTreeMap<String, Value>>,
    meta: &EntityMeta,
) -> Vec<EdgeRef> {
    let Some(snapshot) = snapshot else {
        return Vec::new();
    };
    let mut refs = Vec::new();
    for assoc in &meta.associations {
        let AssociationKind::ManyToOne { column, nullable } = &assoc.kind else {
            continue;
        };
        if let Some(value) = snapshot.get(column) {
            if !value.is_null() {
                refs.push(EdgeRef {
                    column: column.clone(),
                    target: Ident::assigned(assoc.target.clone(), value.clone()),
                    nullable: *nullable,
                });
            }
        }
    }
    refs
}

/// Topologically order the insert set; break cycles through nullable
/// edges. Returns the ordered inserts plus the follow-up foreign-key
/// patch updates, in that order.
fn order_inserts(items: Vec<WorkItem>) -> Result<(Vec<Action>, Vec<Action>), ContextError> {
    let mut graph = DependencyGraph::new(items, |item, edge| edge.target != item.action.ident);
    let mut fixups: Vec<Action> = Vec::new();

    let order = graph.order(|item, edge| {
        if !edge.nullable {
            return false;
        }
        // Insert with a NULL foreign key now, patch it afterwards.
        for (column, param) in &mut item.action.columns {
            if *column == edge.column {
                *param = ParamSource::Value(Value::Null);
            }
        }
        fixups.push(Action {
            kind: ActionKind::Update,
            entity: item.action.entity.clone(),
            ident: item.action.ident.clone(),
            columns: vec![(edge.column.clone(), ParamSource::KeyOf(edge.target.clone()))],
            expected_version: None,
            bump_version: false,
            depends_on: vec![item.action.ident.clone(), edge.target.clone()],
        });
        true
    })?;

    Ok((order, fixups))
}

/// Order the delete set so children go before parents; break cycles with
/// foreign-key-clearing updates that run ahead of every delete.
fn order_deletes(items: Vec<WorkItem>) -> Result<(Vec<Action>, Vec<Action>), ContextError> {
    // Edge direction is inverted relative to inserts: the *referencing*
    // row's delete precedes the row it references, so a delete waits on
    // the deletes of the rows that point at it.
    let by_ident: BTreeSet<Ident> = items.iter().map(|i| i.action.ident.clone()).collect();
    let mut inverted: BTreeMap<Ident, Vec<EdgeRef>> = BTreeMap::new();
    for item in &items {
        for edge in &item.refs {
            if by_ident.contains(&edge.target) {
                inverted.entry(edge.target.clone()).or_default().push(EdgeRef {
                    column: edge.column.clone(),
                    target: item.action.ident.clone(),
                    nullable: edge.nullable,
                });
            }
        }
    }

    let items: Vec<WorkItem> = items
        .into_iter()
        .map(|mut item| {
            item.refs = inverted.remove(&item.action.ident).unwrap_or_default();
            item.action.depends_on = item.refs.iter().map(|r| r.target.clone()).collect();
            item
        })
        .collect();

    let mut fixups: Vec<Action> = Vec::new();
    let mut graph = DependencyGraph::new(items, |item, edge| edge.target != item.action.ident);

    let order = graph.order(|item, edge| {
        if !edge.nullable {
            return false;
        }
        // Clear the child's foreign key before any delete runs. The edge
        // target is the referencing (child) row after inversion.
        fixups.push(Action {
            kind: ActionKind::Update,
            entity: edge.target.entity().clone(),
            ident: edge.target.clone(),
            columns: vec![(edge.column.clone(), ParamSource::Value(Value::Null))],
            expected_version: None,
            bump_version: false,
            depends_on: Vec::new(),
        });
        let _ = item;
        true
    })?;

    Ok((fixups, order))
}

/// A dependency graph over work items with deterministic Kahn ordering
/// and pluggable cycle breaking.
struct DependencyGraph {
    items: Vec<WorkItem>,
    /// Node ids sorted by (declaration index, identity).
    ranked: Vec<usize>,
}

impl DependencyGraph {
    fn new<F>(items: Vec<WorkItem>, keep_edge: F) -> Self
    where
        F: Fn(&WorkItem, &EdgeRef) -> bool,
    {
        // Drop self-edges up front; a row referencing itself needs no
        // ordering between "both" of its actions.
        let items: Vec<WorkItem> = items
            .into_iter()
            .map(|mut item| {
                let kept: Vec<EdgeRef> = item
                    .refs
                    .iter()
                    .filter(|e| keep_edge(&item, e))
                    .cloned()
                    .collect();
                item.refs = kept;
                item
            })
            .collect();

        let mut ranked: Vec<usize> = (0..items.len()).collect();
        ranked.sort_by(|&a, &b| {
            let ka = items.get(a).map(|i| (i.decl_index, i.action.ident.clone()));
            let kb = items.get(b).map(|i| (i.decl_index, i.action.ident.clone()));
            ka.cmp(&kb)
        });

        Self { items, ranked }
    }

    /// Produce the topological order. `break_edge` is offered stalled
    /// (item, edge) pairs in deterministic order and returns whether it
    /// dissolved the edge; if no edge of a stalled cycle dissolves, the
    /// remaining identities form the [`ContextError::UnresolvableCycle`].
    fn order<F>(&mut self, mut break_edge: F) -> Result<Vec<Action>, ContextError>
    where
        F: FnMut(&mut WorkItem, &EdgeRef) -> bool,
    {
        let index_of: BTreeMap<Ident, usize> = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.action.ident.clone(), i))
            .collect();

        let mut indegree: Vec<usize> = vec![0; self.items.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.items.len()];
        for (i, item) in self.items.iter().enumerate() {
            for edge in &item.refs {
                if let Some(&target) = index_of.get(&edge.target) {
                    if let Some(slot) = dependents.get_mut(target) {
                        slot.push(i);
                    }
                    if let Some(d) = indegree.get_mut(i) {
                        *d = d.saturating_add(1);
                    }
                }
            }
        }

        let rank_of: BTreeMap<usize, usize> = self
            .ranked
            .iter()
            .enumerate()
            .map(|(rank, &id)| (id, rank))
            .collect();

        let mut ready: BTreeSet<usize> = self
            .ranked
            .iter()
            .enumerate()
            .filter(|&(_, &id)| indegree.get(id).copied() == Some(0))
            .map(|(rank, _)| rank)
            .collect();

        let mut emitted: Vec<bool> = vec![false; self.items.len()];
        let mut order: Vec<usize> = Vec::with_capacity(self.items.len());

        while order.len() < self.items.len() {
            if let Some(&rank) = ready.iter().next() {
                ready.remove(&rank);
                let Some(&id) = self.ranked.get(rank) else {
                    continue;
                };
                if let Some(flag) = emitted.get_mut(id) {
                    *flag = true;
                }
                order.push(id);
                for &dep in dependents.get(id).map_or(&[] as &[usize], Vec::as_slice) {
                    if let Some(d) = indegree.get_mut(dep) {
                        *d = d.saturating_sub(1);
                        if *d == 0 {
                            if let Some(&r) = rank_of.get(&dep) {
                                ready.insert(r);
                            }
                        }
                    }
                }
                continue;
            }

            // Stalled: every remaining node sits on a cycle. Offer edges
            // into unfinished targets for breaking, in deterministic order.
            let broke = self.try_break_edge(&index_of, &emitted, &mut indegree, &rank_of, &mut ready, &mut break_edge);
            if !broke {
                let stuck: Vec<Ident> = self
                    .ranked
                    .iter()
                    .filter(|&&id| emitted.get(id).copied() == Some(false))
                    .filter_map(|&id| self.items.get(id).map(|i| i.action.ident.clone()))
                    .collect();
                return Err(ContextError::UnresolvableCycle(stuck));
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| self.items.get(id).map(|i| i.action.clone()))
            .collect())
    }

    fn try_break_edge<F>(
        &mut self,
        index_of: &BTreeMap<Ident, usize>,
        emitted: &[bool],
        indegree: &mut [usize],
        rank_of: &BTreeMap<usize, usize>,
        ready: &mut BTreeSet<usize>,
        break_edge: &mut F,
    ) -> bool
    where
        F: FnMut(&mut WorkItem, &EdgeRef) -> bool,
    {
        for &id in &self.ranked {
            if emitted.get(id).copied() != Some(false) {
                continue;
            }
            let Some(item) = self.items.get(id) else {
                continue;
            };
            // Every edge into an unfinished target is a candidate; the
            // first one the callback can dissolve wins.
            let candidates: Vec<usize> = item
                .refs
                .iter()
                .enumerate()
                .filter(|(_, edge)| {
                    index_of
                        .get(&edge.target)
                        .is_some_and(|&t| emitted.get(t).copied() == Some(false))
                })
                .map(|(edge_index, _)| edge_index)
                .collect();

            for edge_index in candidates {
                let Some(item) = self.items.get_mut(id) else {
                    break;
                };
                let Some(edge) = item.refs.get(edge_index).cloned() else {
                    continue;
                };
                if !break_edge(item, &edge) {
                    continue;
                }
                item.refs.remove(edge_index);
                if let Some(d) = indegree.get_mut(id) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        if let Some(&r) = rank_of.get(&id) {
                            ready.insert(r);
                        }
                    }
                }
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    use tidemark_types::{CascadeSet, Entity, EntityHandle, MetadataRegistry};

    use crate::entry::EntityEntry;

    /// Author 1-* Book, Book has a non-nullable FK to Author.
    fn library_registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityMeta::define("Author", "authors")
                    .key("id", IdStrategy::Assigned)
                    .field("name")
                    .versioned("version")
                    .one_to_many("books", "Book", "author", CascadeSet::all(), true),
            )
            .entity(
                EntityMeta::define("Book", "books")
                    .key("id", IdStrategy::Assigned)
                    .field("title")
                    .many_to_one("author", "Author", "author_id", false, CascadeSet::none()),
            )
            .build()
            .unwrap()
    }

    /// Two mutually-referencing types; Pilot -> Wing is nullable.
    fn cyclic_registry(nullable: bool) -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(EntityMeta::define("Pilot", "pilots").key("id", IdStrategy::Assigned).many_to_one(
                "wing",
                "Wing",
                "wing_id",
                nullable,
                CascadeSet::none(),
            ))
            .entity(EntityMeta::define("Wing", "wings").key("id", IdStrategy::Assigned).many_to_one(
                "leader",
                "Pilot",
                "leader_id",
                false,
                CascadeSet::none(),
            ))
            .build()
            .unwrap()
    }

    fn register_new(context: &mut PersistenceContext, handle: &EntityHandle) -> Ident {
        let key = entity::read(handle).key().cloned();
        let name = entity::read(handle).name().clone();
        let ident = match key {
            Some(k) => Ident::assigned(name, k),
            None => Ident::pending(name, context.allocate_pending()),
        };
        let entry = EntityEntry::new(ident.clone(), handle, EntryStatus::New);
        context.register(entry).unwrap();
        ident
    }

    fn kinds(plan: &FlushPlan) -> Vec<(ActionKind, String)> {
        plan.actions
            .iter()
            .map(|a| (a.kind, a.ident.to_string()))
            .collect()
    }

    #[test]
    fn referenced_insert_precedes_referencing_insert() {
        let registry = library_registry();
        let mut context = PersistenceContext::new();

        let author = Entity::new("Author")
            .with_key(Value::Int(1))
            .with_field("name", "Frank Herbert")
            .into_handle();
        let book = Entity::new("Book")
            .with_key(Value::Int(10))
            .with_field("title", "Dune")
            .into_handle();
        entity::write(&book).set_assoc("author", &author);

        // Register in the "wrong" order on purpose.
        register_new(&mut context, &book);
        register_new(&mut context, &author);

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![
                (ActionKind::Insert, "Author#1".to_owned()),
                (ActionKind::Insert, "Book#10".to_owned()),
            ]
        );
    }

    #[test]
    fn insert_payload_is_in_declaration_order() {
        let registry = library_registry();
        let mut context = PersistenceContext::new();
        let author = Entity::new("Author")
            .with_key(Value::Int(1))
            .with_field("name", "Ursula K. Le Guin")
            .into_handle();
        register_new(&mut context, &author);

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        let columns: Vec<&str> = plan.actions[0]
            .columns
            .iter()
            .map(|(c, _)| c.as_str())
            .collect();
        assert_eq!(columns, vec!["id", "name", "version"]);
    }

    #[test]
    fn nullable_cycle_resolves_with_patch_update() {
        let registry = cyclic_registry(true);
        let mut context = PersistenceContext::new();

        let pilot = Entity::new("Pilot").with_key(Value::Int(1)).into_handle();
        let wing = Entity::new("Wing").with_key(Value::Int(2)).into_handle();
        entity::write(&pilot).set_assoc("wing", &wing);
        entity::write(&wing).set_assoc("leader", &pilot);

        register_new(&mut context, &pilot);
        register_new(&mut context, &wing);

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![
                (ActionKind::Insert, "Pilot#1".to_owned()),
                (ActionKind::Insert, "Wing#2".to_owned()),
                (ActionKind::Update, "Pilot#1".to_owned()),
            ]
        );

        // The pilot inserts with a NULL wing reference...
        let pilot_insert = &plan.actions[0];
        let wing_column = pilot_insert
            .columns
            .iter()
            .find(|(c, _)| c == "wing_id")
            .unwrap();
        assert_eq!(wing_column.1, ParamSource::Value(Value::Null));

        // ...and the patch update restores it afterwards.
        let patch = &plan.actions[2];
        assert_eq!(patch.columns.len(), 1);
        assert!(matches!(patch.columns[0].1, ParamSource::KeyOf(_)));
    }

    #[test]
    fn fully_non_nullable_cycle_is_rejected() {
        let registry = cyclic_registry(false);
        let mut context = PersistenceContext::new();

        let pilot = Entity::new("Pilot").with_key(Value::Int(1)).into_handle();
        let wing = Entity::new("Wing").with_key(Value::Int(2)).into_handle();
        entity::write(&pilot).set_assoc("wing", &wing);
        entity::write(&wing).set_assoc("leader", &pilot);

        register_new(&mut context, &pilot);
        register_new(&mut context, &wing);

        let result = FlushPlanner::new(&registry).plan(&mut context);
        assert!(matches!(result, Err(ContextError::UnresolvableCycle(_))));
    }

    #[test]
    fn update_contains_only_changed_columns() {
        let registry = library_registry();
        let mut context = PersistenceContext::new();

        let author = Entity::new("Author")
            .with_key(Value::Int(1))
            .with_field("name", "Iain Banks")
            .into_handle();
        let ident = Ident::assigned("Author", Value::Int(1));
        let mut entry = EntityEntry::new(ident.clone(), &author, EntryStatus::Managed);
        entry.set_snapshot(
            [
                ("id".to_owned(), Value::Int(1)),
                ("name".to_owned(), Value::from("Iain Banks")),
                ("version".to_owned(), Value::Int(3)),
            ]
            .into(),
        );
        entry.set_version(3);
        context.register(entry).unwrap();

        // Clean entity: nothing to flush.
        let empty = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert!(empty.is_empty());

        entity::write(&author).set_field("name", "Iain M. Banks");
        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert_eq!(plan.len(), 1);
        let update = &plan.actions[0];
        assert_eq!(update.kind, ActionKind::Update);
        assert_eq!(update.expected_version, Some(3));
        assert!(update.bump_version);
        assert_eq!(update.columns.len(), 1);
        assert_eq!(update.columns[0].0, "name");
    }

    #[test]
    fn referencing_delete_precedes_referenced_delete() {
        let registry = library_registry();
        let mut context = PersistenceContext::new();

        let author = Entity::new("Author").with_key(Value::Int(1)).into_handle();
        let book = Entity::new("Book").with_key(Value::Int(10)).into_handle();

        let author_ident = Ident::assigned("Author", Value::Int(1));
        let book_ident = Ident::assigned("Book", Value::Int(10));

        let mut author_entry =
            EntityEntry::new(author_ident.clone(), &author, EntryStatus::Managed);
        author_entry.set_snapshot([("id".to_owned(), Value::Int(1))].into());
        let mut book_entry = EntityEntry::new(book_ident.clone(), &book, EntryStatus::Managed);
        book_entry.set_snapshot(
            [
                ("id".to_owned(), Value::Int(10)),
                ("author_id".to_owned(), Value::Int(1)),
            ]
            .into(),
        );
        context.register(author_entry).unwrap();
        context.register(book_entry).unwrap();

        context.mark_removed(&author_ident);
        context.mark_removed(&book_ident);

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![
                (ActionKind::Delete, "Book#10".to_owned()),
                (ActionKind::Delete, "Author#1".to_owned()),
            ]
        );
    }

    #[test]
    fn same_tier_ties_break_on_declaration_then_identity() {
        let registry = library_registry();
        let mut context = PersistenceContext::new();

        let second = Entity::new("Book").with_key(Value::Int(2)).into_handle();
        let first = Entity::new("Book").with_key(Value::Int(1)).into_handle();
        let author = Entity::new("Author").with_key(Value::Int(7)).into_handle();

        register_new(&mut context, &second);
        register_new(&mut context, &first);
        register_new(&mut context, &author);

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![
                (ActionKind::Insert, "Author#7".to_owned()),
                (ActionKind::Insert, "Book#1".to_owned()),
                (ActionKind::Insert, "Book#2".to_owned()),
            ]
        );
    }

    #[test]
    fn uuid_strategy_assigns_keys_at_planning_time() {
        let registry = MetadataRegistry::builder()
            .entity(EntityMeta::define("Tag", "tags").key("id", IdStrategy::Uuid).field("label"))
            .build()
            .unwrap();
        let mut context = PersistenceContext::new();
        let tag = Entity::new("Tag").with_field("label", "sf").into_handle();
        let pending = register_new(&mut context, &tag);
        assert!(pending.key().is_pending());

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::Insert);
        assert!(entity::read(&tag).key().is_some());
        assert!(plan.actions[0].ident.key_value().is_some());
    }

    #[test]
    fn sequence_strategy_plans_leading_key_generation() {
        let registry = MetadataRegistry::builder()
            .entity(
                EntityMeta::define("Order", "orders")
                    .key(
                        "id",
                        IdStrategy::Sequence {
                            sequence: "order_id_seq".to_owned(),
                        },
                    )
                    .field("total"),
            )
            .build()
            .unwrap();
        let mut context = PersistenceContext::new();
        let order = Entity::new("Order").with_field("total", 40i64).into_handle();
        register_new(&mut context, &order);

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.actions[0].kind, ActionKind::GenerateKey);
        assert_eq!(plan.actions[1].kind, ActionKind::Insert);
        // The insert's key column resolves from the pending identity.
        assert!(matches!(
            plan.actions[1].columns[0].1,
            ParamSource::KeyOf(_)
        ));
    }

    #[test]
    fn forced_version_bump_plans_an_update() {
        let registry = library_registry();
        let mut context = PersistenceContext::new();

        let author = Entity::new("Author")
            .with_key(Value::Int(1))
            .with_field("name", "N")
            .into_handle();
        let ident = Ident::assigned("Author", Value::Int(1));
        let mut entry = EntityEntry::new(ident.clone(), &author, EntryStatus::Managed);
        entry.set_snapshot(
            [
                ("id".to_owned(), Value::Int(1)),
                ("name".to_owned(), Value::from("N")),
            ]
            .into(),
        );
        entry.set_version(5);
        entry.force_version_bump();
        context.register(entry).unwrap();

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        assert_eq!(plan.len(), 1);
        let action = &plan.actions[0];
        assert_eq!(action.kind, ActionKind::Update);
        assert!(action.columns.is_empty());
        assert_eq!(action.expected_version, Some(5));
        assert!(action.bump_version);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// A registry with one self-referential type: each row may point
        /// at another row of the same table through `parent_id`.
        fn chain_registry() -> MetadataRegistry {
            MetadataRegistry::builder()
                .entity(
                    EntityMeta::define("Node", "nodes")
                        .key("id", IdStrategy::Assigned)
                        .field("label")
                        .many_to_one("parent", "Node", "parent_id", false, CascadeSet::none()),
                )
                .build()
                .unwrap()
        }

        /// Edges `i -> parents[i]` where `parents[i] < i`: guaranteed acyclic.
        fn acyclic_parents(n: usize) -> impl Strategy<Value = Vec<Option<usize>>> {
            (0..n)
                .map(|i| {
                    if i == 0 {
                        Just(None::<usize>).boxed()
                    } else {
                        proptest::option::of(0..i).boxed()
                    }
                })
                .collect::<Vec<_>>()
        }

        proptest! {
            #[test]
            fn insert_order_is_topological(parents in (1usize..8).prop_flat_map(acyclic_parents)) {
                let registry = chain_registry();
                let mut context = PersistenceContext::new();

                let handles: Vec<EntityHandle> = (0..parents.len())
                    .map(|i| {
                        Entity::new("Node")
                            .with_key(Value::Int(i64::try_from(i).unwrap_or(0)))
                            .into_handle()
                    })
                    .collect();
                for (i, parent) in parents.iter().enumerate() {
                    if let Some(p) = parent {
                        entity::write(&handles[i]).set_assoc("parent", &handles[*p]);
                    }
                }
                for handle in &handles {
                    register_new(&mut context, handle);
                }

                let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
                let position: BTreeMap<String, usize> = plan
                    .actions
                    .iter()
                    .enumerate()
                    .map(|(pos, a)| (a.ident.to_string(), pos))
                    .collect();

                for (i, parent) in parents.iter().enumerate() {
                    if let Some(p) = parent {
                        let child = format!("Node#{i}");
                        let parent = format!("Node#{p}");
                        prop_assert!(position[&parent] < position[&child]);
                    }
                }
            }

            #[test]
            fn delete_order_is_reverse_topological(parents in (1usize..8).prop_flat_map(acyclic_parents)) {
                let registry = chain_registry();
                let mut context = PersistenceContext::new();

                let handles: Vec<EntityHandle> = (0..parents.len())
                    .map(|i| {
                        Entity::new("Node")
                            .with_key(Value::Int(i64::try_from(i).unwrap_or(0)))
                            .into_handle()
                    })
                    .collect();
                for (i, parent) in parents.iter().enumerate() {
                    let ident = Ident::assigned("Node", Value::Int(i64::try_from(i).unwrap_or(0)));
                    let mut entry = EntityEntry::new(ident.clone(), &handles[i], EntryStatus::Managed);
                    let mut snapshot: BTreeMap<String, Value> =
                        [("id".to_owned(), Value::Int(i64::try_from(i).unwrap_or(0)))].into();
                    if let Some(p) = parent {
                        snapshot.insert(
                            "parent_id".to_owned(),
                            Value::Int(i64::try_from(*p).unwrap_or(0)),
                        );
                    }
                    entry.set_snapshot(snapshot);
                    context.register(entry).unwrap();
                    context.mark_removed(&ident);
                }

                let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
                let position: BTreeMap<String, usize> = plan
                    .actions
                    .iter()
                    .enumerate()
                    .map(|(pos, a)| (a.ident.to_string(), pos))
                    .collect();

                for (i, parent) in parents.iter().enumerate() {
                    if let Some(p) = parent {
                        let child = format!("Node#{i}");
                        let parent = format!("Node#{p}");
                        prop_assert!(position[&child] < position[&parent]);
                    }
                }
            }
        }
    }
}
