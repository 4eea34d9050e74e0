//! Cascade resolution across the live object graph.
//!
//! Given a root entity and a requested operation, [`resolve`] walks the
//! declared associations depth-first and returns every live entity that
//! must receive the same operation, root first. Traversal is keyed by
//! instance identity (the shared-handle pointer), so cyclic object graphs
//! terminate and each instance is visited at most once.
//!
//! Orphan detection is the second half of the module: an association
//! declared with orphan removal owns its children exclusively, so a child
//! that disappears from the live collection (removed or reassigned) is
//! deleted at the next flush even though nobody called remove on it.

use std::collections::BTreeSet;
use std::sync::Arc;

use tidemark_types::{
    AssocValue, CascadeOp, EntityHandle, MetadataRegistry, entity,
};
use tracing::trace;

use crate::ContextError;
use crate::context::PersistenceContext;
use crate::entry::EntryStatus;

/// One resolved cascade target: a live entity and the operation it
/// receives.
#[derive(Debug, Clone)]
pub struct CascadeItem {
    /// The live entity the operation applies to.
    pub handle: EntityHandle,
    /// The operation to apply (currently always the requested kind; kept
    /// per item so association-mapped operations stay expressible).
    pub op: CascadeOp,
}

/// Resolve the transitive cascade set for `op` starting at `root`.
///
/// Returns the root and every entity reachable through associations whose
/// declared cascade policy includes `op`, in deterministic pre-order
/// (associations in declaration order, collections in collection order).
///
/// # Errors
///
/// Returns [`ContextError::NoMetadata`] if a visited entity's type has no
/// registered mapping.
pub fn resolve(
    root: &EntityHandle,
    op: CascadeOp,
    registry: &MetadataRegistry,
) -> Result<Vec<CascadeItem>, ContextError> {
    let mut visited: BTreeSet<usize> = BTreeSet::new();
    let mut output = Vec::new();
    let mut stack: Vec<EntityHandle> = vec![Arc::clone(root)];

    while let Some(handle) = stack.pop() {
        let marker = Arc::as_ptr(&handle) as usize;
        if !visited.insert(marker) {
            continue;
        }

        let guard = entity::read(&handle);
        let name = guard.name().clone();
        let meta = registry
            .get(&name)
            .ok_or_else(|| ContextError::NoMetadata(name.clone()))?;

        // Push associated entities in reverse declaration order so they
        // pop in declaration order.
        let mut reachable: Vec<EntityHandle> = Vec::new();
        for assoc in &meta.associations {
            if !assoc.cascade.contains(op) {
                continue;
            }
            match guard.association(&assoc.name) {
                AssocValue::One(target) => reachable.push(Arc::clone(target)),
                AssocValue::Many(children) => {
                    reachable.extend(children.iter().map(Arc::clone));
                }
                AssocValue::Unset | AssocValue::Cleared => {}
            }
        }
        drop(guard);
        for next in reachable.into_iter().rev() {
            stack.push(next);
        }

        trace!(entity = %name, ?op, "cascade visit");
        output.push(CascadeItem { handle, op });
    }

    Ok(output)
}

/// Scan the context for orphans: children present in an entry's
/// owned-collection snapshot but missing from the live collection.
///
/// Returns the orphaned identities in deterministic order. Entries whose
/// live object is gone are skipped (nothing can have been detached from a
/// collection nobody can reach).
///
/// # Errors
///
/// Returns [`ContextError::NoMetadata`] if a tracked entity's type has no
/// registered mapping.
pub fn find_orphans(
    context: &PersistenceContext,
    registry: &MetadataRegistry,
) -> Result<Vec<tidemark_types::Ident>, ContextError> {
    let mut orphans = Vec::new();

    for entry in context.iter() {
        if entry.status() != EntryStatus::Managed {
            continue;
        }
        let Some(handle) = entry.live() else {
            continue;
        };
        let meta = registry
            .get(entry.ident().entity())
            .ok_or_else(|| ContextError::NoMetadata(entry.ident().entity().clone()))?;

        let current = context.owned_membership(&handle, &meta);
        for (assoc, previous) in entry.children() {
            let now: BTreeSet<&tidemark_types::Ident> =
                current.get(assoc).map(|v| v.iter()).into_iter().flatten().collect();
            for child in previous {
                let still_removed = context
                    .lookup(child)
                    .is_none_or(|e| e.status() == EntryStatus::Removed);
                if !now.contains(child) && !still_removed {
                    trace!(parent = %entry.ident(), orphan = %child, "orphan detected");
                    orphans.push(child.clone());
                }
            }
        }
    }

    Ok(orphans)
}
