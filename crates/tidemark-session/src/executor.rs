//! Plan execution: actions to statements, strictly in plan order.
//!
//! The executor walks a [`FlushPlan`] and drives the connection. Runs of
//! adjacent inserts with the same shape and no dependency link inside the
//! run are handed to the driver as one batch (one round trip, row order =
//! plan order); everything else executes one statement at a time.
//!
//! After every successful action the entry table is brought up to date:
//! snapshots absorb the just-written values, versions increment, deleted
//! entries are forgotten. A versioned update or delete that affects zero
//! rows means someone else won the race; the flush stops immediately with
//! [`SessionError::Stale`] and nothing later in the plan runs.

use std::collections::BTreeMap;

use tidemark_context::{Action, ActionKind, FlushPlan, ParamSource, PersistenceContext};
use tidemark_context::entry::EntryStatus;
use tidemark_driver::{Connection, Statement};
use tidemark_types::{EntityMeta, Ident, KeyRef, MetadataRegistry, Value, entity};
use tracing::debug;

use crate::error::SessionError;
use crate::idgen;

/// Executes one flush plan against one connection.
pub struct ActionExecutor<'a> {
    registry: &'a MetadataRegistry,
    context: &'a mut PersistenceContext,
    /// Keys produced for pending identities during this flush, by serial.
    resolved: BTreeMap<u64, Value>,
}

impl<'a> ActionExecutor<'a> {
    /// Create an executor over the registry and the flushing context.
    pub const fn new(
        registry: &'a MetadataRegistry,
        context: &'a mut PersistenceContext,
    ) -> Self {
        Self {
            registry,
            context,
            resolved: BTreeMap::new(),
        }
    }

    /// Execute the plan to completion, or stop at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stale`] on a failed version check,
    /// [`SessionError::Driver`] on driver failures, and
    /// [`SessionError::Internal`] if the plan references keys that were
    /// never produced.
    pub async fn execute(
        &mut self,
        conn: &mut dyn Connection,
        plan: FlushPlan,
    ) -> Result<(), SessionError> {
        let total = plan.len();
        let mut iter = plan.actions.into_iter().peekable();

        while let Some(action) = iter.next() {
            match action.kind {
                ActionKind::GenerateKey => self.run_generate_key(conn, &action).await?,
                ActionKind::Insert => {
                    let shape = action.shape();
                    let mut run_idents = vec![action.ident.clone()];
                    let mut run = vec![action];
                    while let Some(next) = iter.peek() {
                        let independent =
                            !next.depends_on.iter().any(|d| run_idents.contains(d));
                        if next.kind == ActionKind::Insert
                            && next.shape() == shape
                            && independent
                        {
                            run_idents.push(next.ident.clone());
                            if let Some(next) = iter.next() {
                                run.push(next);
                            }
                        } else {
                            break;
                        }
                    }
                    self.run_inserts(conn, run).await?;
                }
                ActionKind::Update => self.run_update(conn, &action).await?,
                ActionKind::Delete => self.run_delete(conn, &action).await?,
            }
        }

        self.refresh_children_snapshots();
        debug!(actions = total, "flush plan executed");
        Ok(())
    }

    fn meta_for(&self, ident: &Ident) -> Result<std::sync::Arc<EntityMeta>, SessionError> {
        self.registry.get(ident.entity()).ok_or(SessionError::Internal(
            "planned action for unmapped entity",
        ))
    }

    /// Resolve a parameter into a concrete value.
    fn resolve_param(&self, param: &ParamSource) -> Result<Value, SessionError> {
        match param {
            ParamSource::Value(value) => Ok(value.clone()),
            ParamSource::KeyOf(ident) => self.resolve_key(ident),
        }
    }

    /// Resolve an identity's key, consulting keys generated this flush.
    fn resolve_key(&self, ident: &Ident) -> Result<Value, SessionError> {
        match ident.key() {
            KeyRef::Assigned(value) => Ok(value.clone()),
            KeyRef::Pending(serial) => self
                .resolved
                .get(serial)
                .cloned()
                .ok_or(SessionError::Internal("pending key was never produced")),
        }
    }

    /// Materialize an action's identity and column payload.
    fn materialize(
        &self,
        action: &Action,
    ) -> Result<(Ident, Vec<(String, Value)>), SessionError> {
        let key = self.resolve_key(&action.ident)?;
        let ident = action.ident.with_assigned_key(key);
        let columns = action
            .columns
            .iter()
            .map(|(column, param)| Ok((column.clone(), self.resolve_param(param)?)))
            .collect::<Result<Vec<_>, SessionError>>()?;
        Ok((ident, columns))
    }

    async fn run_generate_key(
        &mut self,
        conn: &mut dyn Connection,
        action: &Action,
    ) -> Result<(), SessionError> {
        let meta = self.meta_for(&action.ident)?;
        let key = idgen::generate(&meta.id_strategy, conn).await?;

        if let KeyRef::Pending(serial) = action.ident.key() {
            self.resolved.insert(*serial, key.clone());
        }
        if let Some(new_ident) = self.context.rekey(&action.ident, key.clone()) {
            if let Some(handle) = self.context.lookup(&new_ident).and_then(|e| e.live()) {
                entity::write(&handle).set_key(key);
            }
        }
        Ok(())
    }

    async fn run_inserts(
        &mut self,
        conn: &mut dyn Connection,
        run: Vec<Action>,
    ) -> Result<(), SessionError> {
        let mut prepared: Vec<(Ident, Vec<(String, Value)>)> = Vec::with_capacity(run.len());
        let mut statements: Vec<Statement> = Vec::with_capacity(run.len());

        for action in &run {
            let meta = self.meta_for(&action.ident)?;
            let (ident, columns) = self.materialize(action)?;
            statements.push(Statement::Insert {
                table: meta.table.clone(),
                columns: columns.iter().map(|(c, _)| c.clone()).collect(),
                values: columns.iter().map(|(_, v)| v.clone()).collect(),
            });
            prepared.push((ident, columns));
        }

        if statements.len() == 1 {
            if let Some(statement) = statements.pop() {
                conn.execute_one(statement).await?;
            }
        } else {
            debug!(rows = statements.len(), "batched insert run");
            conn.execute_batch(statements).await?;
        }

        for (ident, columns) in prepared {
            let meta = self.meta_for(&ident)?;
            if let Some(entry) = self.context.lookup_mut(&ident) {
                entry.set_status(EntryStatus::Managed);
                entry.merge_snapshot(columns);
                if meta.versioned() {
                    entry.set_version(0);
                }
            }
        }
        Ok(())
    }

    async fn run_update(
        &mut self,
        conn: &mut dyn Connection,
        action: &Action,
    ) -> Result<(), SessionError> {
        let meta = self.meta_for(&action.ident)?;
        let (ident, mut assignments) = self.materialize(action)?;

        let mut next_version = None;
        if action.bump_version {
            let column = meta
                .version_column
                .clone()
                .ok_or(SessionError::Internal("version bump on unversioned entity"))?;
            let current = action
                .expected_version
                .ok_or(SessionError::Internal("version bump without expected version"))?;
            let next = current
                .checked_add(1)
                .ok_or(SessionError::Internal("version counter overflow"))?;
            assignments.push((column, Value::Int(next)));
            next_version = Some(next);
        }
        if assignments.is_empty() {
            return Ok(());
        }

        let key = ident
            .key_value()
            .cloned()
            .ok_or(SessionError::Internal("update without a key"))?;
        let mut predicate = vec![(meta.key_column.clone(), key)];
        if let (Some(expected), Some(column)) =
            (action.expected_version, meta.version_column.as_ref())
        {
            predicate.push((column.clone(), Value::Int(expected)));
        }

        let outcome = conn
            .execute_one(Statement::Update {
                table: meta.table.clone(),
                assignments: assignments.clone(),
                predicate,
            })
            .await?;
        if outcome.rows_affected == 0 {
            return Err(SessionError::Stale { ident });
        }

        if let Some(entry) = self.context.lookup_mut(&ident) {
            entry.merge_snapshot(assignments);
            if let Some(version) = next_version {
                entry.set_version(version);
            }
            entry.clear_dirty();
            entry.clear_version_bump();
        }
        Ok(())
    }

    async fn run_delete(
        &mut self,
        conn: &mut dyn Connection,
        action: &Action,
    ) -> Result<(), SessionError> {
        let meta = self.meta_for(&action.ident)?;
        let (ident, _) = self.materialize(action)?;
        let key = ident
            .key_value()
            .cloned()
            .ok_or(SessionError::Internal("delete without a key"))?;

        let mut predicate = vec![(meta.key_column.clone(), key)];
        if let (Some(expected), Some(column)) =
            (action.expected_version, meta.version_column.as_ref())
        {
            predicate.push((column.clone(), Value::Int(expected)));
        }

        let outcome = conn
            .execute_one(Statement::Delete {
                table: meta.table.clone(),
                predicate,
            })
            .await?;
        if outcome.rows_affected == 0 {
            return Err(SessionError::Stale { ident });
        }

        // The delete is durable; complete the detach.
        self.context.forget(&ident);
        Ok(())
    }

    /// Re-baseline owned-collection snapshots and clear one-shot flags on
    /// the entries that survived the flush.
    fn refresh_children_snapshots(&mut self) {
        let snapshots: Vec<(Ident, BTreeMap<String, Vec<Ident>>)> = self
            .context
            .iter()
            .filter(|entry| entry.status() == EntryStatus::Managed)
            .filter_map(|entry| {
                let handle = entry.live()?;
                let meta = self.registry.get(entry.ident().entity())?;
                Some((
                    entry.ident().clone(),
                    self.context.owned_membership(&handle, &meta),
                ))
            })
            .collect();

        for (ident, membership) in snapshots {
            if let Some(entry) = self.context.lookup_mut(&ident) {
                entry.set_children(membership);
                entry.clear_dirty();
                entry.clear_version_bump();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    use tidemark_context::{EntityEntry, FlushPlanner};
    use tidemark_driver::{Driver, MemoryDriver};
    use tidemark_types::{Entity, EntityHandle, IdStrategy, MetadataRegistry};

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityMeta::define("Book", "books")
                    .key("id", IdStrategy::Assigned)
                    .field("title")
                    .versioned("version"),
            )
            .build()
            .unwrap()
    }

    fn register_new(context: &mut PersistenceContext, handle: &EntityHandle) {
        let guard = entity::read(handle);
        let ident = Ident::assigned(guard.name().clone(), guard.key().cloned().unwrap());
        drop(guard);
        context
            .register(EntityEntry::new(ident, handle, EntryStatus::New))
            .unwrap();
    }

    #[tokio::test]
    async fn insert_marks_entry_managed_with_version_zero() {
        let registry = registry();
        let driver = MemoryDriver::new();
        let mut conn = driver.acquire().await.unwrap();
        let mut context = PersistenceContext::new();

        let book = Entity::new("Book")
            .with_key(Value::Int(1))
            .with_field("title", "Dune")
            .into_handle();
        register_new(&mut context, &book);

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        ActionExecutor::new(&registry, &mut context)
            .execute(conn.as_mut(), plan)
            .await
            .unwrap();

        let ident = Ident::assigned("Book", Value::Int(1));
        let entry = context.lookup(&ident).unwrap();
        assert_eq!(entry.status(), EntryStatus::Managed);
        assert_eq!(entry.version(), Some(0));
        assert_eq!(driver.rows("books").len(), 1);
    }

    #[tokio::test]
    async fn stale_update_stops_the_flush() {
        let registry = registry();
        let driver = MemoryDriver::new();
        // The stored row is already at version 5; the session believes 1.
        driver.seed_row(
            "books",
            [
                ("id".to_owned(), Value::Int(1)),
                ("title".to_owned(), Value::from("Dune")),
                ("version".to_owned(), Value::Int(5)),
            ],
        );
        let mut conn = driver.acquire().await.unwrap();
        let mut context = PersistenceContext::new();

        let book = Entity::new("Book")
            .with_key(Value::Int(1))
            .with_field("title", "Dune Messiah")
            .into_handle();
        let ident = Ident::assigned("Book", Value::Int(1));
        let mut entry = EntityEntry::new(ident.clone(), &book, EntryStatus::Managed);
        entry.set_snapshot(
            [
                ("id".to_owned(), Value::Int(1)),
                ("title".to_owned(), Value::from("Dune")),
            ]
            .into(),
        );
        entry.set_version(1);
        context.register(entry).unwrap();

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        let result = ActionExecutor::new(&registry, &mut context)
            .execute(conn.as_mut(), plan)
            .await;
        assert!(matches!(result, Err(SessionError::Stale { .. })));

        // The stored row is untouched.
        let rows = driver.rows("books");
        assert_eq!(rows[0].get("title"), Some(&Value::from("Dune")));
    }

    #[tokio::test]
    async fn generated_keys_substitute_into_inserts() {
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
        let driver = MemoryDriver::new();
        let mut conn = driver.acquire().await.unwrap();
        let mut context = PersistenceContext::new();

        let order = Entity::new("Order").with_field("total", 5i64).into_handle();
        let pending = Ident::pending("Order", context.allocate_pending());
        context
            .register(EntityEntry::new(pending, &order, EntryStatus::New))
            .unwrap();

        let plan = FlushPlanner::new(&registry).plan(&mut context).unwrap();
        ActionExecutor::new(&registry, &mut context)
            .execute(conn.as_mut(), plan)
            .await
            .unwrap();

        // The live entity learned its key and the row carries it.
        assert_eq!(entity::read(&order).key(), Some(&Value::Int(1)));
        let rows = driver.rows("orders");
        assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));
    }
}
