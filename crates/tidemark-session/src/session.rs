//! The session: one unit of work against the database.
//!
//! A [`Session`] exclusively owns one persistence context and borrows (at
//! most) one pooled connection, lazily, on first need. All intents --
//! persist, remove, merge, refresh, lock, find -- mutate the context;
//! [`Session::flush`] turns the accumulated state into an ordered plan and
//! executes it. Operations are sequential by construction: every entry
//! point takes `&mut self`, so a session can never run two actions
//! concurrently against its context.
//!
//! The methods here are the single implementation both calling
//! conventions share; the adapters in [`crate::bridge`] only change the
//! *shape* of the asynchrony (future-of-one vs stream), never the logic.
//!
//! # Cancellation
//!
//! If a caller drops the flush future mid-execution, the session is left
//! in the `flushing` phase; the next operation detects that, moves the
//! session to `failed`, and refuses -- a partially executed plan cannot
//! be assumed consistent.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use tracing::debug;

use tidemark_context::{
    ContextError, EntityEntry, EntryStatus, FlushPlanner, PersistenceContext, cascade,
};
use tidemark_driver::{Connection, Driver, RowLock, Statement};
use tidemark_types::{
    CascadeOp, Entity, EntityHandle, EntityMeta, EntityName, Ident, LockMode, MetadataRegistry,
    Row, Value, entity,
};

use crate::error::SessionError;
use crate::executor::ActionExecutor;
use crate::state::SessionPhase;

/// One unit of work: a persistence context plus its execution machinery.
pub struct Session {
    registry: Arc<MetadataRegistry>,
    driver: Arc<dyn Driver>,
    connection: Option<Box<dyn Connection>>,
    context: PersistenceContext,
    phase: SessionPhase,
    in_transaction: bool,
}

impl Session {
    /// Open a session. The session is active immediately; there is no
    /// separate begin step for non-transactional use.
    pub fn new(registry: Arc<MetadataRegistry>, driver: Arc<dyn Driver>) -> Self {
        Self {
            registry,
            driver,
            connection: None,
            context: PersistenceContext::new(),
            phase: SessionPhase::Active,
            in_transaction: false,
        }
    }

    /// The session's current lifecycle phase.
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether the session still accepts operations.
    pub const fn is_open(&self) -> bool {
        self.phase.accepts_work()
    }

    /// Whether a transaction is open on this session.
    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// The metadata registry this session maps against.
    pub const fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    fn ensure_open(&mut self, operation: &'static str) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Active => Ok(()),
            SessionPhase::Closed => Err(SessionError::Closed),
            SessionPhase::Flushing => {
                // Only an abandoned (cancelled) flush can leave the phase
                // here between operations.
                self.phase = SessionPhase::Failed;
                Err(SessionError::InvalidState {
                    phase: SessionPhase::Flushing,
                    operation,
                })
            }
            phase @ (SessionPhase::FlushFailed | SessionPhase::Failed) => {
                Err(SessionError::InvalidState { phase, operation })
            }
        }
    }

    async fn ensure_connection(&mut self) -> Result<(), SessionError> {
        if self.connection.is_none() {
            let conn = self.driver.acquire().await?;
            self.connection = Some(conn);
        }
        Ok(())
    }

    async fn connection(&mut self) -> Result<&mut Box<dyn Connection>, SessionError> {
        self.ensure_connection().await?;
        self.connection
            .as_mut()
            .ok_or(SessionError::Internal("connection disappeared"))
    }

    fn meta(&self, name: &EntityName) -> Result<Arc<EntityMeta>, SessionError> {
        self.registry
            .get(name)
            .ok_or_else(|| ContextError::NoMetadata(name.clone()).into())
    }

    // -----------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------

    /// Schedule the entity (and its persist-cascade closure) for
    /// insertion.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Context`] wrapping an identity conflict if
    /// another live instance already claims the same identity.
    pub fn persist(&mut self, handle: &EntityHandle) -> Result<(), SessionError> {
        self.ensure_open("persist")?;
        let items = cascade::resolve(handle, CascadeOp::Persist, &self.registry)?;
        for item in items {
            self.register_new(&item.handle)?;
        }
        Ok(())
    }

    fn register_new(&mut self, handle: &EntityHandle) -> Result<(), SessionError> {
        if let Some(ident) = self.context.ident_of(handle) {
            // Persisting a removal cancels it.
            if self.context.lookup(&ident).map(EntityEntry::status)
                == Some(EntryStatus::Removed)
            {
                if let Some(entry) = self.context.lookup_mut(&ident) {
                    let revived = if entry.snapshot().is_some() {
                        EntryStatus::Managed
                    } else {
                        EntryStatus::New
                    };
                    entry.set_status(revived);
                }
            }
            return Ok(());
        }

        let guard = entity::read(handle);
        let name = guard.name().clone();
        let ident = match guard.key() {
            Some(key) => Ident::assigned(name, key.clone()),
            None => Ident::pending(name, self.context.allocate_pending()),
        };
        drop(guard);

        debug!(%ident, "persist");
        self.context
            .register(EntityEntry::new(ident, handle, EntryStatus::New))?;
        Ok(())
    }

    /// Schedule the entity (and its remove-cascade closure) for deletion.
    ///
    /// A new entity that was never flushed is simply forgotten -- its
    /// insert is cancelled and nothing reaches the database.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotManaged`] if this session does not
    /// manage the instance.
    pub fn remove(&mut self, handle: &EntityHandle) -> Result<(), SessionError> {
        self.ensure_open("remove")?;
        if self.context.ident_of(handle).is_none() {
            return Err(SessionError::NotManaged {
                entity: entity::read(handle).name().clone(),
            });
        }
        self.remove_graph(handle)
    }

    fn remove_graph(&mut self, handle: &EntityHandle) -> Result<(), SessionError> {
        let items = cascade::resolve(handle, CascadeOp::Remove, &self.registry)?;
        for item in items {
            let Some(ident) = self.context.ident_of(&item.handle) else {
                continue;
            };
            let status = self.context.lookup(&ident).map(EntityEntry::status);
            if status == Some(EntryStatus::New) {
                debug!(%ident, "remove cancels pending insert");
                self.context.forget(&ident);
            } else {
                debug!(%ident, "remove");
                self.context.mark_removed(&ident);
            }
        }
        Ok(())
    }

    /// Stop tracking the instance. Pending changes to it are lost; the
    /// database is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] on a closed session.
    pub fn detach(&mut self, handle: &EntityHandle) -> Result<(), SessionError> {
        self.ensure_open("detach")?;
        if let Some(ident) = self.context.ident_of(handle) {
            self.context.forget(&ident);
        }
        Ok(())
    }

    /// Mark a managed instance read-only: it is tracked for repeatable
    /// reads but never written by a flush.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotManaged`] if the instance is untracked.
    pub fn set_read_only(&mut self, handle: &EntityHandle) -> Result<(), SessionError> {
        self.ensure_open("mark read-only")?;
        let Some(ident) = self.context.ident_of(handle) else {
            return Err(SessionError::NotManaged {
                entity: entity::read(handle).name().clone(),
            });
        };
        if let Some(entry) = self.context.lookup_mut(&ident) {
            entry.set_status(EntryStatus::ReadOnly);
        }
        Ok(())
    }

    /// Whether this session manages the instance (and it is not scheduled
    /// for removal).
    pub fn contains(&self, handle: &EntityHandle) -> bool {
        self.context
            .ident_of(handle)
            .and_then(|ident| self.context.lookup(&ident).map(EntityEntry::status))
            .is_some_and(|status| status != EntryStatus::Removed)
    }

    /// Drop every tracked entry without touching the database.
    pub fn clear(&mut self) {
        self.context.clear();
    }

    /// The number of tracked entries (diagnostics).
    pub fn tracked(&self) -> usize {
        self.context.len()
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Look up an entity by identity.
    ///
    /// Returns the already-managed instance when the context holds one
    /// (repeatable read); otherwise loads the row, registers it, and
    /// returns a fresh managed instance. An absent row is `Ok(None)`,
    /// never an error. An instance scheduled for removal reads as absent.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Driver`] on driver failures.
    pub async fn find(
        &mut self,
        name: impl Into<EntityName>,
        key: Value,
    ) -> Result<Option<EntityHandle>, SessionError> {
        self.ensure_open("find")?;
        let name = name.into();
        let meta = self.meta(&name)?;
        let ident = Ident::assigned(name, key);

        if let Some(entry) = self.context.lookup(&ident) {
            if entry.status() == EntryStatus::Removed {
                return Ok(None);
            }
            if let Some(live) = entry.live() {
                return Ok(Some(live));
            }
            // The caller dropped the instance; reload a fresh one.
            self.context.forget(&ident);
        }

        self.load(&meta, ident).await
    }

    async fn load(
        &mut self,
        meta: &EntityMeta,
        ident: Ident,
    ) -> Result<Option<EntityHandle>, SessionError> {
        let statement = select_statement(meta, &ident, None)?;
        let Some(row) = self.fetch_optional(statement).await? else {
            return Ok(None);
        };

        let handle = materialize_entity(meta, &ident, &row);
        let mut entry = EntityEntry::new(ident.clone(), &handle, EntryStatus::Managed);
        if meta.versioned() {
            entry.set_version(row_version(meta, &row));
        }
        entry.set_snapshot(row.into_inner());
        self.context.register(entry)?;
        debug!(%ident, "loaded");
        Ok(Some(handle))
    }

    async fn fetch_optional(
        &mut self,
        statement: Statement,
    ) -> Result<Option<Row>, SessionError> {
        let conn = self.connection().await?;
        let mut stream = conn.execute_query(statement);
        let first = stream.next().await.transpose()?;
        Ok(first)
    }

    /// Re-read the entity's current database state into the live object,
    /// discarding in-memory changes. Cascades along refresh associations.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the row no longer exists and
    /// [`SessionError::NotManaged`] if the root instance is untracked.
    pub async fn refresh(&mut self, handle: &EntityHandle) -> Result<(), SessionError> {
        self.ensure_open("refresh")?;
        if self.context.ident_of(handle).is_none() {
            return Err(SessionError::NotManaged {
                entity: entity::read(handle).name().clone(),
            });
        }
        let items = cascade::resolve(handle, CascadeOp::Refresh, &self.registry)?;
        for item in items {
            let Some(ident) = self.context.ident_of(&item.handle) else {
                continue;
            };
            if ident.key_value().is_none() {
                continue;
            }
            self.refresh_one(&item.handle, ident).await?;
        }
        Ok(())
    }

    async fn refresh_one(
        &mut self,
        handle: &EntityHandle,
        ident: Ident,
    ) -> Result<(), SessionError> {
        let meta = self.meta(ident.entity())?;
        let statement = select_statement(&meta, &ident, None)?;
        let Some(row) = self.fetch_optional(statement).await? else {
            return Err(SessionError::NotFound { ident });
        };

        {
            let mut guard = entity::write(handle);
            for field in &meta.fields {
                let value = row.get(&field.column).cloned().unwrap_or(Value::Null);
                guard.set_field(field.name.clone(), value);
            }
            // Reset touched to-one slots so the stored foreign keys are
            // authoritative again.
            for assoc in &meta.associations {
                guard.unset_assoc(&assoc.name);
            }
        }

        if let Some(entry) = self.context.lookup_mut(&ident) {
            if meta.versioned() {
                entry.set_version(row_version(&meta, &row));
            }
            entry.set_snapshot(row.into_inner());
            entry.clear_dirty();
            entry.clear_version_bump();
        }
        debug!(%ident, "refreshed");
        Ok(())
    }

    /// Merge a detached entity's state into the unit of work and return
    /// the managed copy. Cascades along merge associations; the detached
    /// input is never itself registered.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Driver`] on load failures during merging.
    pub async fn merge(&mut self, detached: &Entity) -> Result<EntityHandle, SessionError> {
        self.ensure_open("merge")?;
        let mut visited: BTreeMap<usize, EntityHandle> = BTreeMap::new();
        let target = self.locate_merge_target(detached).await?;
        self.merge_into(detached, &target, &mut visited).await?;
        Ok(target)
    }

    /// Find or create the managed instance a detached entity merges into.
    async fn locate_merge_target(
        &mut self,
        detached: &Entity,
    ) -> Result<EntityHandle, SessionError> {
        let meta = self.meta(detached.name())?;
        match detached.key() {
            Some(key) => {
                let ident = Ident::assigned(detached.name().clone(), key.clone());
                if let Some(live) = self.context.lookup(&ident).and_then(EntityEntry::live) {
                    return Ok(live);
                }
                if let Some(loaded) = self.load(&meta, ident.clone()).await? {
                    return Ok(loaded);
                }
                // No such row: manage a new copy under the detached key.
                let handle = Entity::new(detached.name().clone())
                    .with_key(key.clone())
                    .into_handle();
                self.context
                    .register(EntityEntry::new(ident, &handle, EntryStatus::New))?;
                Ok(handle)
            }
            None => {
                let handle = Entity::new(detached.name().clone()).into_handle();
                let ident =
                    Ident::pending(detached.name().clone(), self.context.allocate_pending());
                self.context
                    .register(EntityEntry::new(ident, &handle, EntryStatus::New))?;
                Ok(handle)
            }
        }
    }

    /// Copy a detached entity's state into its managed target, cascading
    /// along merge associations.
    fn merge_into<'s>(
        &'s mut self,
        detached: &'s Entity,
        target: &'s EntityHandle,
        visited: &'s mut BTreeMap<usize, EntityHandle>,
    ) -> BoxFuture<'s, Result<(), SessionError>> {
        async move {
            let meta = self.meta(detached.name())?;

            {
                let mut guard = entity::write(target);
                for (name, value) in detached.fields() {
                    guard.set_field(name.clone(), value.clone());
                }
            }

            for assoc in &meta.associations {
                if !assoc.cascade.contains(CascadeOp::Merge) {
                    continue;
                }
                match detached.association(&assoc.name) {
                    tidemark_types::AssocValue::One(child) => {
                        let merged = self.merge_child(child, visited).await?;
                        entity::write(target).set_assoc(assoc.name.clone(), &merged);
                    }
                    tidemark_types::AssocValue::Many(children) => {
                        let originals: Vec<EntityHandle> = children.clone();
                        let mut merged = Vec::with_capacity(originals.len());
                        for child in &originals {
                            merged.push(self.merge_child(child, visited).await?);
                        }
                        entity::write(target).set_children(assoc.name.clone(), merged);
                    }
                    tidemark_types::AssocValue::Cleared => {
                        entity::write(target).clear_assoc(&assoc.name);
                    }
                    tidemark_types::AssocValue::Unset => {}
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn merge_child(
        &mut self,
        child: &EntityHandle,
        visited: &mut BTreeMap<usize, EntityHandle>,
    ) -> Result<EntityHandle, SessionError> {
        let marker = Arc::as_ptr(child) as usize;
        if let Some(existing) = visited.get(&marker) {
            return Ok(Arc::clone(existing));
        }

        // Copy the detached state out so no lock is held across awaits.
        let snapshot = entity::read(child).clone();
        let target = self.locate_merge_target(&snapshot).await?;
        // Mark before descending: cycles in the detached graph terminate
        // against the visited map.
        visited.insert(marker, Arc::clone(&target));
        self.merge_into(&snapshot, &target, visited).await?;
        Ok(target)
    }

    /// Lock a managed instance.
    ///
    /// Pessimistic modes take the row lock immediately and require an
    /// open transaction; force-increment schedules a version bump for the
    /// next flush.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotVersioned`] for force-increment on an
    /// unversioned type, [`SessionError::NotFound`] if the row is gone.
    pub async fn lock(
        &mut self,
        handle: &EntityHandle,
        mode: LockMode,
    ) -> Result<(), SessionError> {
        self.ensure_open("lock")?;
        let Some(ident) = self.context.ident_of(handle) else {
            return Err(SessionError::NotManaged {
                entity: entity::read(handle).name().clone(),
            });
        };
        let Some(key) = ident.key_value().cloned() else {
            return Err(SessionError::NotManaged {
                entity: ident.entity().clone(),
            });
        };
        let meta = self.meta(ident.entity())?;

        match mode {
            LockMode::ForceIncrement => {
                if !meta.versioned() {
                    return Err(SessionError::NotVersioned { ident });
                }
                if let Some(entry) = self.context.lookup_mut(&ident) {
                    entry.force_version_bump();
                }
                Ok(())
            }
            LockMode::PessimisticRead | LockMode::PessimisticWrite => {
                if !self.in_transaction {
                    return Err(SessionError::InvalidState {
                        phase: self.phase,
                        operation: "acquire a row lock outside a transaction",
                    });
                }
                let lock = if mode == LockMode::PessimisticWrite {
                    RowLock::Exclusive
                } else {
                    RowLock::Shared
                };
                let statement = Statement::Select {
                    table: meta.table.clone(),
                    columns: vec![meta.key_column.clone()],
                    predicate: vec![(meta.key_column.clone(), key)],
                    lock: Some(lock),
                };
                match self.fetch_optional(statement).await? {
                    Some(_) => Ok(()),
                    None => Err(SessionError::NotFound { ident }),
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    /// Run a caller-supplied query and collect all rows.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Driver`] on driver failures.
    pub async fn query_rows(
        &mut self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Row>, SessionError> {
        self.ensure_open("query")?;
        let statement = Statement::Raw {
            sql: sql.to_owned(),
            params,
        };
        let conn = self.connection().await?;
        let rows = conn
            .execute_query(statement)
            .map_err(SessionError::from)
            .try_collect()
            .await?;
        Ok(rows)
    }

    /// Run a caller-supplied query as a lazy row stream.
    ///
    /// Rows are decoded as the stream is polled; consumption downstream
    /// paces the driver.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Driver`] if a connection cannot be
    /// acquired; row-level failures surface through the stream.
    pub async fn query_stream(
        &mut self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<futures::stream::BoxStream<'_, Result<Row, SessionError>>, SessionError> {
        self.ensure_open("query")?;
        let statement = Statement::Raw {
            sql: sql.to_owned(),
            params,
        };
        let conn = self.connection().await?;
        Ok(conn
            .execute_query(statement)
            .map_err(SessionError::from)
            .boxed())
    }

    // -----------------------------------------------------------------
    // Flush & transactions
    // -----------------------------------------------------------------

    /// Synchronize the context with the database: detect orphans, plan,
    /// and execute.
    ///
    /// Planning-time failures abort with no statement sent. Execution
    /// failures stop the plan immediately and leave the session in the
    /// flush-failed phase; the transaction must be rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stale`] on lost optimistic races,
    /// [`SessionError::Context`] on planning failures, and
    /// [`SessionError::Driver`] on execution failures.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        self.ensure_open("flush")?;
        self.phase = SessionPhase::Flushing;
        self.context.begin_flush();
        let result = self.flush_inner().await;
        self.context.end_flush();
        self.phase = match &result {
            Ok(()) => SessionPhase::Active,
            // Planning failures are detected before any statement is
            // sent; the unit of work is still consistent.
            Err(SessionError::Context(_)) => SessionPhase::Active,
            Err(_) => SessionPhase::FlushFailed,
        };
        result
    }

    async fn flush_inner(&mut self) -> Result<(), SessionError> {
        // Orphan removal first: children dropped from exclusively-owning
        // collections are removed (with their own cascade closure) even
        // though nobody called remove on them.
        let orphans = cascade::find_orphans(&self.context, &self.registry)?;
        for ident in orphans {
            match self.context.lookup(&ident).and_then(EntityEntry::live) {
                Some(handle) => self.remove_graph(&handle)?,
                None => self.context.mark_removed(&ident),
            }
        }

        let plan = FlushPlanner::new(&self.registry).plan(&mut self.context)?;
        if plan.is_empty() {
            return Ok(());
        }

        self.ensure_connection().await?;
        let Self {
            registry,
            context,
            connection,
            ..
        } = self;
        let conn = connection
            .as_mut()
            .ok_or(SessionError::Internal("connection disappeared"))?;

        ActionExecutor::new(registry, context)
            .execute(conn.as_mut(), plan)
            .await
    }

    /// Open a transaction on the session's connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] if a transaction is already
    /// open.
    pub async fn begin_transaction(&mut self) -> Result<(), SessionError> {
        self.ensure_open("begin a transaction")?;
        if self.in_transaction {
            return Err(SessionError::InvalidState {
                phase: self.phase,
                operation: "begin a nested transaction",
            });
        }
        self.connection()
            .await?
            .execute_one(Statement::Begin)
            .await?;
        self.in_transaction = true;
        debug!("transaction begun");
        Ok(())
    }

    /// Flush, then commit the open transaction. Any failure rolls the
    /// transaction back and fails the session.
    ///
    /// # Errors
    ///
    /// Returns the flush or commit failure after rolling back.
    pub async fn commit(&mut self) -> Result<(), SessionError> {
        if !self.in_transaction {
            return Err(SessionError::InvalidState {
                phase: self.phase,
                operation: "commit outside a transaction",
            });
        }
        if let Err(err) = self.flush().await {
            self.abort_transaction().await;
            return Err(err);
        }
        let committed = self
            .connection()
            .await?
            .execute_one(Statement::Commit)
            .await;
        match committed {
            Ok(_) => {
                self.in_transaction = false;
                debug!("transaction committed");
                Ok(())
            }
            Err(err) => {
                self.abort_transaction().await;
                Err(err.into())
            }
        }
    }

    /// Roll back the open transaction and discard tracked state.
    ///
    /// After a failed flush this is the only way forward, and the session
    /// ends up `failed` (terminal). An explicit rollback of a healthy
    /// transaction leaves the session usable with an empty context.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] if no transaction is open.
    pub async fn rollback(&mut self) -> Result<(), SessionError> {
        if self.phase == SessionPhase::Closed {
            return Err(SessionError::Closed);
        }
        if !self.in_transaction {
            return Err(SessionError::InvalidState {
                phase: self.phase,
                operation: "roll back outside a transaction",
            });
        }
        if let Ok(conn) = self.connection().await {
            if let Err(err) = conn.execute_one(Statement::Rollback).await {
                debug!(error = %err, "rollback statement failed");
            }
        }
        self.in_transaction = false;
        self.context.clear();
        self.phase = match self.phase {
            SessionPhase::FlushFailed | SessionPhase::Failed => SessionPhase::Failed,
            _ => SessionPhase::Active,
        };
        debug!(phase = %self.phase, "transaction rolled back");
        Ok(())
    }

    async fn abort_transaction(&mut self) {
        if self.in_transaction {
            if let Ok(conn) = self.connection().await {
                if let Err(err) = conn.execute_one(Statement::Rollback).await {
                    debug!(error = %err, "rollback during abort failed");
                }
            }
            self.in_transaction = false;
        }
        self.phase = SessionPhase::Failed;
        debug!("transaction aborted; session failed");
    }

    /// Run `work` inside a transaction: begin, run, flush, commit; roll
    /// back (and fail the session) if anything goes wrong.
    ///
    /// # Errors
    ///
    /// Returns the error from `work`, the implicit flush, or the commit.
    pub async fn with_transaction<T, F>(&mut self, work: F) -> Result<T, SessionError>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T, SessionError>>,
    {
        self.begin_transaction().await?;
        match work(&mut *self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                self.abort_transaction().await;
                Err(err)
            }
        }
    }

    /// Close the session: roll back any open transaction, discard the
    /// context, and return the connection to the pool. Terminal and
    /// idempotent; every later operation fails with
    /// [`SessionError::Closed`].
    pub async fn close(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        if self.in_transaction {
            if let Some(conn) = self.connection.as_mut() {
                if let Err(err) = conn.execute_one(Statement::Rollback).await {
                    debug!(error = %err, "rollback on close failed");
                }
            }
            self.in_transaction = false;
        }
        self.context.clear();
        self.connection = None;
        self.phase = SessionPhase::Closed;
        debug!("session closed");
    }
}

// ---------------------------------------------------------------------------
// Row materialization helpers
// ---------------------------------------------------------------------------

/// The full mapped column list of an entity type.
fn select_columns(meta: &EntityMeta) -> Vec<String> {
    let mut columns = vec![meta.key_column.clone()];
    columns.extend(meta.fields.iter().map(|f| f.column.clone()));
    for assoc in &meta.associations {
        if let tidemark_types::AssociationKind::ManyToOne { column, .. } = &assoc.kind {
            columns.push(column.clone());
        }
    }
    if let Some(version) = &meta.version_column {
        columns.push(version.clone());
    }
    columns
}

fn select_statement(
    meta: &EntityMeta,
    ident: &Ident,
    lock: Option<RowLock>,
) -> Result<Statement, SessionError> {
    let key = ident
        .key_value()
        .cloned()
        .ok_or(SessionError::Internal("select for a pending identity"))?;
    Ok(Statement::Select {
        table: meta.table.clone(),
        columns: select_columns(meta),
        predicate: vec![(meta.key_column.clone(), key)],
        lock,
    })
}

/// Build a live entity from a loaded row. Associations stay unset: their
/// stored foreign keys live in the snapshot, and on-demand fetching is
/// deliberately out of scope.
fn materialize_entity(meta: &EntityMeta, ident: &Ident, row: &Row) -> EntityHandle {
    let mut live = Entity::new(meta.name.clone());
    if let Some(key) = ident.key_value() {
        live.set_key(key.clone());
    }
    for field in &meta.fields {
        let value = row.get(&field.column).cloned().unwrap_or(Value::Null);
        live.set_field(field.name.clone(), value);
    }
    live.into_handle()
}

/// The version value stored in a loaded row; NULL reads as zero.
fn row_version(meta: &EntityMeta, row: &Row) -> i64 {
    meta.version_column
        .as_ref()
        .and_then(|column| row.get(column))
        .and_then(|value| match value {
            Value::Int(v) => Some(*v),
            _ => None,
        })
        .unwrap_or(0)
}
