//! The future-of-one-value calling convention.
//!
//! Every operation returns a [`BoxFuture`] resolving to exactly one
//! outcome. Multi-row queries resolve to a collected `Vec<Row>`; callers
//! who want row-by-row pacing use the streaming convention instead.

use futures::FutureExt;
use futures::future::BoxFuture;

use tidemark_types::{Entity, EntityHandle, EntityName, LockMode, Row, Value};

use crate::error::SessionError;
use crate::session::Session;
use crate::state::SessionPhase;

/// A session spoken to through single-completion futures.
///
/// Thin, stateless delegation over [`Session`]; constructed by
/// [`SessionFactory::open_deferred`].
///
/// [`SessionFactory::open_deferred`]: crate::factory::SessionFactory::open_deferred
pub struct DeferredSession {
    inner: Session,
}

impl DeferredSession {
    /// Wrap a core session.
    pub const fn new(inner: Session) -> Self {
        Self { inner }
    }

    /// Unwrap back into the core session.
    pub fn into_inner(self) -> Session {
        self.inner
    }

    /// The session's current lifecycle phase.
    pub const fn phase(&self) -> SessionPhase {
        self.inner.phase()
    }

    /// Schedule the entity (and its cascade closure) for insertion.
    pub fn persist<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        futures::future::ready(self.inner.persist(handle)).boxed()
    }

    /// Schedule the entity (and its cascade closure) for deletion.
    pub fn remove<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        futures::future::ready(self.inner.remove(handle)).boxed()
    }

    /// Stop tracking the instance.
    pub fn detach<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        futures::future::ready(self.inner.detach(handle)).boxed()
    }

    /// Whether the session manages the instance.
    pub fn contains(&self, handle: &EntityHandle) -> bool {
        self.inner.contains(handle)
    }

    /// Look up an entity by identity; absent rows resolve to `None`.
    pub fn find<'a>(
        &'a mut self,
        name: impl Into<EntityName>,
        key: Value,
    ) -> BoxFuture<'a, Result<Option<EntityHandle>, SessionError>> {
        let name = name.into();
        self.inner.find(name, key).boxed()
    }

    /// Merge a detached entity and resolve to the managed copy.
    pub fn merge<'a>(
        &'a mut self,
        detached: &'a Entity,
    ) -> BoxFuture<'a, Result<EntityHandle, SessionError>> {
        self.inner.merge(detached).boxed()
    }

    /// Re-read the entity's database state into the live object.
    pub fn refresh<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        self.inner.refresh(handle).boxed()
    }

    /// Lock a managed instance.
    pub fn lock<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
        mode: LockMode,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        self.inner.lock(handle, mode).boxed()
    }

    /// Synchronize the context with the database.
    pub fn flush(&mut self) -> BoxFuture<'_, Result<(), SessionError>> {
        self.inner.flush().boxed()
    }

    /// Run a query and resolve to all of its rows.
    pub fn query<'a>(
        &'a mut self,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Vec<Row>, SessionError>> {
        self.inner.query_rows(sql, params).boxed()
    }

    /// Run `work` inside a transaction with an implicit flush before
    /// commit.
    pub fn with_transaction<'a, T, F>(
        &'a mut self,
        work: F,
    ) -> BoxFuture<'a, Result<T, SessionError>>
    where
        T: Send + 'a,
        F: for<'b> FnOnce(&'b mut Session) -> BoxFuture<'b, Result<T, SessionError>>
            + Send
            + 'a,
    {
        self.inner.with_transaction(work).boxed()
    }

    /// Close the session.
    pub fn close(&mut self) -> BoxFuture<'_, ()> {
        self.inner.close().boxed()
    }
}
