//! The stream-of-values calling convention.
//!
//! Every operation returns a [`BoxStream`]. Unit operations are
//! one-element (or one-error) streams; queries are finite, non-restartable
//! row streams whose elements are produced as the driver delivers them --
//! the next row is only decoded once downstream polls for it.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use tidemark_types::{Entity, EntityHandle, EntityName, LockMode, Row, Value};

use crate::error::SessionError;
use crate::session::Session;
use crate::state::SessionPhase;

/// A session spoken to through streams.
///
/// Thin, stateless delegation over [`Session`]; constructed by
/// [`SessionFactory::open_streaming`].
///
/// [`SessionFactory::open_streaming`]: crate::factory::SessionFactory::open_streaming
pub struct StreamingSession {
    inner: Session,
}

/// Lift a future's single outcome into a one-element stream.
fn once<'a, T: Send + 'a>(
    future: BoxFuture<'a, Result<T, SessionError>>,
) -> BoxStream<'a, Result<T, SessionError>> {
    futures::stream::once(future).boxed()
}

impl StreamingSession {
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
    ) -> BoxStream<'a, Result<(), SessionError>> {
        once(futures::future::ready(self.inner.persist(handle)).boxed())
    }

    /// Schedule the entity (and its cascade closure) for deletion.
    pub fn remove<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
    ) -> BoxStream<'a, Result<(), SessionError>> {
        once(futures::future::ready(self.inner.remove(handle)).boxed())
    }

    /// Stop tracking the instance.
    pub fn detach<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
    ) -> BoxStream<'a, Result<(), SessionError>> {
        once(futures::future::ready(self.inner.detach(handle)).boxed())
    }

    /// Whether the session manages the instance.
    pub fn contains(&self, handle: &EntityHandle) -> bool {
        self.inner.contains(handle)
    }

    /// Look up an entity by identity; the stream yields one `Option`.
    pub fn find<'a>(
        &'a mut self,
        name: impl Into<EntityName>,
        key: Value,
    ) -> BoxStream<'a, Result<Option<EntityHandle>, SessionError>> {
        let name = name.into();
        once(self.inner.find(name, key).boxed())
    }

    /// Merge a detached entity; the stream yields the managed copy.
    pub fn merge<'a>(
        &'a mut self,
        detached: &'a Entity,
    ) -> BoxStream<'a, Result<EntityHandle, SessionError>> {
        once(self.inner.merge(detached).boxed())
    }

    /// Re-read the entity's database state into the live object.
    pub fn refresh<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
    ) -> BoxStream<'a, Result<(), SessionError>> {
        once(self.inner.refresh(handle).boxed())
    }

    /// Lock a managed instance.
    pub fn lock<'a>(
        &'a mut self,
        handle: &'a EntityHandle,
        mode: LockMode,
    ) -> BoxStream<'a, Result<(), SessionError>> {
        once(self.inner.lock(handle, mode).boxed())
    }

    /// Synchronize the context with the database.
    pub fn flush(&mut self) -> BoxStream<'_, Result<(), SessionError>> {
        once(self.inner.flush().boxed())
    }

    /// Run a query as a lazy row stream.
    ///
    /// Backpressure is driver-paced: the next row is requested only after
    /// the previous one is consumed downstream. A connection failure
    /// surfaces as the stream's only element.
    pub fn query<'a>(
        &'a mut self,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxStream<'a, Result<Row, SessionError>> {
        self.inner
            .query_stream(sql, params)
            .map(|ready| match ready {
                Ok(rows) => rows,
                Err(err) => futures::stream::once(async move { Err(err) }).boxed(),
            })
            .flatten_stream()
            .boxed()
    }

    /// Run `work` inside a transaction; the stream yields the outcome.
    pub fn with_transaction<'a, T, F>(
        &'a mut self,
        work: F,
    ) -> BoxStream<'a, Result<T, SessionError>>
    where
        T: Send + 'a,
        F: for<'b> FnOnce(&'b mut Session) -> BoxFuture<'b, Result<T, SessionError>>
            + Send
            + 'a,
    {
        once(self.inner.with_transaction(work).boxed())
    }

    /// Close the session.
    pub fn close(&mut self) -> BoxFuture<'_, ()> {
        self.inner.close().boxed()
    }
}
