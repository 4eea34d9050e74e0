//! The `Driver` and `Connection` traits: the engine's only view of a
//! database.
//!
//! Both traits are object-safe -- every method returns a boxed future or
//! stream -- because sessions hold `Box<dyn Connection>` and factories
//! hold `Arc<dyn Driver>`: the engine is compiled once, independent of
//! which driver backs it.
//!
//! All methods are non-blocking; a caller task suspends at these
//! boundaries and its thread is returned to the runtime.

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use tidemark_types::{Row, Value};

use crate::error::DriverError;
use crate::statement::Statement;

/// The outcome of one non-query statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    /// Number of rows the statement affected.
    pub rows_affected: u64,
    /// A generated value, for key-producing statements.
    pub generated_key: Option<Value>,
}

impl ExecOutcome {
    /// An outcome affecting `n` rows with no generated key.
    pub const fn rows(n: u64) -> Self {
        Self {
            rows_affected: n,
            generated_key: None,
        }
    }

    /// An outcome carrying a generated key.
    pub const fn key(value: Value) -> Self {
        Self {
            rows_affected: 1,
            generated_key: Some(value),
        }
    }
}

/// A finite, driver-paced stream of decoded rows.
///
/// The next row is only decoded when the stream is polled, so downstream
/// consumption paces the driver (backpressure without buffering).
pub type RowStream<'a> = BoxStream<'a, Result<Row, DriverError>>;

/// One borrowed database connection.
///
/// A session acquires at most one connection and runs its statements
/// sequentially on it; the trait therefore takes `&mut self` and needs no
/// internal synchronization.
pub trait Connection: Send {
    /// Execute one statement and return its single outcome.
    fn execute_one(
        &mut self,
        statement: Statement,
    ) -> BoxFuture<'_, Result<ExecOutcome, DriverError>>;

    /// Execute a run of statements as one round trip, returning one
    /// outcome per statement.
    ///
    /// Implementations may coalesce structurally identical statements
    /// (same kind, table, and column set) into a single multi-row
    /// statement, preserving the input order as the row order.
    fn execute_batch(
        &mut self,
        statements: Vec<Statement>,
    ) -> BoxFuture<'_, Result<Vec<ExecOutcome>, DriverError>>;

    /// Execute a query statement and stream its result rows.
    fn execute_query(&mut self, statement: Statement) -> RowStream<'_>;
}

/// A connection source shared by every session of a factory.
pub trait Driver: Send + Sync {
    /// Borrow a connection.
    ///
    /// Implementations bound concurrent acquisition and fail fast with
    /// [`DriverError::PoolExhausted`] once the bound and its wait queue
    /// are exceeded.
    fn acquire(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, DriverError>>;

    /// Tear the driver down, closing any pooled connections.
    fn close(&self) -> BoxFuture<'_, ()>;
}
