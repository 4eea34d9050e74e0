//! The non-blocking driver boundary for the Tidemark persistence engine.
//!
//! The engine core never renders SQL or touches a socket; it hands
//! structured [`Statement`] values to a [`Driver`] and awaits the outcome.
//! Everything dialect-specific lives behind that trait:
//!
//! ```text
//! Session / Executor
//!     |
//!     +-- Driver::acquire() ------------ borrow one pooled connection
//!         |
//!         +-- Connection::execute_one    -- single statement, one outcome
//!         +-- Connection::execute_batch  -- same-shape runs, one round trip
//!         +-- Connection::execute_query  -- driver-paced row stream
//! ```
//!
//! Two implementations ship here:
//!
//! - [`postgres::PgDriver`] -- `PostgreSQL` over [`sqlx`], with a bounded
//!   fail-fast admission gate in front of the pool.
//! - [`memory::MemoryDriver`] -- an in-memory interpreter of the same
//!   statements, used by engine tests so the full execution path runs
//!   without a live database.
//!
//! # Modules
//!
//! - [`statement`] -- Structured statements and row-lock levels
//! - [`connection`] -- The `Driver`/`Connection` traits and outcomes
//! - [`postgres`] -- `PostgreSQL` pool, SQL rendering, value codecs
//! - [`memory`] -- In-memory driver for tests
//! - [`error`] -- Shared error types

pub mod connection;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod statement;

// Re-export primary types for convenience.
pub use connection::{Connection, Driver, ExecOutcome, RowStream};
pub use error::DriverError;
pub use memory::MemoryDriver;
pub use postgres::{PgDriver, PostgresConfig};
pub use statement::{RowLock, Statement};
