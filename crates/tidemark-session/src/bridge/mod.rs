//! The dual-API bridge: two calling conventions over one session core.
//!
//! Every operation on [`Session`] is the single implementation; the
//! adapters here only reshape how its outcome is delivered:
//!
//! - [`DeferredSession`] wraps each operation into a boxed future that
//!   resolves exactly once.
//! - [`StreamingSession`] wraps each operation into a stream -- unit
//!   operations become one-element (or one-error) streams, and queries
//!   become finite lazy row streams paced by the driver.
//!
//! Neither adapter holds state of its own or branches on which adapter is
//! active; both are plain delegation. Anything fixed here would have to
//! be fixed in [`Session`] instead.
//!
//! [`Session`]: crate::session::Session

mod deferred;
mod streaming;

pub use deferred::DeferredSession;
pub use streaming::StreamingSession;
