//! Error types for the session layer.
//!
//! [`SessionError`] is what callers see: it adds the session-level
//! failures (state-machine misuse, optimistic-lock conflicts) and wraps
//! the planning-time [`ContextError`] and execution-time [`DriverError`]
//! with `#[from]` conversions, so `?` flows upward through the whole
//! engine.

use tidemark_context::ContextError;
use tidemark_driver::DriverError;
use tidemark_types::{EntityName, Ident, KeyProducerError};

use crate::state::SessionPhase;

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was closed; no further operations are accepted.
    #[error("session is closed")]
    Closed,

    /// The operation is not legal in the session's current phase.
    #[error("cannot {operation} while session is {phase}")]
    InvalidState {
        /// The phase the session was in.
        phase: SessionPhase,
        /// The rejected operation.
        operation: &'static str,
    },

    /// An optimistic version check failed: the row was modified (or
    /// deleted) by someone else since this session loaded it.
    #[error("stale state: version check failed for {ident}")]
    Stale {
        /// The identity whose write found unexpected prior state.
        ident: Ident,
    },

    /// A row this operation requires does not exist.
    #[error("{ident} not found in the database")]
    NotFound {
        /// The missing identity.
        ident: Ident,
    },

    /// The operation requires a managed instance, but this session does
    /// not manage the given one.
    #[error("instance of {entity} is not managed by this session")]
    NotManaged {
        /// The entity type of the unmanaged instance.
        entity: EntityName,
    },

    /// A version-based operation was requested on an unversioned type.
    #[error("{ident} has no optimistic-version column")]
    NotVersioned {
        /// The identity of the unversioned entity.
        ident: Ident,
    },

    /// Entity tracking or flush planning failed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The driver reported a failure.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A pluggable key producer failed.
    #[error(transparent)]
    KeyProducer(#[from] KeyProducerError),

    /// An internal invariant was violated. Indicates a bug, not a caller
    /// mistake.
    #[error("internal session error: {0}")]
    Internal(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_types::Value;

    #[test]
    fn stale_message_names_the_identity() {
        let err = SessionError::Stale {
            ident: Ident::assigned("Book", Value::Int(7)),
        };
        assert!(err.to_string().contains("Book#7"));
    }

    #[test]
    fn context_errors_convert() {
        let err: SessionError =
            ContextError::NoMetadata(EntityName::from("Ghost")).into();
        assert!(matches!(err, SessionError::Context(_)));
    }
}
