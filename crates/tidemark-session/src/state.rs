//! The session lifecycle state machine.
//!
//! A session is active from construction (opening *is* creation; there is
//! no separate begin step for non-transactional use) and moves through:
//!
//! ```text
//! active <--> flushing --> flush-failed
//!    |                         |
//!    +--> closed (terminal)    +--> failed (terminal)
//! ```
//!
//! `failed` is reached from `active` or `flushing` on unrecoverable errors
//! (including a flush future dropped mid-execution, since partially
//! executed plans cannot be assumed consistent). `closed` is reachable
//! from every state and accepts no further work.

use serde::{Deserialize, Serialize};

/// The lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Accepting operations.
    Active,
    /// A flush is executing; no other operation may run.
    Flushing,
    /// A flush failed partway; only rollback and close are meaningful.
    FlushFailed,
    /// Unrecoverable error; terminal.
    Failed,
    /// Closed by the caller; terminal.
    Closed,
}

impl SessionPhase {
    /// Whether the phase accepts new persistence operations.
    pub const fn accepts_work(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether the phase is terminal.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl core::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Flushing => "flushing",
            Self::FlushFailed => "flush-failed",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_active_accepts_work() {
        assert!(SessionPhase::Active.accepts_work());
        assert!(!SessionPhase::Flushing.accepts_work());
        assert!(!SessionPhase::FlushFailed.accepts_work());
        assert!(!SessionPhase::Failed.accepts_work());
        assert!(!SessionPhase::Closed.accepts_work());
    }

    #[test]
    fn terminal_phases() {
        assert!(SessionPhase::Failed.is_terminal());
        assert!(SessionPhase::Closed.is_terminal());
        assert!(!SessionPhase::FlushFailed.is_terminal());
    }
}
