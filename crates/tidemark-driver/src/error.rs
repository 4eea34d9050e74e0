//! Error types for the driver boundary.
//!
//! Driver errors split along the lines the engine cares about: transport
//! failures, admission-gate rejection, integrity violations the database
//! reported, and decode failures. The conversion from [`sqlx::Error`]
//! classifies integrity-constraint SQLSTATEs (class 23) so the engine can
//! surface them distinctly from connectivity problems.

/// Errors that can occur at the driver boundary.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A transport or protocol failure talking to the database.
    #[error("connection failure: {detail}")]
    Connection {
        /// Description of the underlying failure.
        detail: String,
    },

    /// A configuration error (bad URL, invalid pool settings).
    #[error("driver configuration error: {0}")]
    Config(String),

    /// The admission gate rejected the request: the pool and its bounded
    /// wait queue are both full. Fail fast rather than queue unbounded.
    #[error("connection pool exhausted (bounded queue full)")]
    PoolExhausted,

    /// The database reported an integrity-constraint violation
    /// (SQLSTATE class 23).
    #[error("constraint violation ({}): {detail}", .constraint.as_deref().unwrap_or("unnamed"))]
    ConstraintViolation {
        /// The violated constraint's name, when the database reported one.
        constraint: Option<String>,
        /// The database's error message.
        detail: String,
    },

    /// A result column could not be decoded into a [`Value`].
    ///
    /// [`Value`]: tidemark_types::Value
    #[error("cannot decode column {column}: {detail}")]
    Decode {
        /// The column that failed to decode.
        column: String,
        /// What went wrong.
        detail: String,
    },

    /// A batched multi-row statement affected an unexpected number of rows.
    #[error("batch affected {actual} rows, expected {expected}")]
    BatchMismatch {
        /// Rows the batch was built from.
        expected: u64,
        /// Rows the database reported.
        actual: u64,
    },

    /// The statement kind is not valid for the invoked operation (e.g. a
    /// query stream was requested for a delete).
    #[error("unsupported statement for this operation: {what}")]
    Unsupported {
        /// Description of the rejected statement.
        what: String,
    },
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let code = db.code();
            if code.as_deref().is_some_and(|c| c.starts_with("23")) {
                return Self::ConstraintViolation {
                    constraint: db.constraint().map(ToOwned::to_owned),
                    detail: db.message().to_owned(),
                };
            }
        }
        Self::Connection {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_constraint_name() {
        let err = DriverError::ConstraintViolation {
            constraint: Some("books_author_id_fkey".to_owned()),
            detail: "violates foreign key".to_owned(),
        };
        let text = err.to_string();
        assert!(text.contains("books_author_id_fkey"));
    }

    #[test]
    fn pool_exhausted_is_terse() {
        assert!(DriverError::PoolExhausted.to_string().contains("exhausted"));
    }
}
