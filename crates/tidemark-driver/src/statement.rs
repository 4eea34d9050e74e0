//! Structured statements handed across the driver boundary.
//!
//! The engine describes *what* must run; each driver decides how to say it
//! in its own dialect. Keeping statements structured (rather than SQL
//! text) lets the `PostgreSQL` driver render parameterized SQL while the
//! in-memory driver interprets the same statements directly, so both run
//! the identical execution path above the boundary.
//!
//! Identifier values (table and column names) come from validated mapping
//! metadata; user data only ever travels in [`Value`] parameters.

use tidemark_types::Value;

/// Row-lock levels for locking reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    /// `FOR SHARE`: block writers, admit other readers.
    Shared,
    /// `FOR UPDATE`: exclusive row lock.
    Exclusive,
}

/// One structured statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Insert one row.
    Insert {
        /// Target table.
        table: String,
        /// Column names, in payload order.
        columns: Vec<String>,
        /// One value per column.
        values: Vec<Value>,
    },
    /// Update columns of the rows matching the predicate.
    Update {
        /// Target table.
        table: String,
        /// `column = value` assignments, in order.
        assignments: Vec<(String, Value)>,
        /// Conjunction of equality conditions (NULL compares with
        /// `IS NULL`).
        predicate: Vec<(String, Value)>,
    },
    /// Delete the rows matching the predicate.
    Delete {
        /// Target table.
        table: String,
        /// Conjunction of equality conditions.
        predicate: Vec<(String, Value)>,
    },
    /// Read rows matching the predicate.
    Select {
        /// Source table.
        table: String,
        /// Columns to project.
        columns: Vec<String>,
        /// Conjunction of equality conditions.
        predicate: Vec<(String, Value)>,
        /// Optional row lock taken by the read.
        lock: Option<RowLock>,
    },
    /// Draw the next value from a sequence.
    NextVal {
        /// The sequence name.
        sequence: String,
    },
    /// Allocate a key from a counter row: increment and return the new
    /// value.
    TableAlloc {
        /// The allocator table.
        table: String,
        /// The column identifying the counter row.
        key_column: String,
        /// The column holding the counter value.
        value_column: String,
        /// The counter-row key.
        row_key: String,
    },
    /// Pass-through SQL with positional parameters. Used for caller
    /// queries; never produced by the flush path.
    Raw {
        /// The SQL text with `$1..$n` placeholders.
        sql: String,
        /// Positional parameters.
        params: Vec<Value>,
    },
    /// Open a transaction on this connection.
    Begin,
    /// Commit the open transaction.
    Commit,
    /// Roll back the open transaction.
    Rollback,
}

impl Statement {
    /// Short name of the statement kind, for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Select { .. } => "select",
            Self::NextVal { .. } => "nextval",
            Self::TableAlloc { .. } => "table-alloc",
            Self::Raw { .. } => "raw",
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }

    /// Whether this statement produces a row stream (vs a single outcome).
    pub const fn is_query(&self) -> bool {
        matches!(self, Self::Select { .. } | Self::Raw { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        let insert = Statement::Insert {
            table: "books".to_owned(),
            columns: vec!["id".to_owned()],
            values: vec![Value::Int(1)],
        };
        assert_eq!(insert.kind(), "insert");
        assert_eq!(Statement::Begin.kind(), "begin");
    }

    #[test]
    fn queries_are_classified() {
        let select = Statement::Select {
            table: "books".to_owned(),
            columns: vec!["id".to_owned()],
            predicate: Vec::new(),
            lock: None,
        };
        assert!(select.is_query());
        assert!(!Statement::Commit.is_query());
    }
}
