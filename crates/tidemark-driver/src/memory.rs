//! In-memory driver: interprets structured statements against plain maps.
//!
//! Engine tests run the full execution path -- planning, batching,
//! version predicates, transactions -- without a live database, because
//! the boundary carries structured [`Statement`]s rather than SQL text.
//! This driver interprets them directly over `BTreeMap` tables and records
//! every statement it sees, so tests can assert on both final state and
//! exact statement order.
//!
//! Deliberate simplifications: no SQL parsing (raw statements are
//! rejected), single-level transactions, and key allocation creates its
//! counter row on first use.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use tracing::debug;

use tidemark_types::{Row, Value};

use crate::connection::{Connection, Driver, ExecOutcome, RowStream};
use crate::error::DriverError;
use crate::statement::Statement;

type Table = Vec<BTreeMap<String, Value>>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Table>,
    sequences: BTreeMap<String, i64>,
    log: Vec<Statement>,
    saved: Option<BTreeMap<String, Table>>,
}

/// An in-memory [`Driver`] for tests and examples.
///
/// Cloning shares the underlying state, so a test can hold one handle for
/// inspection while sessions work through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    /// Create an empty in-memory driver.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed one row into a table.
    pub fn seed_row(&self, table: &str, row: impl IntoIterator<Item = (String, Value)>) {
        let mut state = self.lock();
        state
            .tables
            .entry(table.to_owned())
            .or_default()
            .push(row.into_iter().collect());
    }

    /// Set a sequence's current value (the next draw returns `value + 1`).
    pub fn set_sequence(&self, name: &str, value: i64) {
        self.lock().sequences.insert(name.to_owned(), value);
    }

    /// Snapshot of all statements executed so far, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock().log.clone()
    }

    /// Forget the statement log (state is untouched).
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Snapshot of a table's rows, in insertion order.
    pub fn rows(&self, table: &str) -> Table {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }
}

impl Driver for MemoryDriver {
    fn acquire(&self) -> BoxFuture<'_, Result<Box<dyn Connection>, DriverError>> {
        let conn = MemoryConnection {
            state: Arc::clone(&self.state),
        };
        async move { Ok(Box::new(conn) as Box<dyn Connection>) }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connection for MemoryConnection {
    fn execute_one(
        &mut self,
        statement: Statement,
    ) -> BoxFuture<'_, Result<ExecOutcome, DriverError>> {
        let result = apply(&mut self.lock(), statement);
        async move { result }.boxed()
    }

    fn execute_batch(
        &mut self,
        statements: Vec<Statement>,
    ) -> BoxFuture<'_, Result<Vec<ExecOutcome>, DriverError>> {
        let mut state = self.lock();
        let mut outcomes = Vec::with_capacity(statements.len());
        let mut failure = None;
        for statement in statements {
            match apply(&mut state, statement) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        drop(state);
        async move {
            match failure {
                Some(err) => Err(err),
                None => Ok(outcomes),
            }
        }
        .boxed()
    }

    fn execute_query(&mut self, statement: Statement) -> RowStream<'_> {
        let kind = statement.kind();
        let mut state = self.lock();
        state.log.push(statement.clone());

        // Raw SQL is not parsed, with one convenience exception for tests:
        // a bare `SELECT * FROM <table>` streams the whole table.
        let statement = match statement {
            Statement::Raw { sql, .. } => match full_table_select(&sql) {
                Some(table) => Statement::Select {
                    table,
                    columns: Vec::new(),
                    predicate: Vec::new(),
                    lock: None,
                },
                None => {
                    let err = DriverError::Unsupported {
                        what: format!("raw SQL in memory driver: {sql}"),
                    };
                    drop(state);
                    return futures::stream::once(async move { Err(err) }).boxed();
                }
            },
            other => other,
        };

        let Statement::Select {
            table,
            columns,
            predicate,
            lock: _,
        } = statement
        else {
            let err = DriverError::Unsupported {
                what: format!("{kind} statement in memory-driver execute_query"),
            };
            drop(state);
            return futures::stream::once(async move { Err(err) }).boxed();
        };

        let rows: Vec<Result<Row, DriverError>> = state
            .tables
            .get(&table)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter(|row| matches_predicate(row, &predicate))
            .map(|row| Ok(project(row, &columns)))
            .collect();
        drop(state);

        debug!(table, rows = rows.len(), "memory select");
        futures::stream::iter(rows).boxed()
    }
}

/// Interpret one non-query statement against the state.
fn apply(state: &mut MemoryState, statement: Statement) -> Result<ExecOutcome, DriverError> {
    state.log.push(statement.clone());
    let kind = statement.kind();
    match statement {
        Statement::Insert {
            table,
            columns,
            values,
        } => {
            if columns.len() != values.len() {
                return Err(DriverError::Unsupported {
                    what: format!("insert into {table} with mismatched arity"),
                });
            }
            let row: BTreeMap<String, Value> = columns.into_iter().zip(values).collect();
            state.tables.entry(table).or_default().push(row);
            Ok(ExecOutcome::rows(1))
        }
        Statement::Update {
            table,
            assignments,
            predicate,
        } => {
            let mut affected = 0u64;
            if let Some(rows) = state.tables.get_mut(&table) {
                for row in rows.iter_mut().filter(|r| matches_predicate(r, &predicate)) {
                    for (column, value) in &assignments {
                        row.insert(column.clone(), value.clone());
                    }
                    affected = affected.saturating_add(1);
                }
            }
            Ok(ExecOutcome::rows(affected))
        }
        Statement::Delete { table, predicate } => {
            let mut affected = 0u64;
            if let Some(rows) = state.tables.get_mut(&table) {
                let before = rows.len();
                rows.retain(|r| !matches_predicate(r, &predicate));
                affected = u64::try_from(before.saturating_sub(rows.len())).unwrap_or(u64::MAX);
            }
            Ok(ExecOutcome::rows(affected))
        }
        Statement::NextVal { sequence } => {
            let counter = state.sequences.entry(sequence).or_insert(0);
            *counter = counter.saturating_add(1);
            Ok(ExecOutcome::key(Value::Int(*counter)))
        }
        Statement::TableAlloc {
            table,
            key_column,
            value_column,
            row_key,
        } => {
            let rows = state.tables.entry(table).or_default();
            let key = Value::Text(row_key.clone());
            if let Some(row) = rows.iter_mut().find(|r| r.get(&key_column) == Some(&key)) {
                let next = match row.get(&value_column) {
                    Some(Value::Int(v)) => v.saturating_add(1),
                    _ => 1,
                };
                row.insert(value_column, Value::Int(next));
                return Ok(ExecOutcome::key(Value::Int(next)));
            }
            // First use: create the counter row.
            let mut row = BTreeMap::new();
            row.insert(key_column, key);
            row.insert(value_column.clone(), Value::Int(1));
            rows.push(row);
            Ok(ExecOutcome::key(Value::Int(1)))
        }
        Statement::Begin => {
            if state.saved.is_some() {
                return Err(DriverError::Unsupported {
                    what: "nested transaction".to_owned(),
                });
            }
            state.saved = Some(state.tables.clone());
            Ok(ExecOutcome::rows(0))
        }
        Statement::Commit => {
            if state.saved.take().is_none() {
                return Err(DriverError::Unsupported {
                    what: "commit outside a transaction".to_owned(),
                });
            }
            Ok(ExecOutcome::rows(0))
        }
        Statement::Rollback => match state.saved.take() {
            Some(tables) => {
                state.tables = tables;
                Ok(ExecOutcome::rows(0))
            }
            None => Err(DriverError::Unsupported {
                what: "rollback outside a transaction".to_owned(),
            }),
        },
        Statement::Select { .. } | Statement::Raw { .. } => Err(DriverError::Unsupported {
            what: format!("{kind} statement in execute_one"),
        }),
    }
}

/// Recognize `SELECT * FROM <table>` (nothing else) and return the table.
fn full_table_select(sql: &str) -> Option<String> {
    let rest = sql.trim().strip_prefix("SELECT * FROM ")?;
    let table = rest.trim().trim_end_matches(';');
    if table.is_empty() || table.contains(char::is_whitespace) {
        return None;
    }
    Some(table.to_owned())
}

fn matches_predicate(row: &BTreeMap<String, Value>, predicate: &[(String, Value)]) -> bool {
    predicate.iter().all(|(column, expected)| {
        let actual = row.get(column).unwrap_or(&Value::Null);
        actual == expected
    })
}

fn project(row: &BTreeMap<String, Value>, columns: &[String]) -> Row {
    if columns.is_empty() {
        return row
            .iter()
            .map(|(c, v)| (c.clone(), v.clone()))
            .collect();
    }
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}
