//! Identifier generation for round-trip key strategies.
//!
//! Strategies that need no round trip (UUID, caller-assigned) resolve at
//! planning time inside the context crate; everything that reaches this
//! module costs one asynchronous round trip per key and runs as the
//! leading actions of a flush plan.

use tidemark_driver::{Connection, Statement};
use tidemark_types::{IdStrategy, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::SessionError;

/// Produce one key value for the given strategy.
///
/// # Errors
///
/// Returns [`SessionError::Driver`] if the allocation statement fails,
/// [`SessionError::KeyProducer`] if a custom producer fails, or
/// [`SessionError::Internal`] if the database returned no key.
pub async fn generate(
    strategy: &IdStrategy,
    conn: &mut dyn Connection,
) -> Result<Value, SessionError> {
    match strategy {
        // Normally resolved at planning time; kept here so a custom plan
        // cannot strand a UUID entity.
        IdStrategy::Uuid => Ok(Value::Uuid(Uuid::now_v7())),

        IdStrategy::Assigned => Err(SessionError::Internal(
            "assigned-key entity reached key generation",
        )),

        IdStrategy::Sequence { sequence } => {
            let outcome = conn
                .execute_one(Statement::NextVal {
                    sequence: sequence.clone(),
                })
                .await?;
            debug!(sequence, "sequence key drawn");
            outcome
                .generated_key
                .ok_or(SessionError::Internal("sequence returned no key"))
        }

        IdStrategy::TableRow {
            table,
            key_column,
            value_column,
            row_key,
        } => {
            let outcome = conn
                .execute_one(Statement::TableAlloc {
                    table: table.clone(),
                    key_column: key_column.clone(),
                    value_column: value_column.clone(),
                    row_key: row_key.clone(),
                })
                .await?;
            debug!(table, row_key, "table-allocated key drawn");
            outcome
                .generated_key
                .ok_or(SessionError::Internal("table allocator returned no key"))
        }

        IdStrategy::Custom(producer) => Ok(producer.next_key().await?),
    }
}
