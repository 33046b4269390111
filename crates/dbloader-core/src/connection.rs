//! The SQL execution surface the loader runs against.
//!
//! The loader only ever needs two capabilities from a database client:
//! run a query and get rows back, or run a write and learn how many rows it
//! touched. Both integrate with asupersync's structured concurrency via the
//! `Cx` context.

use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A SQL statement together with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Result of an INSERT, UPDATE or DELETE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    /// Number of rows the statement changed.
    pub rows_affected: u64,
    /// Keys generated by the database (auto-increment ids, RETURNING values).
    pub generated_keys: Vec<Value>,
}

impl UpdateResult {
    pub fn new(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            generated_keys: Vec::new(),
        }
    }

    /// Attach generated keys.
    pub fn with_generated_keys(mut self, keys: Vec<Value>) -> Self {
        self.generated_keys = keys;
        self
    }
}

/// A database connection capable of executing statements.
///
/// Implementations must be `Send + Sync`; the loader issues at most one
/// statement at a time on a given connection.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT * FROM items WHERE id = $1", &[Value::Int(1)]).await;
/// let changed = conn.execute(&cx, "DELETE FROM items WHERE id = $1", &[Value::Int(1)]).await;
/// ```
pub trait Connection: Send + Sync {
    /// Dialect used when rendering generated batch queries.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE).
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<UpdateResult, Error>> + Send;
}

/// Collapse an `Outcome` into a `Result` so it can be fanned out to waiters.
///
/// Cancellation and panics become ordinary errors; a waiter that shared a
/// cancelled batch sees [`Error::Cancelled`].
#[allow(clippy::result_large_err)]
pub fn outcome_into_result<T>(outcome: Outcome<T, Error>) -> Result<T> {
    match outcome {
        Outcome::Ok(value) => Ok(value),
        Outcome::Err(err) => Err(err),
        Outcome::Cancelled(_) => Err(Error::Cancelled),
        Outcome::Panicked(_) => Err(Error::Custom(
            "statement execution panicked".to_string(),
        )),
    }
}
