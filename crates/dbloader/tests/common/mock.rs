//! An in-memory `Connection` for the integration tests.
//!
//! `MockConnection` records every statement it receives and answers
//! through caller-supplied handlers. It never yields: each returned future
//! is ready on first poll, so a `ManualScheduler` drain runs the whole
//! dispatch loop to completion.

use dbloader::{
    Connection, Cx, Dialect, Error, Outcome, QueryErrorKind, Result, Row, Statement, UpdateResult,
    Value,
};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

type QueryHandler = Arc<dyn Fn(&Statement) -> Result<Vec<Row>> + Send + Sync>;
type ExecuteHandler = Arc<dyn Fn(&Statement) -> Result<UpdateResult> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Execute,
}

/// A statement as the connection received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct MockState {
    log: Vec<RecordedStatement>,
    fail_next_queries: usize,
}

/// Scripted connection; clones share the statement log and handlers.
#[derive(Clone)]
pub struct MockConnection {
    dialect: Dialect,
    state: Arc<Mutex<MockState>>,
    on_query: Option<QueryHandler>,
    on_execute: Option<ExecuteHandler>,
}

impl MockConnection {
    /// A connection that returns no rows and reports one affected row per
    /// write until handlers are installed.
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Arc::new(Mutex::new(MockState::default())),
            on_query: None,
            on_execute: None,
        }
    }

    pub fn on_query(
        mut self,
        handler: impl Fn(&Statement) -> Result<Vec<Row>> + Send + Sync + 'static,
    ) -> Self {
        self.on_query = Some(Arc::new(handler));
        self
    }

    pub fn on_execute(
        mut self,
        handler: impl Fn(&Statement) -> Result<UpdateResult> + Send + Sync + 'static,
    ) -> Self {
        self.on_execute = Some(Arc::new(handler));
        self
    }

    /// Make the next `n` queries fail with a connection-level query error.
    pub fn fail_next_queries(&self, n: usize) {
        self.lock().fail_next_queries = n;
    }

    /// Every statement received so far, oldest first.
    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.lock().log.clone()
    }

    /// SQL of every query (not write) received so far.
    pub fn queries(&self) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|stmt| stmt.kind == StatementKind::Query)
            .map(|stmt| stmt.sql.clone())
            .collect()
    }

    /// SQL of every statement received so far.
    pub fn sql_log(&self) -> Vec<String> {
        self.lock().log.iter().map(|stmt| stmt.sql.clone()).collect()
    }

    pub fn clear(&self) {
        self.lock().log.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, kind: StatementKind, sql: &str, params: &[Value]) -> bool {
        let mut state = self.lock();
        state.log.push(RecordedStatement {
            kind,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        if kind == StatementKind::Query && state.fail_next_queries > 0 {
            state.fail_next_queries -= 1;
            return true;
        }
        false
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = if self.record(StatementKind::Query, sql, params) {
            Err(Error::query(
                QueryErrorKind::Database,
                sql,
                "injected query failure",
            ))
        } else {
            match &self.on_query {
                Some(handler) => handler(&Statement::new(sql, params.to_vec())),
                None => Ok(Vec::new()),
            }
        };
        async move {
            match result {
                Ok(rows) => Outcome::Ok(rows),
                Err(err) => Outcome::Err(err),
            }
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<UpdateResult, Error>> + Send {
        self.record(StatementKind::Execute, sql, params);
        let result = match &self.on_execute {
            Some(handler) => handler(&Statement::new(sql, params.to_vec())),
            None => Ok(UpdateResult::new(1)),
        };
        async move {
            match result {
                Ok(update) => Outcome::Ok(update),
                Err(err) => Outcome::Err(err),
            }
        }
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("dialect", &self.dialect)
            .field("statements", &self.lock().log.len())
            .finish_non_exhaustive()
    }
}

/// Build rows sharing one column list.
pub fn rows(columns: &[&str], values: Vec<Vec<Value>>) -> Vec<Row> {
    let names: Arc<[String]> = columns.iter().map(|c| (*c).to_string()).collect();
    values
        .into_iter()
        .map(|row| Row::new(Arc::clone(&names), row))
        .collect()
}

/// The rows of `table` a generated `IN` query selects.
///
/// Splits `stmt.params` into key tuples of `key_columns.len()` values and
/// keeps each row whose `key_columns` match one of them.
pub fn rows_matching(stmt: &Statement, table: &[Row], key_columns: &[&str]) -> Vec<Row> {
    let arity = key_columns.len().max(1);
    let wanted: Vec<&[Value]> = stmt.params.chunks(arity).collect();
    table
        .iter()
        .filter(|row| {
            let key: Vec<Option<&Value>> = key_columns
                .iter()
                .map(|column| row.get(column))
                .collect();
            wanted.iter().any(|tuple| {
                tuple.len() == key.len()
                    && tuple
                        .iter()
                        .zip(&key)
                        .all(|(param, value)| Some(param) == *value)
            })
        })
        .cloned()
        .collect()
}
