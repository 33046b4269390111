//! Errors reported to loader callers.
//!
//! One failed batch round fails every waiter that shared it, so [`Error`]
//! is `Clone` and keeps underlying sources behind `Arc`.

use std::fmt;
use std::sync::Arc;

/// Shared, clonable error source.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub enum Error {
    /// The database rejected or failed a statement.
    Query(QueryError),
    /// A row could not be decoded.
    Type(TypeError),
    /// `load` found no row for the key.
    NotFound(NotFoundError),
    /// The slot was invalidated while the request was still pending.
    Flushed {
        /// Table, relation or loader whose cache was flushed.
        index: &'static str,
    },
    Config(ConfigError),
    Timeout,
    /// The statement was cancelled, or the loader stopped before it could
    /// deliver a result.
    Cancelled,
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    Syntax,
    /// Unique, foreign key or check violation.
    Constraint,
    Deadlock,
    /// Serialization failure; the transaction may succeed if retried.
    Serialization,
    Timeout,
    Database,
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub table: &'static str,
    /// Debug rendering of the key.
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<ErrorSource>,
}

impl Error {
    pub fn query(kind: QueryErrorKind, sql: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: Some(sql.into()),
            message: message.into(),
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Whether reissuing the same request may succeed.
    ///
    /// The loader never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Flushed { .. } | Error::Timeout => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// SQL of the failed statement, when there was one.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::NotFound(e) => write!(f, "{e}"),
            Error::Flushed { index } => write!(f, "The cache for '{index}' has been flushed"),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Timeout => f.write_str("Operation timed out"),
            Error::Cancelled => f.write_str("Operation cancelled"),
            Error::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => e
                .source
                .as_ref()
                .map(|err| err.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, column, self.actual
            ),
            None => write!(f, "expected {}, found {}", self.expected, self.actual),
        }
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "No row in '{}' with key {}", self.table, self.key)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: format!("invalid loader configuration: {err}"),
            source: Some(Arc::new(err)),
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
