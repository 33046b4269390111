//! Core types and traits for the dbloader batching loader.
//!
//! This crate provides the vocabulary the loader is written against:
//!
//! - `Value` and `Row` for parameters and result sets
//! - `Connection` trait, the narrow SQL execution surface
//! - `SqlKey` for flattening (possibly composite) keys into bound parameters
//! - `Dialect` for placeholder style and identifier quoting
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod key;
pub mod row;
pub mod value;

pub use connection::{Connection, Statement, UpdateResult, outcome_into_result};
pub use dialect::Dialect;
pub use error::{
    ConfigError, Error, NotFoundError, QueryError, QueryErrorKind, Result, TypeError,
};
pub use key::SqlKey;
pub use row::{FromValue, Row};
pub use value::Value;
