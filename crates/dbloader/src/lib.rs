//! Request-scoped batching and caching for database reads.
//!
//! `dbloader` turns many independent lookups issued during one logical
//! request into a few `SELECT ... WHERE key IN (...)` statements:
//!
//! - entity lookups by (possibly composite) primary key or by a unique key;
//! - to-many relations, grouped by source key;
//! - to-one references, resolved through the target's entity cache;
//! - caller-defined [`BatchLoader`]s.
//!
//! Writes and ad-hoc queries go through the same [`Loader`] and run, in
//! submission order, before any pending batch. A successful write flushes
//! every cache it could have made stale.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbloader::{Loader, ManualScheduler};
//!
//! let scheduler = ManualScheduler::new();
//! let loader = Loader::new(cx, conn, Arc::new(scheduler.clone()));
//!
//! let item = loader.find::<Item>((1, "abc".to_string()));
//! let items = loader.find_related::<CompanyItems>(&company);
//! scheduler.run_pending().await;
//! ```

pub mod config;
pub mod index;
pub mod load_state;
pub mod loader;
pub mod master_index;
pub mod n1_detection;
pub mod scheduler;
pub mod schema;
pub mod stats;

mod batch;

pub use config::LoaderConfig;
pub use index::{
    BatchIndex, EntityIndex, FlushNotifications, KeyedIndex, RelationIndex, UniqueIndex,
};
pub use load_state::{LoadPhase, LoadState, Pending};
pub use loader::{LoadFuture, Loader};
pub use master_index::MasterIndex;
pub use n1_detection::SingleKeyRoundTracker;
pub use scheduler::{ManualScheduler, ScheduledTask, Scheduler, SpawnScheduler};
pub use schema::{BatchLoader, Relation, Table, TableId, ToOne, UniqueKey, select_in};
pub use stats::LoaderStats;

pub use dbloader_core::{
    Connection, Cx, Dialect, Error, FromValue, NotFoundError, Outcome, QueryErrorKind, Result,
    Row, SqlKey, Statement, TypeError, UpdateResult, Value,
};
