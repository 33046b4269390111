//! The request-scoped batching loader.
//!
//! A [`Loader`] collects lookups issued by any number of concurrent tasks
//! and serves them with as few statements as possible:
//!
//! - every request registers its key synchronously and returns a future;
//! - the first request that finds nothing to join asks the scheduler for
//!   one run of the dispatch loop;
//! - the dispatch loop drains explicit operations (writes, ad-hoc queries)
//!   in submission order, then runs one batch round for one index, then
//!   starts over, until nothing is left.
//!
//! Exactly one statement is in flight per loader at any time. All state
//! sits behind a single mutex that is never held across an `.await`.

use crate::batch::{BatchRound, RoundReport, RoundStatus, decode_rows};
use crate::config::LoaderConfig;
use crate::index::Request;
use crate::load_state::{Pending, Waiter};
use crate::master_index::MasterIndex;
use crate::n1_detection::SingleKeyRoundTracker;
use crate::scheduler::Scheduler;
use crate::schema::{BatchLoader, Relation, Table, TableId, ToOne, UniqueKey};
use crate::stats::LoaderStats;
use dbloader_core::{
    Connection, Cx, Dialect, Error, NotFoundError, Outcome, Result, Row, Statement, UpdateResult,
    outcome_into_result,
};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Future returned by multi-key and derived requests.
pub type LoadFuture<T> = BoxFuture<'static, Outcome<T, Error>>;

/// A write or ad-hoc query waiting in the explicit-operation queue.
trait ExplicitOp<C: Connection>: Send {
    fn label(&self) -> &'static str;

    /// True when the result has nobody left to go to.
    fn abandoned(&self) -> bool {
        false
    }

    fn run<'a>(self: Box<Self>, shared: &'a Shared<C>) -> BoxFuture<'a, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    fn label(self) -> &'static str {
        match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

struct WriteOp {
    kind: WriteKind,
    table: TableId,
    statement: Statement,
    reply: Waiter<UpdateResult>,
}

impl<C: Connection + 'static> ExplicitOp<C> for WriteOp {
    fn label(&self) -> &'static str {
        self.kind.label()
    }

    fn run<'a>(self: Box<Self>, shared: &'a Shared<C>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let WriteOp {
                kind,
                table,
                statement,
                reply,
            } = *self;
            shared.log_statement(kind.label(), &statement);
            let outcome = shared
                .conn
                .execute(&shared.cx, &statement.sql, &statement.params)
                .await;
            let result = outcome_into_result(outcome);
            match &result {
                Ok(update) => {
                    tracing::debug!(
                        table = table.name(),
                        op = kind.label(),
                        rows_affected = update.rows_affected,
                        "write executed"
                    );
                    shared.flush_related(table);
                }
                Err(err) => {
                    tracing::warn!(table = table.name(), op = kind.label(), error = %err, "write failed");
                }
            }
            if reply.send(result).is_err() {
                tracing::trace!(op = kind.label(), "write result dropped by caller");
            }
        })
    }
}

struct QueryOp {
    statement: Statement,
    reply: Waiter<Vec<Row>>,
}

impl<C: Connection + 'static> ExplicitOp<C> for QueryOp {
    fn label(&self) -> &'static str {
        "query"
    }

    fn abandoned(&self) -> bool {
        self.reply.is_canceled()
    }

    fn run<'a>(self: Box<Self>, shared: &'a Shared<C>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let QueryOp { statement, reply } = *self;
            shared.log_statement("query", &statement);
            let outcome = shared
                .conn
                .query(&shared.cx, &statement.sql, &statement.params)
                .await;
            if reply.send(outcome_into_result(outcome)).is_err() {
                tracing::trace!("query result dropped by caller");
            }
        })
    }
}

struct EntityQueryOp<T: Table> {
    statement: Statement,
    /// Replace cached instances instead of reusing them.
    refresh: bool,
    reply: Waiter<Vec<Arc<T>>>,
}

impl<T: Table, C: Connection + 'static> ExplicitOp<C> for EntityQueryOp<T> {
    fn label(&self) -> &'static str {
        "entity query"
    }

    fn abandoned(&self) -> bool {
        self.reply.is_canceled()
    }

    fn run<'a>(self: Box<Self>, shared: &'a Shared<C>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let EntityQueryOp {
                statement,
                refresh,
                reply,
            } = *self;
            shared.log_statement("entity query", &statement);
            let outcome = shared
                .conn
                .query(&shared.cx, &statement.sql, &statement.params)
                .await;
            let result = outcome_into_result(outcome)
                .and_then(|rows| decode_rows::<T>(&rows))
                .map(|entities| shared.ingest(entities, refresh));
            if reply.send(result).is_err() {
                tracing::trace!(table = T::TABLE_NAME, "entity query result dropped by caller");
            }
        })
    }
}

enum Work<C: Connection> {
    Op(Box<dyn ExplicitOp<C>>),
    Round(Box<dyn BatchRound<C>>),
    Idle,
}

struct LoaderState<C: Connection> {
    master: MasterIndex<C>,
    ops: VecDeque<Box<dyn ExplicitOp<C>>>,
    /// A dispatch run has been handed to the scheduler and not started yet.
    scheduled: bool,
    /// A dispatch loop is running.
    dispatching: bool,
    stats: LoaderStats,
    rounds: SingleKeyRoundTracker,
}

impl<C: Connection + 'static> LoaderState<C> {
    /// Returns true when the caller must hand a dispatch run to the scheduler.
    fn request_dispatch(&mut self) -> bool {
        if self.scheduled {
            return false;
        }
        self.scheduled = true;
        true
    }

    fn next_work(&mut self, dialect: Dialect, limit: Option<usize>) -> Work<C> {
        while let Some(op) = self.ops.pop_front() {
            if op.abandoned() {
                self.stats.skipped_ops += 1;
                tracing::trace!(op = op.label(), "skipping explicit read nobody awaits");
                continue;
            }
            self.stats.explicit_ops += 1;
            return Work::Op(op);
        }
        match self.master.next_round(dialect, limit) {
            Some(round) => Work::Round(round),
            None => Work::Idle,
        }
    }

    fn record_round(&mut self, report: RoundReport) {
        let stats = &mut self.stats;
        stats.batch_rounds += 1;
        stats.keys_requested += report.keys;
        stats.rows_loaded += report.rows;
        match report.status {
            RoundStatus::Resolved => {}
            RoundStatus::Failed => stats.failed_rounds += 1,
            RoundStatus::Stale => {
                stats.stale_rounds += 1;
                tracing::debug!(index = report.index, keys = report.keys, "discarded batch round for flushed index");
            }
        }
        if report.keys == 1 {
            stats.single_key_rounds += 1;
        }
        self.rounds.record_round(report.index, report.keys);
    }
}

struct Shared<C: Connection> {
    conn: C,
    cx: Cx,
    scheduler: Arc<dyn Scheduler>,
    config: LoaderConfig,
    state: Mutex<LoaderState<C>>,
}

impl<C: Connection + 'static> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, LoaderState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_dispatch(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        self.scheduler
            .schedule(Box::pin(async move { shared.run_once().await }));
    }

    fn log_statement(&self, op: &'static str, statement: &Statement) {
        if self.config.log_statements {
            tracing::debug!(op, sql = %statement.sql, params = statement.params.len(), "statement");
        }
    }

    /// Pass freshly decoded rows through the identity map.
    fn ingest<T: Table>(&self, entities: Vec<T>, refresh: bool) -> Vec<Arc<T>> {
        let mut state = self.lock();
        state.stats.rows_loaded += entities.len();
        entities
            .into_iter()
            .map(|entity| {
                if refresh {
                    state.master.row_refreshed(entity)
                } else {
                    state.master.row_loaded(entity)
                }
            })
            .collect()
    }

    fn flush_related(&self, table: TableId) {
        let notifications = {
            let mut state = self.lock();
            state.stats.flushes += 1;
            state.master.flush_related(table)
        };
        notifications.dispatch();
    }

    fn flush_all(&self) {
        let notifications = {
            let mut state = self.lock();
            state.stats.flushes += 1;
            state.master.flush_all()
        };
        notifications.dispatch();
    }

    /// Drain explicit operations and batch rounds until there is nothing
    /// left to do.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn run_once(self: Arc<Self>) {
        {
            let mut state = self.lock();
            state.scheduled = false;
            if state.dispatching {
                tracing::trace!("dispatch loop already running");
                return;
            }
            state.dispatching = true;
        }

        let mut guard = DispatchGuard {
            shared: Arc::clone(&self),
            armed: true,
            in_flight: None,
        };
        let dialect = self.conn.dialect();
        let limit = self.config.max_batch_size;

        loop {
            let work = {
                let mut state = self.lock();
                let work = state.next_work(dialect, limit);
                if matches!(work, Work::Idle) {
                    state.dispatching = false;
                    guard.armed = false;
                }
                work
            };

            match work {
                Work::Op(op) => {
                    tracing::trace!(op = op.label(), "running explicit operation");
                    op.run(&self).await;
                }
                Work::Round(round) => {
                    let index = round.index_name();
                    tracing::debug!(index, keys = round.key_count(), "running batch round");
                    if let Some(statement) = round.statement() {
                        self.log_statement("batch", statement);
                    }
                    guard
                        .in_flight
                        .insert(round)
                        .fetch(&self.cx, &self.conn)
                        .await;
                    if let Some(round) = guard.in_flight.take() {
                        let mut state = self.lock();
                        let report = round.complete(&mut state.master);
                        state.record_round(report);
                    }
                }
                Work::Idle => break,
            }
        }
    }
}

/// Cleans up after a dispatch loop dropped before going idle.
///
/// The round whose fetch was cut short fails its keys with
/// [`Error::Cancelled`], and a new run is scheduled if anything is still
/// queued or pending.
struct DispatchGuard<C: Connection + 'static> {
    shared: Arc<Shared<C>>,
    armed: bool,
    in_flight: Option<Box<dyn BatchRound<C>>>,
}

impl<C: Connection + 'static> Drop for DispatchGuard<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("dispatch loop dropped before going idle");
        let reschedule = {
            let mut state = self.shared.lock();
            state.dispatching = false;
            if let Some(mut round) = self.in_flight.take() {
                round.fail(Error::Cancelled);
                let report = round.complete(&mut state.master);
                state.record_round(report);
            }
            let leftover = !state.ops.is_empty() || state.master.has_pending();
            leftover && state.request_dispatch()
        };
        if reschedule {
            self.shared.schedule_dispatch();
        }
    }
}

/// Request-scoped batching and caching loader.
///
/// Cheap to clone; clones share caches, queue and connection. Create one
/// per logical request or connection and drop it afterwards; nothing is
/// shared between loaders.
///
/// # Example
///
/// ```rust,ignore
/// let scheduler = ManualScheduler::new();
/// let loader = Loader::new(cx, conn, Arc::new(scheduler.clone()));
///
/// let a = loader.find::<Item>((1, "abc".into()));
/// let b = loader.find::<Item>((1, "def".into()));
/// scheduler.run_pending().await;          // one SELECT for both keys
/// let (a, b) = (a.await, b.await);
/// ```
pub struct Loader<C: Connection + 'static> {
    shared: Arc<Shared<C>>,
}

impl<C: Connection + 'static> Clone for Loader<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connection + 'static> Loader<C> {
    /// Create a loader with default configuration.
    pub fn new(cx: Cx, conn: C, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::build(cx, conn, scheduler, LoaderConfig::default())
    }

    /// Create a loader with a validated configuration.
    #[allow(clippy::result_large_err)]
    pub fn with_config(
        cx: Cx,
        conn: C,
        scheduler: Arc<dyn Scheduler>,
        config: LoaderConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(cx, conn, scheduler, config))
    }

    fn build(cx: Cx, conn: C, scheduler: Arc<dyn Scheduler>, config: LoaderConfig) -> Self {
        let state = LoaderState {
            master: MasterIndex::new(),
            ops: VecDeque::new(),
            scheduled: false,
            dispatching: false,
            stats: LoaderStats::default(),
            rounds: SingleKeyRoundTracker::new(config.single_key_round_warn_threshold),
        };
        Self {
            shared: Arc::new(Shared {
                conn,
                cx,
                scheduler,
                config,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn connection(&self) -> &C {
        &self.shared.conn
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> LoaderStats {
        self.shared.lock().stats
    }

    /// Indices that ran enough single-key rounds to trigger the N+1 warning.
    pub fn flagged_indices(&self) -> Vec<&'static str> {
        self.shared.lock().rounds.flagged()
    }

    /// True when nothing is queued, pending or running.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.ops.is_empty() && !state.master.has_pending() && !state.dispatching
    }

    fn register<V>(&self, request: impl FnOnce(&mut LoaderState<C>) -> Request<V>) -> Pending<V> {
        let (request, schedule) = {
            let mut state = self.shared.lock();
            let request = request(&mut *state);
            let schedule = request.started() && state.request_dispatch();
            (request, schedule)
        };
        if schedule {
            self.shared.schedule_dispatch();
        }
        request.into_pending()
    }

    fn register_all<K: Clone, V>(
        &self,
        keys: impl IntoIterator<Item = K>,
        mut request: impl FnMut(&mut LoaderState<C>, K) -> Request<V>,
    ) -> Vec<(K, Pending<V>)> {
        let (pending, schedule) = {
            let mut state = self.shared.lock();
            let mut started = false;
            let mut pending = Vec::new();
            for key in keys {
                let req = request(&mut *state, key.clone());
                started |= req.started();
                pending.push((key, req.into_pending()));
            }
            let schedule = started && state.request_dispatch();
            (pending, schedule)
        };
        if schedule {
            self.shared.schedule_dispatch();
        }
        pending
    }

    fn enqueue(&self, op: Box<dyn ExplicitOp<C>>) {
        let schedule = {
            let mut state = self.shared.lock();
            state.ops.push_back(op);
            state.request_dispatch()
        };
        if schedule {
            self.shared.schedule_dispatch();
        }
    }

    /// Look up an entity by primary key; `None` when no row exists.
    pub fn find<T: Table>(&self, key: T::Key) -> Pending<Option<Arc<T>>> {
        self.register(|state| state.master.entity_index::<T>().keys_mut().request(key))
    }

    /// Look up an entity by one of its unique keys; `None` when no row
    /// exists. Shares instances with [`find`](Self::find).
    pub fn find_by_key<U: UniqueKey>(&self, key: U::Key) -> Pending<Option<Arc<U::Table>>> {
        self.register(|state| state.master.unique_index::<U>().keys_mut().request(key))
    }

    /// Like [`find_by_key`](Self::find_by_key), but a missing row is
    /// [`Error::NotFound`].
    pub fn load_by_key<U: UniqueKey>(&self, key: U::Key) -> LoadFuture<Arc<U::Table>> {
        let pending = self.find_by_key::<U>(key.clone());
        Box::pin(async move {
            into_outcome(outcome_into_result(pending.await).and_then(|found| require(found, &key)))
        })
    }

    /// Like [`find`](Self::find), but a missing row is [`Error::NotFound`].
    pub fn load<T: Table>(&self, key: T::Key) -> LoadFuture<Arc<T>> {
        let pending = self.find::<T>(key.clone());
        Box::pin(async move {
            into_outcome(outcome_into_result(pending.await).and_then(|found| require(found, &key)))
        })
    }

    /// Look up several entities; every key is registered before any is awaited.
    pub fn find_many<T: Table>(
        &self,
        keys: impl IntoIterator<Item = T::Key>,
    ) -> LoadFuture<HashMap<T::Key, Option<Arc<T>>>> {
        let pending = self.register_all(keys, |state, key| {
            state.master.entity_index::<T>().keys_mut().request(key)
        });
        Box::pin(async move { into_outcome(gather(pending).await) })
    }

    /// Like [`find_many`](Self::find_many); fails if any key has no row.
    pub fn load_many<T: Table>(
        &self,
        keys: impl IntoIterator<Item = T::Key>,
    ) -> LoadFuture<HashMap<T::Key, Arc<T>>> {
        let pending = self.register_all(keys, |state, key| {
            state.master.entity_index::<T>().keys_mut().request(key)
        });
        Box::pin(async move { into_outcome(gather_required(pending).await) })
    }

    /// Target rows of a to-many relation; empty when there are none.
    pub fn find_related<R: Relation>(&self, source: &R::Source) -> Pending<Vec<Arc<R::Target>>> {
        self.find_related_by_key::<R>(R::source_key(source))
    }

    /// Target rows of a to-many relation, addressed by source key.
    pub fn find_related_by_key<R: Relation>(
        &self,
        key: R::SourceKey,
    ) -> Pending<Vec<Arc<R::Target>>> {
        self.register(|state| state.master.relation_index::<R>().keys_mut().request(key))
    }

    /// Target rows for each of `sources`, keyed by source key.
    pub fn find_related_for_all<'s, R: Relation>(
        &self,
        sources: impl IntoIterator<Item = &'s R::Source>,
    ) -> LoadFuture<HashMap<R::SourceKey, Vec<Arc<R::Target>>>> {
        let keys = sources.into_iter().map(R::source_key);
        let pending = self.register_all(keys, |state, key| {
            state.master.relation_index::<R>().keys_mut().request(key)
        });
        Box::pin(async move { into_outcome(gather(pending).await) })
    }

    /// Follow a to-one reference; `None` when it is NULL or dangling.
    pub fn find_parent<R: ToOne>(&self, source: &R::Source) -> Pending<Option<Arc<R::Target>>> {
        match R::target_key(source) {
            Some(key) => self.find::<R::Target>(key),
            None => Pending::ready(None),
        }
    }

    /// Like [`find_parent`](Self::find_parent), but NULL or dangling
    /// references are [`Error::NotFound`].
    pub fn load_parent<R: ToOne>(&self, source: &R::Source) -> LoadFuture<Arc<R::Target>> {
        match R::target_key(source) {
            Some(key) => self.load::<R::Target>(key),
            None => Box::pin(async {
                Outcome::Err(Error::NotFound(NotFoundError {
                    table: <R::Target as Table>::TABLE_NAME,
                    key: "NULL".to_string(),
                }))
            }),
        }
    }

    /// Request one key from a caller-defined batch loader.
    pub fn load_batched<L: BatchLoader<C>>(&self, loader: &Arc<L>, key: L::Key) -> Pending<L::Value> {
        self.register(|state| state.master.batch_index(loader).keys_mut().request(key))
    }

    /// Request several keys from a caller-defined batch loader.
    pub fn load_batched_many<L: BatchLoader<C>>(
        &self,
        loader: &Arc<L>,
        keys: impl IntoIterator<Item = L::Key>,
    ) -> LoadFuture<HashMap<L::Key, L::Value>> {
        let pending = self.register_all(keys, |state, key| {
            state.master.batch_index(loader).keys_mut().request(key)
        });
        Box::pin(async move { into_outcome(gather(pending).await) })
    }

    fn write<T: Table>(&self, kind: WriteKind, statement: Statement) -> Pending<UpdateResult> {
        let (reply, pending) = Pending::channel();
        self.enqueue(Box::new(WriteOp {
            kind,
            table: TableId::of::<T>(),
            statement,
            reply,
        }));
        pending
    }

    /// Queue an INSERT into `T`. Caches related to `T` are flushed once it
    /// succeeds.
    pub fn execute_insert<T: Table>(&self, statement: Statement) -> Pending<UpdateResult> {
        self.write::<T>(WriteKind::Insert, statement)
    }

    /// Queue an UPDATE of `T`; resolves to the number of rows changed.
    pub fn execute_update<T: Table>(&self, statement: Statement) -> LoadFuture<u64> {
        rows_affected(self.write::<T>(WriteKind::Update, statement))
    }

    /// Queue a DELETE from `T`; resolves to the number of rows removed.
    pub fn execute_delete<T: Table>(&self, statement: Statement) -> LoadFuture<u64> {
        rows_affected(self.write::<T>(WriteKind::Delete, statement))
    }

    /// Queue an ad-hoc query. Its rows bypass every cache.
    pub fn query(&self, statement: Statement) -> Pending<Vec<Row>> {
        let (reply, pending) = Pending::channel();
        self.enqueue(Box::new(QueryOp { statement, reply }));
        pending
    }

    /// Queue an ad-hoc query returning rows of `T`.
    ///
    /// Rows go through `T`'s cache: keys already loaded keep their cached
    /// instance, keys still pending are resolved by the query.
    pub fn query_entities<T: Table>(&self, statement: Statement) -> Pending<Vec<Arc<T>>> {
        self.entity_query(statement, false)
    }

    /// Queue a locking read of `T` (`SELECT ... FOR UPDATE`).
    ///
    /// The rows are the newest state there is, so they replace any cached
    /// instance of the same key instead of deferring to it.
    pub fn query_entities_for_update<T: Table>(
        &self,
        statement: Statement,
    ) -> Pending<Vec<Arc<T>>> {
        self.entity_query(statement, true)
    }

    fn entity_query<T: Table>(&self, statement: Statement, refresh: bool) -> Pending<Vec<Arc<T>>> {
        let (reply, pending) = Pending::channel();
        self.enqueue(Box::new(EntityQueryOp::<T> {
            statement,
            refresh,
            reply,
        }));
        pending
    }

    /// The cached entity for `key`, without loading.
    ///
    /// `None` unless a lookup for `key` has completed; `Some(None)` when it
    /// completed without a row.
    pub fn cached<T: Table>(&self, key: &T::Key) -> Option<Option<Arc<T>>> {
        let mut state = self.shared.lock();
        state
            .master
            .entity_index::<T>()
            .keys()
            .loaded_value(key)
            .cloned()
    }

    /// Drop every cached value now.
    pub fn flush_all(&self) {
        self.shared.flush_all();
    }

    /// Drop the caches a write to `T` could have made stale.
    pub fn flush_table<T: Table>(&self) {
        self.shared.flush_related(TableId::of::<T>());
    }
}

impl<C: Connection + 'static> fmt::Debug for Loader<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Loader")
            .field("indices", &state.master)
            .field("queued_ops", &state.ops.len())
            .field("stats", &state.stats)
            .finish()
    }
}

fn into_outcome<T>(result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(err) => Outcome::Err(err),
    }
}

#[allow(clippy::result_large_err)]
fn require<T: Table, K: fmt::Debug>(found: Option<Arc<T>>, key: &K) -> Result<Arc<T>> {
    found.ok_or_else(|| {
        Error::NotFound(NotFoundError {
            table: T::TABLE_NAME,
            key: format!("{key:?}"),
        })
    })
}

async fn gather<K: Eq + Hash, V>(pending: Vec<(K, Pending<V>)>) -> Result<HashMap<K, V>> {
    let mut out = HashMap::with_capacity(pending.len());
    for (key, request) in pending {
        out.insert(key, outcome_into_result(request.await)?);
    }
    Ok(out)
}

async fn gather_required<T: Table>(
    pending: Vec<(T::Key, Pending<Option<Arc<T>>>)>,
) -> Result<HashMap<T::Key, Arc<T>>> {
    let mut out = HashMap::with_capacity(pending.len());
    for (key, request) in pending {
        let found = outcome_into_result(request.await)?;
        let entity = require(found, &key)?;
        out.insert(key, entity);
    }
    Ok(out)
}

fn rows_affected(pending: Pending<UpdateResult>) -> LoadFuture<u64> {
    Box::pin(async move {
        into_outcome(outcome_into_result(pending.await).map(|update| update.rows_affected))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use futures::FutureExt;

    /// A connection whose statements never complete.
    struct Stalled;

    impl Connection for Stalled {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn query(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[dbloader_core::Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            std::future::pending()
        }

        fn execute(
            &self,
            _cx: &Cx,
            _sql: &str,
            _params: &[dbloader_core::Value],
        ) -> impl Future<Output = Outcome<UpdateResult, Error>> + Send {
            std::future::pending()
        }
    }

    struct Gauge {
        id: i64,
    }

    impl Table for Gauge {
        type Key = i64;
        const TABLE_NAME: &'static str = "gauges";
        const COLUMNS: &'static [&'static str] = &["id"];
        const KEY_COLUMNS: &'static [&'static str] = &["id"];

        fn key(&self) -> i64 {
            self.id
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }
    }

    fn stalled_loader() -> (Loader<Stalled>, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        let loader = Loader::new(Cx::for_testing(), Stalled, Arc::new(scheduler.clone()));
        (loader, scheduler)
    }

    #[test]
    fn schedule_requests_collapse() {
        let (loader, scheduler) = stalled_loader();
        let _a = loader.find::<Gauge>(1);
        let _b = loader.find::<Gauge>(2);
        let _c = loader.find::<Gauge>(1);
        assert_eq!(scheduler.pending(), 1);
        assert!(!loader.is_idle());
    }

    #[test]
    fn dropped_dispatch_loop_fails_in_flight_keys() {
        let (loader, scheduler) = stalled_loader();
        let first = loader.find::<Gauge>(1);
        let joined = loader.find::<Gauge>(1);

        // Dropped while the batch statement is outstanding.
        assert!(Arc::clone(&loader.shared).run_once().now_or_never().is_none());
        {
            let state = loader.shared.lock();
            assert!(!state.dispatching);
            assert!(!state.master.has_pending());
            assert_eq!(state.stats.failed_rounds, 1);
        }
        for request in [first, joined] {
            assert!(matches!(
                request.now_or_never(),
                Some(Outcome::Err(Error::Cancelled))
            ));
        }

        // The key is requestable again and starts a fresh round.
        let again = loader.find::<Gauge>(1);
        assert!(!again.is_ready());
        let state = loader.shared.lock();
        assert!(state.master.has_pending());
        assert!(state.scheduled);
        drop(state);
        assert_eq!(scheduler.pending(), 2);
    }

    #[test]
    fn dropped_dispatch_loop_reschedules_queued_work() {
        let (loader, scheduler) = stalled_loader();
        let write =
            loader.execute_insert::<Gauge>(Statement::new("INSERT INTO gauges VALUES (1)", vec![]));
        let read = loader.find::<Gauge>(2);
        assert_eq!(scheduler.pending(), 1);

        // Dropped during the write; the read never got its round.
        assert!(Arc::clone(&loader.shared).run_once().now_or_never().is_none());

        assert!(matches!(
            write.now_or_never(),
            Some(Outcome::Err(Error::Cancelled))
        ));
        assert!(loader.shared.lock().master.has_pending());
        assert!(loader.shared.lock().scheduled);
        assert_eq!(scheduler.pending(), 2);
        drop(read);
    }

    #[test]
    fn nested_run_returns_while_loop_is_active() {
        let (loader, _scheduler) = stalled_loader();
        loader.shared.lock().dispatching = true;
        assert!(Arc::clone(&loader.shared).run_once().now_or_never().is_some());
        assert!(loader.shared.lock().dispatching);
    }
}
