//! Batch rounds: one statement resolving every pending key of one index.
//!
//! A round is split in three so that no lock is held while the database
//! works: [`ErasedIndex::begin_round`] takes the pending keys (under the
//! loader lock), [`BatchRound::fetch`] runs the statement (unlocked), and
//! [`BatchRound::complete`] resolves the slots (under the lock again).
//!
//! A round whose index was flushed while it was in flight is discarded on
//! completion; its waiters already received [`Error::Flushed`]. A round
//! whose fetch never finished is [failed](BatchRound::fail) and completed
//! like any other, so its keys never stay LOADING.

use crate::index::{BatchIndex, EntityIndex, FlushNotifications, RelationIndex, UniqueIndex};
use crate::master_index::{ErasedIndex, MasterIndex};
use crate::schema::{BatchLoader, Relation, Table, TableId, UniqueKey};
use dbloader_core::{
    Connection, Cx, Dialect, Error, Result, Row, Statement, outcome_into_result,
};
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// How a completed round went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoundStatus {
    Resolved,
    Failed,
    /// Index was flushed mid-flight; result dropped.
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RoundReport {
    pub(crate) index: &'static str,
    pub(crate) keys: usize,
    pub(crate) rows: usize,
    pub(crate) status: RoundStatus,
}

pub(crate) trait BatchRound<C: Connection>: Send {
    fn index_name(&self) -> &'static str;

    fn key_count(&self) -> usize;

    /// Generated SQL, when the round runs one.
    fn statement(&self) -> Option<&Statement>;

    fn fetch<'a>(&'a mut self, cx: &'a Cx, conn: &'a C) -> BoxFuture<'a, ()>;

    /// Record `err` as the fetch result, replacing whatever is there.
    fn fail(&mut self, err: Error);

    fn complete(self: Box<Self>, master: &mut MasterIndex<C>) -> RoundReport;
}

fn run_query<'a, C: Connection>(
    cx: &'a Cx,
    conn: &'a C,
    statement: &'a Statement,
    slot: &'a mut Option<Result<Vec<Row>>>,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let outcome = conn.query(cx, &statement.sql, &statement.params).await;
        *slot = Some(outcome_into_result(outcome));
    })
}

fn fetched<T>(slot: Option<Result<T>>, index: &'static str) -> Result<T> {
    slot.unwrap_or_else(|| {
        Err(Error::Custom(format!(
            "batch round for '{index}' completed without fetching"
        )))
    })
}

#[allow(clippy::result_large_err)]
pub(crate) fn decode_rows<T: Table>(rows: &[Row]) -> Result<Vec<T>> {
    rows.iter().map(T::from_row).collect()
}

fn report(index: &'static str, keys: usize, rows: usize, status: RoundStatus) -> RoundReport {
    RoundReport {
        index,
        keys,
        rows,
        status,
    }
}

struct EntityRound<T: Table> {
    keys: Vec<T::Key>,
    statement: Statement,
    generation: u64,
    rows: Option<Result<Vec<Row>>>,
}

impl<T: Table, C: Connection + 'static> BatchRound<C> for EntityRound<T> {
    fn index_name(&self) -> &'static str {
        T::TABLE_NAME
    }

    fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn statement(&self) -> Option<&Statement> {
        Some(&self.statement)
    }

    fn fetch<'a>(&'a mut self, cx: &'a Cx, conn: &'a C) -> BoxFuture<'a, ()> {
        run_query(cx, conn, &self.statement, &mut self.rows)
    }

    fn fail(&mut self, err: Error) {
        self.rows = Some(Err(err));
    }

    fn complete(self: Box<Self>, master: &mut MasterIndex<C>) -> RoundReport {
        let EntityRound {
            keys,
            generation,
            rows,
            ..
        } = *self;
        if master.entity_index::<T>().keys().generation() != generation {
            return report(T::TABLE_NAME, keys.len(), 0, RoundStatus::Stale);
        }

        let decoded = fetched(rows, T::TABLE_NAME).and_then(|rows| decode_rows::<T>(&rows));
        match decoded {
            Ok(entities) => {
                let count = entities.len();
                for entity in entities {
                    master.row_loaded(entity);
                }
                master
                    .entity_index::<T>()
                    .keys_mut()
                    .resolve_missing(&keys, &None);
                report(T::TABLE_NAME, keys.len(), count, RoundStatus::Resolved)
            }
            Err(err) => {
                tracing::error!(table = T::TABLE_NAME, keys = keys.len(), error = %err, "batch round failed");
                master
                    .entity_index::<T>()
                    .keys_mut()
                    .resolve_error(&keys, &err);
                report(T::TABLE_NAME, keys.len(), 0, RoundStatus::Failed)
            }
        }
    }
}

impl<T: Table, C: Connection + 'static> ErasedIndex<C> for EntityIndex<T> {
    fn name(&self) -> &'static str {
        T::TABLE_NAME
    }

    fn has_pending(&self) -> bool {
        self.keys().has_pending()
    }

    fn begin_round(
        &mut self,
        dialect: Dialect,
        limit: Option<usize>,
    ) -> Option<Box<dyn BatchRound<C>>> {
        let generation = self.keys().generation();
        let keys = self.keys_mut().take_keys_to_load(limit)?;
        let statement = T::build_in_query(dialect, &keys);
        Some(Box::new(EntityRound::<T> {
            keys,
            statement,
            generation,
            rows: None,
        }))
    }

    fn flush(&mut self, deferred: &mut FlushNotifications) {
        self.keys_mut().flush(deferred);
    }

    fn touches(&self, table: TableId) -> bool {
        table.is::<T>()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct UniqueRound<U: UniqueKey> {
    keys: Vec<U::Key>,
    statement: Statement,
    generation: u64,
    rows: Option<Result<Vec<Row>>>,
}

impl<U: UniqueKey, C: Connection + 'static> BatchRound<C> for UniqueRound<U> {
    fn index_name(&self) -> &'static str {
        U::NAME
    }

    fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn statement(&self) -> Option<&Statement> {
        Some(&self.statement)
    }

    fn fetch<'a>(&'a mut self, cx: &'a Cx, conn: &'a C) -> BoxFuture<'a, ()> {
        run_query(cx, conn, &self.statement, &mut self.rows)
    }

    fn fail(&mut self, err: Error) {
        self.rows = Some(Err(err));
    }

    fn complete(self: Box<Self>, master: &mut MasterIndex<C>) -> RoundReport {
        let UniqueRound {
            keys,
            generation,
            rows,
            ..
        } = *self;
        if master.unique_index::<U>().keys().generation() != generation {
            return report(U::NAME, keys.len(), 0, RoundStatus::Stale);
        }

        match fetched(rows, U::NAME).and_then(|rows| decode_rows::<U::Table>(&rows)) {
            Ok(entities) => {
                let count = entities.len();
                // Goes through the entity index, which fills this index too.
                for entity in entities {
                    master.row_loaded(entity);
                }
                master
                    .unique_index::<U>()
                    .keys_mut()
                    .resolve_missing(&keys, &None);
                report(U::NAME, keys.len(), count, RoundStatus::Resolved)
            }
            Err(err) => {
                tracing::error!(key = U::NAME, keys = keys.len(), error = %err, "batch round failed");
                master
                    .unique_index::<U>()
                    .keys_mut()
                    .resolve_error(&keys, &err);
                report(U::NAME, keys.len(), 0, RoundStatus::Failed)
            }
        }
    }
}

impl<U: UniqueKey, C: Connection + 'static> ErasedIndex<C> for UniqueIndex<U> {
    fn name(&self) -> &'static str {
        U::NAME
    }

    fn has_pending(&self) -> bool {
        self.keys().has_pending()
    }

    fn begin_round(
        &mut self,
        dialect: Dialect,
        limit: Option<usize>,
    ) -> Option<Box<dyn BatchRound<C>>> {
        let generation = self.keys().generation();
        let keys = self.keys_mut().take_keys_to_load(limit)?;
        let statement = U::build_in_query(dialect, &keys);
        Some(Box::new(UniqueRound::<U> {
            keys,
            statement,
            generation,
            rows: None,
        }))
    }

    fn flush(&mut self, deferred: &mut FlushNotifications) {
        self.keys_mut().flush(deferred);
    }

    fn touches(&self, table: TableId) -> bool {
        table.is::<U::Table>()
    }

    fn entity_loaded(&mut self, entity: &dyn Any, refresh: bool) {
        if let Some(entity) = entity.downcast_ref::<Arc<U::Table>>() {
            UniqueIndex::entity_loaded(self, entity, refresh);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct RelationRound<R: Relation> {
    keys: Vec<R::SourceKey>,
    statement: Statement,
    generation: u64,
    rows: Option<Result<Vec<Row>>>,
}

impl<R: Relation, C: Connection + 'static> BatchRound<C> for RelationRound<R> {
    fn index_name(&self) -> &'static str {
        R::NAME
    }

    fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn statement(&self) -> Option<&Statement> {
        Some(&self.statement)
    }

    fn fetch<'a>(&'a mut self, cx: &'a Cx, conn: &'a C) -> BoxFuture<'a, ()> {
        run_query(cx, conn, &self.statement, &mut self.rows)
    }

    fn fail(&mut self, err: Error) {
        self.rows = Some(Err(err));
    }

    fn complete(self: Box<Self>, master: &mut MasterIndex<C>) -> RoundReport {
        let RelationRound {
            keys,
            generation,
            rows,
            ..
        } = *self;
        if master.relation_index::<R>().keys().generation() != generation {
            return report(R::NAME, keys.len(), 0, RoundStatus::Stale);
        }

        let decoded = fetched(rows, R::NAME).and_then(|rows| decode_rows::<R::Target>(&rows));
        let targets = match decoded {
            Ok(targets) => targets,
            Err(err) => {
                tracing::error!(relation = R::NAME, keys = keys.len(), error = %err, "batch round failed");
                master
                    .relation_index::<R>()
                    .keys_mut()
                    .resolve_error(&keys, &err);
                return report(R::NAME, keys.len(), 0, RoundStatus::Failed);
            }
        };

        let count = targets.len();
        let mut groups: HashMap<R::SourceKey, Vec<Arc<R::Target>>> = HashMap::new();
        for target in targets {
            let source = R::reverse_key(&target);
            groups
                .entry(source)
                .or_default()
                .push(master.row_loaded(target));
        }

        let relation = master.relation_index::<R>().keys_mut();
        for key in &keys {
            let group = groups.remove(key).unwrap_or_default();
            relation.resolve(key.clone(), group);
        }
        report(R::NAME, keys.len(), count, RoundStatus::Resolved)
    }
}

impl<R: Relation, C: Connection + 'static> ErasedIndex<C> for RelationIndex<R> {
    fn name(&self) -> &'static str {
        R::NAME
    }

    fn has_pending(&self) -> bool {
        self.keys().has_pending()
    }

    fn begin_round(
        &mut self,
        dialect: Dialect,
        limit: Option<usize>,
    ) -> Option<Box<dyn BatchRound<C>>> {
        let generation = self.keys().generation();
        let keys = self.keys_mut().take_keys_to_load(limit)?;
        let statement = R::build_in_query(dialect, &keys);
        Some(Box::new(RelationRound::<R> {
            keys,
            statement,
            generation,
            rows: None,
        }))
    }

    fn flush(&mut self, deferred: &mut FlushNotifications) {
        self.keys_mut().flush(deferred);
    }

    fn touches(&self, table: TableId) -> bool {
        table.is::<R::Source>() || table.is::<R::Target>()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct LoaderRound<L: BatchLoader<C>, C: Connection> {
    loader: Arc<L>,
    keys: Vec<L::Key>,
    generation: u64,
    values: Option<Result<HashMap<L::Key, L::Value>>>,
    _conn: PhantomData<fn() -> C>,
}

impl<L, C> BatchRound<C> for LoaderRound<L, C>
where
    L: BatchLoader<C>,
    C: Connection + 'static,
{
    fn index_name(&self) -> &'static str {
        L::NAME
    }

    fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn statement(&self) -> Option<&Statement> {
        None
    }

    fn fetch<'a>(&'a mut self, cx: &'a Cx, conn: &'a C) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let outcome = self.loader.load_now(cx, conn, &self.keys).await;
            self.values = Some(outcome_into_result(outcome));
        })
    }

    fn fail(&mut self, err: Error) {
        self.values = Some(Err(err));
    }

    fn complete(self: Box<Self>, master: &mut MasterIndex<C>) -> RoundReport {
        let LoaderRound {
            loader,
            keys,
            generation,
            values,
            ..
        } = *self;
        let Some(index) = master.existing_batch_index::<L>() else {
            return report(L::NAME, keys.len(), 0, RoundStatus::Stale);
        };
        if index.keys().generation() != generation {
            return report(L::NAME, keys.len(), 0, RoundStatus::Stale);
        }

        match fetched(values, L::NAME) {
            Ok(mut values) => {
                let found = values.len();
                let null = loader.null_value();
                for key in keys.iter().cloned() {
                    let value = values.remove(&key).unwrap_or_else(|| null.clone());
                    index.keys_mut().resolve(key, value);
                }
                report(L::NAME, keys.len(), found, RoundStatus::Resolved)
            }
            Err(err) => {
                tracing::error!(loader = L::NAME, keys = keys.len(), error = %err, "batch round failed");
                index.keys_mut().resolve_error(&keys, &err);
                report(L::NAME, keys.len(), 0, RoundStatus::Failed)
            }
        }
    }
}

impl<L, C> ErasedIndex<C> for BatchIndex<L, C>
where
    L: BatchLoader<C>,
    C: Connection + 'static,
{
    fn name(&self) -> &'static str {
        L::NAME
    }

    fn has_pending(&self) -> bool {
        self.keys().has_pending()
    }

    fn begin_round(
        &mut self,
        _dialect: Dialect,
        limit: Option<usize>,
    ) -> Option<Box<dyn BatchRound<C>>> {
        let generation = self.keys().generation();
        let keys = self.keys_mut().take_keys_to_load(limit)?;
        Some(Box::new(LoaderRound::<L, C> {
            loader: Arc::clone(self.loader()),
            keys,
            generation,
            values: None,
            _conn: PhantomData,
        }))
    }

    fn flush(&mut self, deferred: &mut FlushNotifications) {
        self.keys_mut().flush(deferred);
    }

    fn touches(&self, table: TableId) -> bool {
        self.loader().is_related(table)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
