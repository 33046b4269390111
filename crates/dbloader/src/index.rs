//! Per-table, per-unique-key, per-relation and per-loader caches.
//!
//! Every index is a [`KeyedIndex`]: a map from key to [`LoadState`] plus the
//! ordered set of keys waiting for the next batch round. The typed wrappers
//! only differ in what a slot holds and what "no row" resolves to.

use crate::load_state::{LoadPhase, LoadState, Pending};
use crate::schema::{BatchLoader, Relation, Table, UniqueKey};
use dbloader_core::{Connection, Error};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// What [`KeyedIndex::request`] did with a key.
pub(crate) enum Request<V> {
    /// Already loaded; nothing to schedule.
    Cached(V),
    /// Joined an in-progress load.
    Joined(Pending<V>),
    /// Started a new load; the key is now pending.
    Started(Pending<V>),
}

impl<V> Request<V> {
    pub(crate) fn started(&self) -> bool {
        matches!(self, Request::Started(_))
    }

    pub(crate) fn into_pending(self) -> Pending<V> {
        match self {
            Request::Cached(value) => Pending::ready(value),
            Request::Joined(pending) | Request::Started(pending) => pending,
        }
    }
}

/// Key to [`LoadState`] map with a pending set in insertion order.
///
/// `pending_set` is authoritative. `queue` keeps request order and may hold
/// keys that were resolved out of band; those are skipped when taken.
pub struct KeyedIndex<K, V> {
    name: &'static str,
    cache: HashMap<K, LoadState<V>>,
    queue: VecDeque<K>,
    pending_set: HashSet<K>,
    generation: u64,
}

impl<K, V> KeyedIndex<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cache: HashMap::new(),
            queue: VecDeque::new(),
            pending_set: HashSet::new(),
            generation: 0,
        }
    }

    /// Table or relation this index caches, for logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bumped by every flush.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The slot for `key`, created INITIAL on first access.
    ///
    /// An existing slot is never replaced.
    pub fn get(&mut self, key: K) -> &mut LoadState<V> {
        self.cache.entry(key).or_default()
    }

    /// Phase of `key`'s slot without creating one.
    pub fn phase_of(&self, key: &K) -> Option<LoadPhase> {
        self.cache.get(key).map(LoadState::phase)
    }

    /// The value of `key`'s slot if it is LOADED.
    pub fn loaded_value(&self, key: &K) -> Option<&V> {
        self.cache
            .get(key)
            .filter(|state| state.is_loaded())
            .map(LoadState::value)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Queue `key` for the next batch round. Duplicates collapse.
    pub fn add_key_to_load(&mut self, key: K) {
        if self.pending_set.insert(key.clone()) {
            self.queue.push_back(key);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_set.is_empty()
    }

    /// Pending keys in the order the next rounds will take them.
    pub fn pending_keys(&self) -> Vec<K> {
        let mut seen = HashSet::with_capacity(self.pending_set.len());
        self.queue
            .iter()
            .filter(|key| self.pending_set.contains(*key) && seen.insert(*key))
            .cloned()
            .collect()
    }

    /// Take up to `limit` pending keys (all of them when `None`).
    ///
    /// Keys requested while the returned batch is in flight go into the
    /// now-empty pending set and are served by a later round.
    pub fn take_keys_to_load(&mut self, limit: Option<usize>) -> Option<Vec<K>> {
        if self.pending_set.is_empty() {
            self.queue.clear();
            return None;
        }
        let limit = limit.unwrap_or(usize::MAX);
        let mut batch = Vec::with_capacity(self.pending_set.len().min(limit));
        while batch.len() < limit {
            let Some(key) = self.queue.pop_front() else {
                break;
            };
            if self.pending_set.remove(&key) {
                batch.push(key);
            }
        }
        if self.pending_set.is_empty() {
            self.queue.clear();
        }
        Some(batch)
    }

    /// Drop `key` from the pending set; its queue entry is skipped later.
    pub(crate) fn remove_pending(&mut self, key: &K) {
        self.pending_set.remove(key);
    }

    /// Resolve `key`, waking its waiters.
    pub fn resolve(&mut self, key: K, value: V) {
        self.get(key).handle_result(value);
    }

    /// Resolve every key that a batch round asked for but got no row for.
    pub fn resolve_missing<'a>(&mut self, keys: impl IntoIterator<Item = &'a K>, missing: &V)
    where
        K: 'a,
    {
        for key in keys {
            if let Some(state) = self.cache.get_mut(key) {
                state.handle_result(missing.clone());
            }
        }
    }

    /// Fail every key of a batch round; they return to INITIAL.
    pub fn resolve_error(&mut self, keys: &[K], err: &Error) {
        for key in keys {
            if let Some(state) = self.cache.get_mut(key) {
                state.handle_error(err);
            }
        }
    }

    /// Register a request for `key`.
    pub(crate) fn request(&mut self, key: K) -> Request<V> {
        let state = self.get(key.clone());
        match state.phase() {
            LoadPhase::Loaded => Request::Cached(state.value().clone()),
            LoadPhase::Loading => {
                let (waiter, pending) = Pending::channel();
                state.add_receiver(waiter);
                Request::Joined(pending)
            }
            LoadPhase::Initial => {
                let (waiter, pending) = Pending::channel();
                state.start_loading(waiter);
                self.add_key_to_load(key);
                Request::Started(pending)
            }
        }
    }

    /// Drop every slot and pending key.
    ///
    /// Waiters of slots still LOADING are not woken here; one notification
    /// per slot is appended to `deferred` instead, to be run once every
    /// index involved in the flush has been emptied.
    pub fn flush(&mut self, deferred: &mut FlushNotifications) {
        self.generation += 1;
        self.queue.clear();
        self.pending_set.clear();
        let name = self.name;
        for (_, mut state) in mem::take(&mut self.cache) {
            if state.phase() != LoadPhase::Loading {
                continue;
            }
            let waiters = state.take_waiters();
            if waiters.is_empty() {
                continue;
            }
            deferred.push(name, move || {
                for waiter in waiters {
                    if waiter.send(Err(Error::Flushed { index: name })).is_err() {
                        tracing::trace!(index = name, "flushed waiter already gone");
                    }
                }
            });
        }
    }
}

impl<K, V> fmt::Debug for KeyedIndex<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedIndex")
            .field("name", &self.name)
            .field("slots", &self.cache.len())
            .field("pending", &self.pending_set.len())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Cache of one table's entities by primary key.
///
/// A key with no row resolves to `None`.
pub struct EntityIndex<T: Table> {
    keys: KeyedIndex<T::Key, Option<Arc<T>>>,
}

impl<T: Table> EntityIndex<T> {
    pub fn new() -> Self {
        Self {
            keys: KeyedIndex::new(T::TABLE_NAME),
        }
    }

    pub fn keys(&self) -> &KeyedIndex<T::Key, Option<Arc<T>>> {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyedIndex<T::Key, Option<Arc<T>>> {
        &mut self.keys
    }

    /// Take ownership of a freshly decoded row.
    ///
    /// Returns the instance the cache holds for its key afterwards: an
    /// already loaded entity wins over the new row, so each key maps to
    /// one shared instance for the lifetime of the index. A slot that is
    /// still pending is resolved by the row and leaves the pending set.
    pub fn row_loaded(&mut self, entity: T) -> Arc<T> {
        self.insert(entity, false)
    }

    /// Like [`row_loaded`](Self::row_loaded), but the new row replaces an
    /// already loaded instance. Used for rows read under a lock, which are
    /// newer than anything cached.
    pub fn row_refreshed(&mut self, entity: T) -> Arc<T> {
        self.insert(entity, true)
    }

    fn insert(&mut self, entity: T, refresh: bool) -> Arc<T> {
        let key = entity.key();
        let state = self.keys.get(key.clone());
        if state.is_loaded() {
            if let (Some(existing), false) = (state.value(), refresh) {
                return Arc::clone(existing);
            }
            let fresh = Arc::new(entity);
            state.replace_result(Some(Arc::clone(&fresh)));
            return fresh;
        }
        let fresh = Arc::new(entity);
        state.handle_result(Some(Arc::clone(&fresh)));
        self.keys.remove_pending(&key);
        fresh
    }
}

impl<T: Table> Default for EntityIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache of one table's entities by a [`UniqueKey`].
///
/// Filled by its own batch rounds and by every row loaded into the
/// table's [`EntityIndex`].
pub struct UniqueIndex<U: UniqueKey> {
    keys: KeyedIndex<U::Key, Option<Arc<U::Table>>>,
    _key: PhantomData<fn() -> U>,
}

impl<U: UniqueKey> UniqueIndex<U> {
    pub fn new() -> Self {
        Self {
            keys: KeyedIndex::new(U::NAME),
            _key: PhantomData,
        }
    }

    pub fn keys(&self) -> &KeyedIndex<U::Key, Option<Arc<U::Table>>> {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyedIndex<U::Key, Option<Arc<U::Table>>> {
        &mut self.keys
    }

    /// Enter an instance the entity index handed out.
    pub fn entity_loaded(&mut self, entity: &Arc<U::Table>, refresh: bool) {
        let key = U::unique_key(entity);
        let state = self.keys.get(key.clone());
        if state.is_loaded() {
            if refresh || state.value().is_none() {
                state.replace_result(Some(Arc::clone(entity)));
            }
            return;
        }
        state.handle_result(Some(Arc::clone(entity)));
        self.keys.remove_pending(&key);
    }
}

impl<U: UniqueKey> Default for UniqueIndex<U> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache of a to-many relation: source key to matching target rows.
///
/// A source key with no rows resolves to an empty vector.
pub struct RelationIndex<R: Relation> {
    keys: KeyedIndex<R::SourceKey, Vec<Arc<R::Target>>>,
    _relation: PhantomData<fn() -> R>,
}

impl<R: Relation> RelationIndex<R> {
    pub fn new() -> Self {
        Self {
            keys: KeyedIndex::new(R::NAME),
            _relation: PhantomData,
        }
    }

    pub fn keys(&self) -> &KeyedIndex<R::SourceKey, Vec<Arc<R::Target>>> {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyedIndex<R::SourceKey, Vec<Arc<R::Target>>> {
        &mut self.keys
    }
}

impl<R: Relation> Default for RelationIndex<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache in front of a caller-defined [`BatchLoader`].
pub struct BatchIndex<L, C>
where
    L: BatchLoader<C>,
    C: Connection,
{
    loader: Arc<L>,
    keys: KeyedIndex<L::Key, L::Value>,
    _conn: PhantomData<fn() -> C>,
}

impl<L, C> BatchIndex<L, C>
where
    L: BatchLoader<C>,
    C: Connection,
{
    pub fn new(loader: Arc<L>) -> Self {
        Self {
            loader,
            keys: KeyedIndex::new(L::NAME),
            _conn: PhantomData,
        }
    }

    pub fn loader(&self) -> &Arc<L> {
        &self.loader
    }

    pub fn keys(&self) -> &KeyedIndex<L::Key, L::Value> {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyedIndex<L::Key, L::Value> {
        &mut self.keys
    }
}

/// Waiter notifications collected while flushing.
///
/// [`dispatch`](Self::dispatch) runs them in collection order; a panic in
/// one is caught and logged and the rest still run.
#[derive(Default)]
pub struct FlushNotifications {
    entries: Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
}

impl FlushNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: &'static str, notify: impl FnOnce() + Send + 'static) {
        self.entries.push((index, Box::new(notify)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every notification. Returns how many panicked.
    pub fn dispatch(self) -> usize {
        let mut failed = 0;
        for (index, notify) in self.entries {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(notify)) {
                failed += 1;
                tracing::error!(
                    index,
                    panic = panic_message(&*payload),
                    "flush notification panicked"
                );
            }
        }
        failed
    }
}

impl fmt::Debug for FlushNotifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushNotifications")
            .field("len", &self.entries.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}
