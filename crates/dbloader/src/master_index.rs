//! Registry of every index a loader owns.
//!
//! Indices are created on first use and live as long as the loader. Each
//! registered index sits in a tagged slot (entity, unique key, relation,
//! batch loader); the tag decides when the dispatch loop looks at it, the
//! index itself decides which writes invalidate it.
//!
//! Rows enter the cache through [`MasterIndex::row_loaded`], which hands
//! the resulting instance on to every unique-key index of its table.

use crate::batch::BatchRound;
use crate::index::{BatchIndex, EntityIndex, FlushNotifications, RelationIndex, UniqueIndex};
use crate::schema::{BatchLoader, Relation, Table, TableId, UniqueKey};
use dbloader_core::{Connection, Dialect};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Operations the registry and dispatch loop need from any index.
pub(crate) trait ErasedIndex<C: Connection>: Send {
    fn name(&self) -> &'static str;

    fn has_pending(&self) -> bool;

    /// Take pending keys and prepare the round that will fetch them.
    fn begin_round(
        &mut self,
        dialect: Dialect,
        limit: Option<usize>,
    ) -> Option<Box<dyn BatchRound<C>>>;

    fn flush(&mut self, deferred: &mut FlushNotifications);

    /// Whether a write to `table` invalidates this index.
    fn touches(&self, table: TableId) -> bool;

    /// Offer an entity instance (an `Arc<T>`) just entered into the entity
    /// index of its table.
    fn entity_loaded(&mut self, entity: &dyn Any, refresh: bool) {
        let _ = (entity, refresh);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexKind {
    Entity,
    Unique,
    Relation,
    Batch,
}

/// Dispatch order of index kinds.
const ROUND_PRIORITY: [IndexKind; 4] = [
    IndexKind::Relation,
    IndexKind::Batch,
    IndexKind::Unique,
    IndexKind::Entity,
];

enum IndexSlot<C: Connection> {
    Entity(Box<dyn ErasedIndex<C>>),
    Unique(Box<dyn ErasedIndex<C>>),
    Relation(Box<dyn ErasedIndex<C>>),
    Batch(Box<dyn ErasedIndex<C>>),
}

impl<C: Connection> IndexSlot<C> {
    fn kind(&self) -> IndexKind {
        match self {
            IndexSlot::Entity(_) => IndexKind::Entity,
            IndexSlot::Unique(_) => IndexKind::Unique,
            IndexSlot::Relation(_) => IndexKind::Relation,
            IndexSlot::Batch(_) => IndexKind::Batch,
        }
    }

    fn index(&self) -> &dyn ErasedIndex<C> {
        match self {
            IndexSlot::Entity(index)
            | IndexSlot::Unique(index)
            | IndexSlot::Relation(index)
            | IndexSlot::Batch(index) => index.as_ref(),
        }
    }

    fn index_mut(&mut self) -> &mut dyn ErasedIndex<C> {
        match self {
            IndexSlot::Entity(index)
            | IndexSlot::Unique(index)
            | IndexSlot::Relation(index)
            | IndexSlot::Batch(index) => index.as_mut(),
        }
    }
}

/// Owner of one loader's entity, unique-key, relation and batch-loader
/// indices.
pub struct MasterIndex<C: Connection> {
    slots: Vec<IndexSlot<C>>,
    positions: HashMap<TypeId, usize>,
    /// Unique-key index positions by table type.
    unique_keys: HashMap<TypeId, Vec<usize>>,
}

impl<C: Connection + 'static> MasterIndex<C> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            positions: HashMap::new(),
            unique_keys: HashMap::new(),
        }
    }

    /// Number of registered indices.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The entity index for `T`, registered on first use.
    pub fn entity_index<T: Table>(&mut self) -> &mut EntityIndex<T> {
        let pos = self.position_of::<EntityIndex<T>>(|| {
            IndexSlot::Entity(Box::new(EntityIndex::<T>::new()))
        });
        self.downcast(pos)
    }

    /// The index of unique key `U`, registered on first use.
    pub fn unique_index<U: UniqueKey>(&mut self) -> &mut UniqueIndex<U> {
        let id = TypeId::of::<UniqueIndex<U>>();
        let pos = match self.positions.get(&id) {
            Some(&pos) => pos,
            None => {
                let pos = self.position_of::<UniqueIndex<U>>(|| {
                    IndexSlot::Unique(Box::new(UniqueIndex::<U>::new()))
                });
                self.unique_keys
                    .entry(TypeId::of::<U::Table>())
                    .or_default()
                    .push(pos);
                pos
            }
        };
        self.downcast(pos)
    }

    /// Enter a decoded row into `T`'s cache and every unique-key index of
    /// `T`; see [`EntityIndex::row_loaded`].
    pub fn row_loaded<T: Table>(&mut self, entity: T) -> Arc<T> {
        let entity = self.entity_index::<T>().row_loaded(entity);
        self.fan_out(&entity, false);
        entity
    }

    /// Like [`row_loaded`](Self::row_loaded), replacing cached instances.
    pub fn row_refreshed<T: Table>(&mut self, entity: T) -> Arc<T> {
        let entity = self.entity_index::<T>().row_refreshed(entity);
        self.fan_out(&entity, true);
        entity
    }

    fn fan_out<T: Table>(&mut self, entity: &Arc<T>, refresh: bool) {
        let Some(positions) = self.unique_keys.get(&TypeId::of::<T>()) else {
            return;
        };
        for &pos in positions {
            self.slots[pos].index_mut().entity_loaded(entity, refresh);
        }
    }

    /// The relation index for `R`, registered on first use.
    pub fn relation_index<R: Relation>(&mut self) -> &mut RelationIndex<R> {
        let pos = self.position_of::<RelationIndex<R>>(|| {
            IndexSlot::Relation(Box::new(RelationIndex::<R>::new()))
        });
        self.downcast(pos)
    }

    /// The index in front of loader type `L`.
    ///
    /// The first instance registered for a loader type serves every later
    /// request for that type.
    pub fn batch_index<L: BatchLoader<C>>(&mut self, loader: &Arc<L>) -> &mut BatchIndex<L, C> {
        let pos = self.position_of::<BatchIndex<L, C>>(|| {
            IndexSlot::Batch(Box::new(BatchIndex::<L, C>::new(Arc::clone(loader))))
        });
        self.downcast(pos)
    }

    /// The index for loader type `L`, if one was registered.
    pub fn existing_batch_index<L: BatchLoader<C>>(&mut self) -> Option<&mut BatchIndex<L, C>> {
        let pos = *self.positions.get(&TypeId::of::<BatchIndex<L, C>>())?;
        Some(self.downcast(pos))
    }

    fn position_of<I: 'static>(&mut self, create: impl FnOnce() -> IndexSlot<C>) -> usize {
        let id = TypeId::of::<I>();
        if let Some(&pos) = self.positions.get(&id) {
            return pos;
        }
        let slot = create();
        tracing::trace!(
            index = slot.index().name(),
            kind = ?slot.kind(),
            "registered index"
        );
        self.slots.push(slot);
        let pos = self.slots.len() - 1;
        self.positions.insert(id, pos);
        pos
    }

    fn downcast<I: 'static>(&mut self, pos: usize) -> &mut I {
        match self.slots[pos].index_mut().as_any_mut().downcast_mut::<I>() {
            Some(index) => index,
            None => unreachable!("index registry slot {pos} holds a different index type"),
        }
    }

    /// Whether any index has keys waiting for a batch round.
    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(|slot| slot.index().has_pending())
    }

    /// Prepare the next batch round, if any index has pending keys.
    ///
    /// Relations go first, then batch loaders, then unique keys, then entity
    /// tables; within a kind, indices are tried in registration order.
    pub(crate) fn next_round(
        &mut self,
        dialect: Dialect,
        limit: Option<usize>,
    ) -> Option<Box<dyn BatchRound<C>>> {
        for kind in ROUND_PRIORITY {
            for slot in &mut self.slots {
                if slot.kind() != kind || !slot.index().has_pending() {
                    continue;
                }
                if let Some(round) = slot.index_mut().begin_round(dialect, limit) {
                    return Some(round);
                }
            }
        }
        None
    }

    /// Empty every index.
    ///
    /// Returns the notifications for waiters that were still loading; run
    /// them only after this returns, so a woken waiter never sees an index
    /// that has not been emptied yet.
    #[must_use = "waiters are only told about the flush when the notifications are dispatched"]
    pub fn flush_all(&mut self) -> FlushNotifications {
        let mut deferred = FlushNotifications::new();
        for slot in &mut self.slots {
            slot.index_mut().flush(&mut deferred);
        }
        tracing::debug!(
            indices = self.slots.len(),
            notifications = deferred.len(),
            "flushed all caches"
        );
        deferred
    }

    /// Empty the indices a write to `table` may have made stale.
    ///
    /// That is `table`'s own entity and unique-key indices, every relation
    /// whose source or target is `table`, and every batch loader that
    /// reports itself related. Same deferred notification contract as
    /// [`flush_all`](Self::flush_all).
    #[must_use = "waiters are only told about the flush when the notifications are dispatched"]
    pub fn flush_related(&mut self, table: TableId) -> FlushNotifications {
        let mut deferred = FlushNotifications::new();
        let mut flushed = 0;
        for slot in &mut self.slots {
            if slot.index().touches(table) {
                slot.index_mut().flush(&mut deferred);
                flushed += 1;
            }
        }
        tracing::debug!(
            table = table.name(),
            indices = flushed,
            notifications = deferred.len(),
            "flushed caches related to table"
        );
        deferred
    }
}

impl<C: Connection + 'static> Default for MasterIndex<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> fmt::Debug for MasterIndex<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self
            .slots
            .iter()
            .map(|slot| (slot.kind(), slot.index().name()))
            .collect();
        f.debug_struct("MasterIndex").field("indices", &names).finish()
    }
}
