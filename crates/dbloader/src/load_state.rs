//! Lifecycle of a single cache slot.
//!
//! ```text
//! INITIAL --start_loading--> LOADING --handle_result--> LOADED
//!    ^                          |
//!    +-------handle_error-------+
//! ```
//!
//! A slot never leaves LOADED. Invalidation throws the whole slot away
//! instead (see [`KeyedIndex::flush`](crate::index::KeyedIndex::flush)).

use dbloader_core::{Error, Outcome, Result};
use futures::channel::oneshot;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

/// The sending half of a suspended request.
pub type Waiter<V> = oneshot::Sender<Result<V>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    /// Nothing known, nobody waiting.
    Initial,
    /// A fetch is pending or in flight.
    Loading,
    /// Value fixed.
    Loaded,
}

/// One cache slot: its phase, its value once loaded, and the requests
/// suspended on it.
pub struct LoadState<V> {
    phase: LoadPhase,
    value: Option<V>,
    waiters: Vec<Waiter<V>>,
}

impl<V: Clone> LoadState<V> {
    pub fn new() -> Self {
        Self {
            phase: LoadPhase::Initial,
            value: None,
            waiters: Vec::new(),
        }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    pub fn is_loaded(&self) -> bool {
        self.phase == LoadPhase::Loaded
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Begin loading with `waiter` as the first requester.
    ///
    /// # Panics
    ///
    /// Panics unless the slot is INITIAL.
    pub fn start_loading(&mut self, waiter: Waiter<V>) {
        assert!(
            self.phase == LoadPhase::Initial,
            "start_loading called on a slot in {:?} state",
            self.phase
        );
        self.phase = LoadPhase::Loading;
        self.waiters.push(waiter);
    }

    /// Attach another requester to an in-progress load.
    ///
    /// # Panics
    ///
    /// Panics unless the slot is LOADING.
    pub fn add_receiver(&mut self, waiter: Waiter<V>) {
        assert!(
            self.phase == LoadPhase::Loading,
            "add_receiver called on a slot in {:?} state",
            self.phase
        );
        self.waiters.push(waiter);
    }

    /// Fix the value and resume every waiter with it, oldest first.
    ///
    /// A slot that is already LOADED keeps its value.
    pub fn handle_result(&mut self, value: V) {
        if self.phase == LoadPhase::Loaded {
            return;
        }
        self.phase = LoadPhase::Loaded;
        for waiter in mem::take(&mut self.waiters) {
            if waiter.send(Ok(value.clone())).is_err() {
                tracing::trace!("waiter dropped before its result arrived");
            }
        }
        self.value = Some(value);
    }

    /// Return to INITIAL and resume every waiter with `err`.
    ///
    /// Only meaningful while LOADING; otherwise a no-op.
    pub fn handle_error(&mut self, err: &Error) {
        if self.phase != LoadPhase::Loading {
            return;
        }
        self.phase = LoadPhase::Initial;
        for waiter in mem::take(&mut self.waiters) {
            if waiter.send(Err(err.clone())).is_err() {
                tracing::trace!("waiter dropped before its error arrived");
            }
        }
    }

    /// The resolved value.
    ///
    /// # Panics
    ///
    /// Panics unless the slot is LOADED.
    pub fn value(&self) -> &V {
        match (&self.value, self.phase) {
            (Some(value), LoadPhase::Loaded) => value,
            (_, phase) => panic!("value read from a slot in {phase:?} state"),
        }
    }

    /// Overwrite the value of a LOADED slot.
    pub(crate) fn replace_result(&mut self, value: V) {
        debug_assert!(self.phase == LoadPhase::Loaded);
        self.value = Some(value);
    }

    /// Detach the waiters of a slot that is being discarded.
    pub(crate) fn take_waiters(&mut self) -> Vec<Waiter<V>> {
        mem::take(&mut self.waiters)
    }
}

impl<V: Clone> Default for LoadState<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for LoadState<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadState")
            .field("phase", &self.phase)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

enum PendingInner<V> {
    Ready(Option<Result<V>>),
    Waiting(oneshot::Receiver<Result<V>>),
}

/// A request handed back by the loader.
///
/// Resolves to the slot's value, or to the error of the batch round or
/// explicit operation that served it. Dropping it abandons the request
/// without affecting other waiters.
#[must_use = "a Pending does nothing unless awaited"]
pub struct Pending<V> {
    inner: PendingInner<V>,
}

impl<V> Pending<V> {
    pub(crate) fn channel() -> (Waiter<V>, Self) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            inner: PendingInner::Waiting(rx),
        };
        (tx, pending)
    }

    pub(crate) fn ready(value: V) -> Self {
        Self {
            inner: PendingInner::Ready(Some(Ok(value))),
        }
    }

    /// True when the value was already cached at request time.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, PendingInner::Ready(_))
    }
}

impl<V> Unpin for Pending<V> {}

impl<V> Future for Pending<V> {
    type Output = Outcome<V, Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.inner {
            PendingInner::Ready(slot) => match slot.take() {
                Some(result) => result,
                None => panic!("Pending polled after completion"),
            },
            PendingInner::Waiting(rx) => match Pin::new(rx).poll(task_cx) {
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(oneshot::Canceled)) => Err(Error::Cancelled),
                Poll::Pending => return Poll::Pending,
            },
        };
        Poll::Ready(match result {
            Ok(value) => Outcome::Ok(value),
            Err(err) => Outcome::Err(err),
        })
    }
}

impl<V> fmt::Debug for Pending<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("ready", &self.is_ready())
            .finish()
    }
}
