//! Deferred execution of the loader's dispatch loop.
//!
//! A [`Scheduler`] runs a task once, after the caller that scheduled it has
//! returned. The loader never awaits its own dispatch loop inline; request
//! methods register their keys synchronously and hand the loop to the
//! scheduler, so every request issued before the scheduler gets around to
//! running lands in the same batch.
//!
//! - [`ManualScheduler`] queues tasks until [`ManualScheduler::run_pending`]
//!   drains them. Deterministic; used by tests and by callers that drive
//!   the loader from a single task.
//! - [`SpawnScheduler`] forwards tasks to any spawn function, e.g. a
//!   runtime's `spawn`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// A unit of deferred work.
pub type ScheduledTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Arranges for a task to run "soon".
///
/// Implementations must not poll the task from within `schedule` itself:
/// the loader calls `schedule` while registering requests, and the task
/// it passes expects those registrations to have completed.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: ScheduledTask);
}

/// A scheduler whose queue is drained explicitly.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    queue: Arc<Mutex<VecDeque<ScheduledTask>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run queued tasks, one at a time, until the queue is empty.
    ///
    /// Tasks scheduled while draining are run too. Returns how many tasks
    /// were run.
    pub async fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(task) = next else {
                break;
            };
            task.await;
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: ScheduledTask) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// A scheduler backed by a spawn function.
pub struct SpawnScheduler<F> {
    spawn: F,
}

impl<F> SpawnScheduler<F>
where
    F: Fn(ScheduledTask) + Send + Sync,
{
    pub fn new(spawn: F) -> Self {
        Self { spawn }
    }
}

impl<F> Scheduler for SpawnScheduler<F>
where
    F: Fn(ScheduledTask) + Send + Sync,
{
    fn schedule(&self, task: ScheduledTask) {
        (self.spawn)(task);
    }
}

impl<F> fmt::Debug for SpawnScheduler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnScheduler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn manual_scheduler_defers_until_drained() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        scheduler.schedule(Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(scheduler.pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        rt.block_on(async {
            assert_eq!(scheduler.run_pending().await, 1);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn tasks_scheduled_while_draining_also_run() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_scheduler = scheduler.clone();
        let outer_order = Arc::clone(&order);
        scheduler.schedule(Box::pin(async move {
            outer_order.lock().expect("lock poisoned").push("outer");
            let inner_order = Arc::clone(&outer_order);
            inner_scheduler.schedule(Box::pin(async move {
                inner_order.lock().expect("lock poisoned").push("inner");
            }));
        }));

        rt.block_on(async {
            assert_eq!(scheduler.run_pending().await, 2);
        });
        assert_eq!(*order.lock().expect("lock poisoned"), vec!["outer", "inner"]);
    }

    #[test]
    fn spawn_scheduler_forwards_tasks() {
        let sink = ManualScheduler::new();
        let forward = sink.clone();
        let scheduler = SpawnScheduler::new(move |task| forward.schedule(task));

        scheduler.schedule(Box::pin(async {}));
        scheduler.schedule(Box::pin(async {}));
        assert_eq!(sink.pending(), 2);
    }
}
