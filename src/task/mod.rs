//! Dependency-counted task graphs.
//!
//! A [`Task`] starts with a predecessor count of 1, the unit consumed by
//! [`TaskQueue::schedule`]. Every `link_to` edge and every external readiness
//! signal (an expert matrix still loading) adds one more unit. The task is
//! pushed to its queue's ready list when the count falls to exactly zero, so
//! it runs once, after all predecessors finished and all its inputs arrived.
//!
//! Lifecycle: `new` -> `link_to` (registered) -> `schedule` (pending) ->
//! count reaches 0 (ready) -> a worker runs it and calls `on_finish`
//! (successors notified, queue counter decremented).

pub mod barrier;
pub mod queue;
pub mod runner;

pub use barrier::SpinBarrier;
pub use queue::TaskQueue;
pub use runner::{PoisonOnUnwind, TaskRunner, Worker, WorkerContext};

use parking_lot::Mutex;
use queue::QueueShared;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Something that can be held back by an external signal and released later.
///
/// The expert cache stores pending `Arc<dyn Dependent>` handles on loading
/// matrices without knowing what the tasks compute.
pub trait Dependent: Send + Sync {
    /// Add one outstanding signal. Must happen before the dependent is scheduled.
    fn hold(&self);

    /// Deliver one outstanding signal.
    fn release(self: Arc<Self>);
}

pub struct Task<T> {
    n_prev: AtomicUsize,
    next: Mutex<Vec<Arc<Task<T>>>>,
    queue: OnceLock<Arc<QueueShared<T>>>,
    finished: AtomicBool,
    body: T,
}

impl<T: Send + Sync + 'static> Task<T> {
    pub fn new(body: T) -> Arc<Self> {
        Arc::new(Task {
            n_prev: AtomicUsize::new(1),
            next: Mutex::new(Vec::new()),
            queue: OnceLock::new(),
            finished: AtomicBool::new(false),
            body,
        })
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn is_scheduled(&self) -> bool {
        self.queue.get().is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Outstanding predecessors, including the scheduling unit if not yet scheduled.
    pub fn n_prev(&self) -> usize {
        self.n_prev.load(Ordering::Acquire)
    }

    pub fn add_prev_count(&self, count: usize) {
        self.n_prev.fetch_add(count, Ordering::AcqRel);
    }

    /// Make `next` wait for this task.
    pub fn link_to(&self, next: &Arc<Task<T>>) {
        assert!(
            !next.is_scheduled(),
            "link_to: successor is already scheduled",
        );
        next.add_prev_count(1);
        self.next.lock().push(Arc::clone(next));
    }

    pub fn on_prev_task_finished(self: &Arc<Self>) {
        let n = self.n_prev.fetch_sub(1, Ordering::AcqRel);
        assert!(n > 0, "task predecessor count underflow");
        if n == 1 {
            self.on_launch();
        }
    }

    fn on_launch(self: &Arc<Self>) {
        let Some(queue) = self.queue.get() else {
            panic!("task became ready before it was scheduled");
        };
        queue.push(Arc::clone(self));
    }

    /// Called by the worker after running the body.
    pub fn on_finish(&self) {
        assert!(
            !self.finished.swap(true, Ordering::AcqRel),
            "task finished twice",
        );
        let next = std::mem::take(&mut *self.next.lock());
        for task in &next {
            task.on_prev_task_finished();
        }
        let Some(queue) = self.queue.get() else {
            panic!("finished a task that was never scheduled");
        };
        queue.task_finished();
    }
}

impl<T: Send + Sync + 'static> Dependent for Task<T> {
    fn hold(&self) {
        self.add_prev_count(1);
    }

    fn release(self: Arc<Self>) {
        self.on_prev_task_finished();
    }
}
