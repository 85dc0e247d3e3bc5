//! Ready queue with an unfinished-task counter.

use super::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(super) struct QueueShared<T> {
    ready: Mutex<VecDeque<Arc<Task<T>>>>,
    n_unfinished: AtomicUsize,
}

impl<T> QueueShared<T> {
    pub(super) fn push(&self, task: Arc<Task<T>>) {
        self.ready.lock().push_back(task);
    }

    pub(super) fn task_finished(&self) {
        let n = self.n_unfinished.fetch_sub(1, Ordering::AcqRel);
        assert!(n > 0, "task queue unfinished counter underflow");
    }
}

/// Tasks become visible to `pop` only once their predecessor count hits zero.
///
/// Cloning yields another handle to the same queue.
pub struct TaskQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        TaskQueue { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Send + Sync + 'static> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> TaskQueue<T> {
    pub fn new() -> Self {
        TaskQueue {
            shared: Arc::new(QueueShared {
                ready: Mutex::new(VecDeque::new()),
                n_unfinished: AtomicUsize::new(0),
            }),
        }
    }

    /// Attach `task` to this queue and consume its "not yet scheduled" unit.
    /// The task is enqueued right away if nothing else holds it back.
    pub fn schedule(&self, task: &Arc<Task<T>>) {
        let attached = task.queue.set(Arc::clone(&self.shared)).is_ok();
        assert!(attached, "task scheduled twice");
        self.shared.n_unfinished.fetch_add(1, Ordering::AcqRel);
        task.on_prev_task_finished();
    }

    /// Next ready task, if any.
    pub fn pop(&self) -> Option<Arc<Task<T>>> {
        self.shared.ready.lock().pop_front()
    }

    /// Scheduled tasks that have not finished yet (pending, ready or running).
    pub fn n_unfinished(&self) -> usize {
        self.shared.n_unfinished.load(Ordering::Acquire)
    }

    pub fn n_ready(&self) -> usize {
        self.shared.ready.lock().len()
    }
}

/// Type-erased view used by the runner to decide when to stop.
pub trait Drain: Send + Sync {
    fn n_unfinished(&self) -> usize;
}

impl<T: Send + Sync + 'static> Drain for TaskQueue<T> {
    fn n_unfinished(&self) -> usize {
        TaskQueue::n_unfinished(self)
    }
}
