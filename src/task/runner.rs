//! Cooperative drain loop shared by a fixed pool of threads.

use super::queue::Drain;
use crate::config::IdleStrategy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    pub thread_id: usize,
    pub n_threads: usize,
}

/// Unit of execution bound to one or more threads.
pub trait Worker: Send + Sync {
    /// Run at most one ready task. Returns whether a task ran.
    fn run_tasks(&self, ctx: &WorkerContext) -> bool;
}

struct WorkerSlot {
    worker: Box<dyn Worker>,
    run_lock: Mutex<()>,
}

/// Maps thread ids to workers and drives them until every registered queue drains.
pub struct TaskRunner {
    queues: Vec<Arc<dyn Drain>>,
    worker_map: Vec<Vec<WorkerSlot>>,
    idle: IdleStrategy,
    /// Set once a thread unwinds out of a drain; the queues can never empty after that.
    poisoned: AtomicBool,
}

/// Poisons its runner if the owning thread unwinds while the guard is alive.
pub struct PoisonOnUnwind<'a> {
    runner: &'a TaskRunner,
}

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.runner.poison();
        }
    }
}

impl TaskRunner {
    pub fn new(n_threads: usize, idle: IdleStrategy) -> Self {
        assert!(n_threads > 0);
        TaskRunner {
            queues: Vec::new(),
            worker_map: (0..n_threads).map(|_| Vec::new()).collect(),
            idle,
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn n_threads(&self) -> usize {
        self.worker_map.len()
    }

    pub fn register_task_queue(&mut self, queue: Arc<dyn Drain>) {
        self.queues.push(queue);
    }

    pub fn register_worker(&mut self, worker: Box<dyn Worker>, thread_id: usize) {
        assert!(
            thread_id < self.worker_map.len(),
            "thread id {thread_id} out of range ({} threads)",
            self.worker_map.len(),
        );
        self.worker_map[thread_id].push(WorkerSlot { worker, run_lock: Mutex::new(()) });
    }

    pub fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            log::error!("task runner poisoned: a worker thread panicked");
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Guard for a thread taking part in a drain. See [`PoisonOnUnwind`].
    pub fn poison_on_unwind(&self) -> PoisonOnUnwind<'_> {
        PoisonOnUnwind { runner: self }
    }

    fn has_unfinished(&self) -> bool {
        self.queues.iter().any(|q| q.n_unfinished() > 0)
    }

    /// Loop on the calling thread until no registered queue has unfinished tasks.
    ///
    /// Busy workers are skipped rather than waited for. Panics if another
    /// thread poisoned the runner, since its unfinished tasks never complete.
    pub fn run(&self, thread_id: usize) {
        assert!(!self.queues.is_empty(), "no task queue registered");
        let ctx = WorkerContext { thread_id, n_threads: self.n_threads() };
        let slots = &self.worker_map[thread_id];
        let _guard = self.poison_on_unwind();

        while self.has_unfinished() {
            assert!(
                !self.is_poisoned(),
                "thread {thread_id}: task runner poisoned by a panic on another worker",
            );
            let mut ran = false;
            for slot in slots {
                let Some(_running) = slot.run_lock.try_lock() else {
                    continue;
                };
                ran |= slot.worker.run_tasks(&ctx);
            }
            if !ran {
                self.idle.idle();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A queue that never drains.
    struct Endless;

    impl Drain for Endless {
        fn n_unfinished(&self) -> usize {
            1
        }
    }

    /// Thread 0 fails on its first task; the other threads find nothing to do.
    struct FailOnThreadZero;

    impl Worker for FailOnThreadZero {
        fn run_tasks(&self, ctx: &WorkerContext) -> bool {
            if ctx.thread_id == 0 {
                panic!("task body failed");
            }
            false
        }
    }

    #[test]
    fn test_panicking_worker_stops_the_others() {
        let mut runner = TaskRunner::new(3, IdleStrategy::Yield);
        runner.register_task_queue(Arc::new(Endless));
        for t in 0..3 {
            runner.register_worker(Box::new(FailOnThreadZero), t);
        }

        let failed: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|t| {
                    let runner = &runner;
                    s.spawn(move || runner.run(t))
                })
                .collect();
            handles.into_iter().map(|h| h.join().is_err()).collect()
        });
        assert_eq!(failed, vec![true, true, true]);
        assert!(runner.is_poisoned());
    }

    #[test]
    fn test_fresh_runner_is_not_poisoned() {
        let runner = TaskRunner::new(1, IdleStrategy::Spin);
        {
            let _guard = runner.poison_on_unwind();
        }
        assert!(!runner.is_poisoned());
    }
}
