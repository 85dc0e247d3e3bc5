//! Reusable spinning barrier.

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};

/// All `width` threads must call [`wait`](SpinBarrier::wait) before any
/// returns. Everything a thread wrote before `wait` is visible to every
/// thread after it. The barrier can be reused immediately.
#[derive(Debug)]
pub struct SpinBarrier {
    width: usize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
}

impl SpinBarrier {
    pub fn new(width: usize) -> Self {
        assert!(width > 0, "barrier width must be > 0");
        SpinBarrier {
            width,
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn wait(&self) {
        let passed = self.wait_unless(|| false);
        debug_assert!(passed);
    }

    /// Like [`wait`](SpinBarrier::wait), but stops waiting and returns false
    /// once `abort` returns true. A barrier left this way is unusable: the
    /// aborting thread's arrival is never taken back.
    pub fn wait_unless(&self, abort: impl Fn() -> bool) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.width {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        let backoff = Backoff::new();
        while self.generation.load(Ordering::Acquire) == generation {
            if abort() {
                return false;
            }
            backoff.snooze();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_barrier_phases() {
        let n = 4;
        let rounds = 50;
        let barrier = SpinBarrier::new(n);
        let counter = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..n {
                s.spawn(|| {
                    for round in 0..rounds {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait();
                        // Every thread has incremented for this round.
                        assert!(counter.load(Ordering::SeqCst) >= (round + 1) * n);
                        barrier.wait();
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), n * rounds);
    }

    #[test]
    fn test_single_thread_never_blocks() {
        let barrier = SpinBarrier::new(1);
        for _ in 0..3 {
            barrier.wait();
        }
    }

    #[test]
    fn test_wait_unless_gives_up_on_abort() {
        let barrier = SpinBarrier::new(2);
        let stop = std::sync::atomic::AtomicBool::new(false);
        let passed = std::thread::scope(|s| {
            let waiter = s.spawn(|| barrier.wait_unless(|| stop.load(Ordering::Acquire)));
            std::thread::sleep(std::time::Duration::from_millis(20));
            stop.store(true, Ordering::Release);
            waiter.join().unwrap()
        });
        assert!(!passed);
    }
}
