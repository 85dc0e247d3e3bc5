//! Block I/O for the expert cache.
//!
//! The cache drives reads through the [`IoRing`] contract: requests are
//! queued with `enqueue_read`, pushed to the device by `submit_and_wait`, and
//! their completion callbacks run synchronously inside `reap`. A single
//! thread (the cache's I/O worker) owns the ring.
//!
//! [`SyncRing`] is the portable backend: each submitted request is served by
//! a positional read, so by the time `submit_and_wait` returns every
//! submitted request is complete. It comes in two flavours, [`FileRing`]
//! (pread, optionally O_DIRECT) and [`MmapRing`] (memcpy out of a mapping).

pub mod buffer;
pub mod ring;

pub use buffer::AlignedBuf;
pub use ring::{open_file_ring, open_mmap_ring, FileRing, MmapRing, ReadAt, SyncRing};

/// Completion callback, run exactly once from `reap`.
pub type Completion = Box<dyn FnOnce() + Send>;

/// Raw destination of a read.
#[derive(Debug, Clone, Copy)]
pub struct BufPtr(*mut u8);

// SAFETY: the pointee is an AlignedBuf kept alive by the cache entry that
// issued the read; only the I/O worker writes through it.
unsafe impl Send for BufPtr {}

impl BufPtr {
    /// # Safety
    /// `ptr` must stay valid for writes of the request length until the
    /// request's completion has run.
    pub unsafe fn new(ptr: *mut u8) -> Self {
        BufPtr(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }
}

/// One read of `len` bytes at `offset` into `buf`.
pub struct ReadRequest {
    pub buf: BufPtr,
    pub offset: u64,
    pub len: usize,
    pub on_complete: Completion,
}

pub trait IoRing: Send {
    /// Maximum number of requests in flight.
    fn queue_depth(&self) -> usize;

    /// Requests enqueued but not yet reaped.
    fn n_inflight(&self) -> usize;

    /// Queue a read. Panics if the ring is already at `queue_depth`.
    fn enqueue_read(&mut self, req: ReadRequest);

    /// Submit everything queued and block until at least `wait_nr` requests completed.
    fn submit_and_wait(&mut self, wait_nr: usize);

    /// Run callbacks for all completed requests. Returns how many were processed.
    fn reap(&mut self) -> usize;
}
