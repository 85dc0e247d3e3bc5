//! Disk-backed LRU cache of expert weight matrices.
//!
//! Every (layer, expert, matrix) of the bundle has a [`Matrix`] entry, built
//! once and never moved. Entries with a buffer are linked in an LRU list whose
//! length is bounded by `max_cached_matrices`. Misses are served by a single
//! background I/O worker that owns the [`IoRing`].
//!
//! Concurrency contract:
//! - A matrix's status, buffer, pending tasks and pins change only under its
//!   own mutex. LRU membership also changes only under that mutex.
//! - The LRU has its own short-lived mutex. Lock order is matrix -> LRU. The
//!   evictor, which holds the LRU lock, only ever `try_lock`s matrices.
//! - Eviction takes the least recently used entry that is `Present`, unpinned
//!   and not locked by anyone else. Entries under I/O are never handed away.
//! - The buffer for a miss is obtained by the requesting thread before the
//!   request reaches the I/O worker, so the worker never evicts and never
//!   waits on a matrix lock other than in completion callbacks.

pub mod lru;
pub mod matrix;

pub use lru::Lru;
pub use matrix::{DataStatus, Matrix, MatrixKind, MatrixState};

use crate::affinity;
use crate::bundle::BundleLayout;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::io::{open_file_ring, open_mmap_ring, AlignedBuf, BufPtr, IoRing, ReadRequest};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

enum IoCommand {
    Read { index: usize, buf: Arc<AlignedBuf> },
    Exit,
}

#[derive(Default)]
struct Counters {
    n_examined: AtomicUsize,
    n_cached: AtomicUsize,
    n_prefetched: AtomicUsize,
    n_evicted: AtomicUsize,
    n_loaded: AtomicUsize,
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Matrices looked up while building task graphs.
    pub n_examined: usize,
    /// Lookups that found the matrix already present.
    pub n_cached: usize,
    /// Speculative fetches issued by prefetch.
    pub n_prefetched: usize,
    /// Resident matrices whose buffer was taken for another entry.
    pub n_evicted: usize,
    /// Completed reads.
    pub n_loaded: usize,
}

impl CacheStats {
    fn pct(part: usize, whole: usize) -> f64 {
        if whole == 0 {
            0.0
        } else {
            100.0 * part as f64 / whole as f64
        }
    }

    pub fn hit_rate(&self) -> f64 {
        Self::pct(self.n_cached, self.n_examined)
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#examined={}, #cached={} ({:.2}%), #prefetched={} ({:.2}%), #loaded={}, #evicted={}",
            self.n_examined,
            self.n_cached,
            self.hit_rate(),
            self.n_prefetched,
            Self::pct(self.n_prefetched, self.n_examined),
            self.n_loaded,
            self.n_evicted,
        )
    }
}

struct CacheInner {
    layout: BundleLayout,
    max_cached: usize,
    matrices: Box<[Matrix]>,
    lru: Mutex<Lru>,
    counters: Counters,
}

impl CacheInner {
    /// Detach the least recently used evictable entry and return its buffer.
    fn evict_one(&self, lru: &mut Lru) -> Option<Arc<AlignedBuf>> {
        let mut cursor = lru.back();
        while let Some(node) = cursor {
            cursor = lru.prev_of(node);
            let victim = &self.matrices[node];
            let Some(mut state) = victim.state.try_lock() else {
                continue;
            };
            if state.status != DataStatus::Present || state.n_pins > 0 {
                continue;
            }
            lru.unlink(node);
            state.status = DataStatus::NotPresent;
            self.counters.n_evicted.fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "evict matrix ({}, {}, {})",
                victim.layer_id,
                victim.expert_id,
                victim.matrix_id,
            );
            return state.data.take();
        }
        None
    }

    /// Read completion: publish the data and release waiting tasks.
    fn complete(&self, index: usize) {
        let matrix = &self.matrices[index];
        let pending = {
            let mut state = matrix.state.lock();
            assert_eq!(
                state.status,
                DataStatus::Loading,
                "completion for matrix ({}, {}, {}) that was not loading",
                matrix.layer_id,
                matrix.expert_id,
                matrix.matrix_id,
            );
            state.status = DataStatus::Present;
            std::mem::take(&mut state.pending)
        };
        self.counters.n_loaded.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "loaded matrix ({}, {}, {}), releasing {} tasks",
            matrix.layer_id,
            matrix.expert_id,
            matrix.matrix_id,
            pending.len(),
        );
        for task in pending {
            task.release();
        }
    }
}

pub struct ExpertCache {
    inner: Arc<CacheInner>,
    requests: Sender<IoCommand>,
    io_worker: Option<JoinHandle<()>>,
}

impl ExpertCache {
    /// Open a bundle with positional reads (O_DIRECT when `cfg.direct_io`).
    pub fn open(bundle_path: &Path, layout: BundleLayout, cfg: &CacheConfig) -> Result<Self> {
        layout.validate()?;
        check_bundle_len(bundle_path, &layout)?;
        let ring = open_file_ring(bundle_path, cfg.io_queue_depth, cfg.direct_io)?;
        Self::with_ring(layout, cfg, Box::new(ring))
    }

    /// Open a bundle through a read-only memory mapping.
    pub fn open_mmap(bundle_path: &Path, layout: BundleLayout, cfg: &CacheConfig) -> Result<Self> {
        layout.validate()?;
        check_bundle_len(bundle_path, &layout)?;
        let ring = open_mmap_ring(bundle_path, cfg.io_queue_depth)?;
        Self::with_ring(layout, cfg, Box::new(ring))
    }

    /// Build the cache over an arbitrary ring and start the I/O worker.
    pub fn with_ring(layout: BundleLayout, cfg: &CacheConfig, ring: Box<dyn IoRing>) -> Result<Self> {
        layout.validate()?;
        cfg.validate()?;
        if ring.queue_depth() > cfg.max_cached_matrices {
            return Err(Error::Config(format!(
                "I/O ring depth {} exceeds the cache capacity {}",
                ring.queue_depth(),
                cfg.max_cached_matrices,
            )));
        }

        let n_records = layout.n_records();
        let mut matrices = Vec::with_capacity(n_records);
        for layer_id in 0..layout.n_layers {
            for expert_id in 0..layout.n_experts {
                for matrix_id in 0..layout.n_matrices {
                    let index = layout.record_index(layer_id, expert_id, matrix_id);
                    debug_assert_eq!(index, matrices.len());
                    matrices.push(Matrix::new(
                        layer_id,
                        expert_id,
                        matrix_id,
                        layout.matrix_offset(layer_id, expert_id, matrix_id),
                        index,
                    ));
                }
            }
        }

        let inner = Arc::new(CacheInner {
            layout,
            max_cached: cfg.max_cached_matrices,
            matrices: matrices.into_boxed_slice(),
            lru: Mutex::new(Lru::new(n_records)),
            counters: Counters::default(),
        });

        let (tx, rx) = channel::unbounded();
        let worker_inner = Arc::clone(&inner);
        let worker_cpu = cfg.io_worker_cpu;
        let io_worker = std::thread::Builder::new()
            .name("expert-cache-io".into())
            .spawn(move || io_worker_main(worker_inner, rx, ring, worker_cpu))?;

        log::info!(
            "Expert cache: {} layers x {} experts x {} matrices of {} KiB, capacity {} matrices ({:.1} MiB), queue depth {}",
            layout.n_layers,
            layout.n_experts,
            layout.n_matrices,
            layout.matrix_bytes / 1024,
            cfg.max_cached_matrices,
            (cfg.max_cached_matrices * layout.matrix_bytes) as f64 / (1024.0 * 1024.0),
            cfg.io_queue_depth,
        );

        Ok(ExpertCache {
            inner,
            requests: tx,
            io_worker: Some(io_worker),
        })
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.inner.layout
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_cached
    }

    /// Entry for a (layer, expert, matrix) triple. Out-of-range indices panic.
    pub fn get(&self, layer_id: usize, expert_id: usize, matrix_id: usize) -> &Matrix {
        &self.inner.matrices[self.inner.layout.record_index(layer_id, expert_id, matrix_id)]
    }

    /// Start loading `matrix`. `state` must be its locked state and NotPresent.
    ///
    /// Returns once the buffer is reserved and the request is queued; the
    /// matrix becomes Present from the I/O worker. If every resident entry is
    /// loading or pinned this waits for a victim, so callers must not hold
    /// pins that only they can release.
    pub fn async_fetch(&self, matrix: &Matrix, state: &mut MatrixState) {
        self.check_fetchable(matrix, state);
        state.status = DataStatus::Loading;
        let buf = self.allocate_buffer(matrix.index, state);
        self.submit(matrix, buf);
    }

    /// Like [`async_fetch`](Self::async_fetch), but gives up instead of
    /// waiting when the cache has no evictable entry. Returns whether the
    /// read was issued; on `false` the matrix stays NotPresent.
    pub fn try_async_fetch(&self, matrix: &Matrix, state: &mut MatrixState) -> bool {
        self.check_fetchable(matrix, state);
        let Some(reused) = self.reserve_slot(matrix.index) else {
            return false;
        };
        state.status = DataStatus::Loading;
        let buf = self.install_buffer(state, reused);
        self.submit(matrix, buf);
        true
    }

    fn check_fetchable(&self, matrix: &Matrix, state: &MatrixState) {
        assert_eq!(
            state.status,
            DataStatus::NotPresent,
            "async_fetch on matrix ({}, {}, {})",
            matrix.layer_id,
            matrix.expert_id,
            matrix.matrix_id,
        );
        assert!(state.data.is_none(), "matrix already owns a buffer");
    }

    fn submit(&self, matrix: &Matrix, buf: Arc<AlignedBuf>) {
        log::trace!(
            "fetch matrix ({}, {}, {}) at offset {}",
            matrix.layer_id,
            matrix.expert_id,
            matrix.matrix_id,
            matrix.file_offset,
        );
        if self.requests.send(IoCommand::Read { index: matrix.index, buf }).is_err() {
            panic!("expert cache I/O worker has exited");
        }
    }

    /// Mark a linked entry most recently used. No-op for entries without data.
    pub fn lru_promote(&self, matrix: &Matrix) {
        self.inner.lru.lock().promote(matrix.index);
    }

    /// Fetch if absent and promote. Returns true on a hit (Loading or Present).
    pub fn fetch(&self, layer_id: usize, expert_id: usize, matrix_id: usize) -> bool {
        let matrix = self.get(layer_id, expert_id, matrix_id);
        let mut state = matrix.lock();
        let hit = state.status != DataStatus::NotPresent;
        if !hit {
            self.async_fetch(matrix, &mut state);
        }
        self.lru_promote(matrix);
        hit
    }

    /// Spin until `matrix` is Present. It must be loading or present already.
    pub fn wait_until_present(&self, matrix: &Matrix) {
        let backoff = Backoff::new();
        loop {
            match matrix.status() {
                DataStatus::Present => return,
                DataStatus::Loading => backoff.snooze(),
                DataStatus::NotPresent => panic!(
                    "waiting on matrix ({}, {}, {}) that is not being fetched",
                    matrix.layer_id, matrix.expert_id, matrix.matrix_id,
                ),
            }
        }
    }

    /// Entries holding a buffer.
    pub fn n_resident(&self) -> usize {
        self.inner.lru.lock().len()
    }

    /// Resident (layer, expert, matrix) triples from least to most recently used.
    pub fn lru_order(&self) -> Vec<(usize, usize, usize)> {
        let lru = self.inner.lru.lock();
        lru.iter_from_back()
            .map(|i| {
                let m = &self.inner.matrices[i];
                (m.layer_id, m.expert_id, m.matrix_id)
            })
            .collect()
    }

    /// Check the residency invariants, panicking on violation.
    ///
    /// The per-entry checks hold under concurrent fetches, since membership
    /// of an entry only changes under that entry's lock. The capacity bound
    /// is summed entry by entry, so it is only exact on a quiescent cache.
    pub fn check_invariants(&self) {
        let mut n_with_data = 0;
        for m in self.inner.matrices.iter() {
            let state = m.state.lock();
            let linked = self.inner.lru.lock().contains(m.index);
            assert_eq!(state.data.is_some(), linked, "{m:?}: buffer vs LRU membership");
            assert_eq!(
                state.status == DataStatus::NotPresent,
                !linked,
                "{m:?}: status {:?} vs LRU membership",
                state.status,
            );
            if state.data.is_some() {
                n_with_data += 1;
            }
        }
        assert!(
            n_with_data <= self.inner.max_cached,
            "{n_with_data} resident matrices exceed capacity {}",
            self.inner.max_cached,
        );
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            n_examined: c.n_examined.load(Ordering::Relaxed),
            n_cached: c.n_cached.load(Ordering::Relaxed),
            n_prefetched: c.n_prefetched.load(Ordering::Relaxed),
            n_evicted: c.n_evicted.load(Ordering::Relaxed),
            n_loaded: c.n_loaded.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn note_lookups(&self, n_examined: usize, n_cached: usize) {
        let c = &self.inner.counters;
        c.n_examined.fetch_add(n_examined, Ordering::Relaxed);
        c.n_cached.fetch_add(n_cached, Ordering::Relaxed);
    }

    pub(crate) fn note_prefetched(&self, n: usize) {
        self.inner.counters.n_prefetched.fetch_add(n, Ordering::Relaxed);
    }

    /// Link `index` into the LRU if there is room or a victim. Returns the
    /// victim's buffer when one was evicted, `None` when nothing could be
    /// freed.
    fn reserve_slot(&self, index: usize) -> Option<Option<Arc<AlignedBuf>>> {
        let inner = &*self.inner;
        let mut lru = inner.lru.lock();
        if lru.len() < inner.max_cached {
            lru.push_front(index);
            return Some(None);
        }
        let buf = inner.evict_one(&mut lru)?;
        lru.push_front(index);
        Some(Some(buf))
    }

    /// Link `index` into the LRU and give `state` a buffer, evicting if full.
    fn allocate_buffer(&self, index: usize, state: &mut MatrixState) -> Arc<AlignedBuf> {
        let mut n_waits = 0usize;
        let reused = loop {
            if let Some(reused) = self.reserve_slot(index) {
                break reused;
            }
            if n_waits == 0 {
                log::debug!("expert cache full of loading or pinned matrices, waiting for a victim");
            }
            n_waits += 1;
            std::thread::yield_now();
        };
        self.install_buffer(state, reused)
    }

    fn install_buffer(&self, state: &mut MatrixState, reused: Option<Arc<AlignedBuf>>) -> Arc<AlignedBuf> {
        let buf = match reused {
            Some(buf) if Arc::strong_count(&buf) == 1 => buf,
            Some(_) => {
                log::debug!("evicted buffer still referenced by a reader, allocating a fresh one");
                Arc::new(AlignedBuf::zeroed(self.inner.layout.matrix_bytes))
            }
            None => Arc::new(AlignedBuf::zeroed(self.inner.layout.matrix_bytes)),
        };
        state.data = Some(Arc::clone(&buf));
        buf
    }
}

impl Drop for ExpertCache {
    fn drop(&mut self) {
        let _ = self.requests.send(IoCommand::Exit);
        if let Some(handle) = self.io_worker.take() {
            if handle.join().is_err() {
                log::error!("expert cache I/O worker panicked");
            }
        }
        log::info!("Expert cache: {}", self.stats());
    }
}

fn check_bundle_len(path: &Path, layout: &BundleLayout) -> Result<()> {
    let len = std::fs::metadata(path)?.len();
    if len < layout.file_len() {
        return Err(Error::Bundle(format!(
            "{} is {len} bytes, layout needs {}",
            path.display(),
            layout.file_len(),
        )));
    }
    Ok(())
}

/// Body of the I/O worker thread.
///
/// Blocks for a request only when nothing is in flight. Without a new request
/// it waits for at least one completion. Exits on `Exit` or when the cache is
/// gone, leaving outstanding completions unprocessed.
fn io_worker_main(
    inner: Arc<CacheInner>,
    requests: Receiver<IoCommand>,
    mut ring: Box<dyn IoRing>,
    cpu: Option<usize>,
) {
    if let Some(cpu) = cpu {
        if !affinity::pin_current_thread(cpu) {
            log::warn!("could not pin expert cache I/O worker to CPU {cpu}");
        }
    }

    loop {
        let command = if ring.n_inflight() == 0 {
            match requests.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            }
        } else {
            match requests.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        };

        match command {
            Some(IoCommand::Exit) => break,
            Some(IoCommand::Read { index, buf }) => {
                if ring.n_inflight() == ring.queue_depth() {
                    ring.submit_and_wait(1);
                    ring.reap();
                }
                let len = inner.layout.matrix_bytes;
                assert_eq!(buf.len(), len, "cache buffer has the wrong size");
                let completion_inner = Arc::clone(&inner);
                ring.enqueue_read(ReadRequest {
                    // SAFETY: `buf` moves into the completion below, so it
                    // outlives the read; the matrix is Loading, so nobody
                    // else touches its contents.
                    buf: unsafe { BufPtr::new(buf.as_mut_ptr()) },
                    offset: inner.matrices[index].file_offset,
                    len,
                    on_complete: Box::new(move || {
                        completion_inner.complete(index);
                        drop(buf);
                    }),
                });
            }
            None => {
                let wait_nr = usize::from(ring.n_inflight() > 0);
                ring.submit_and_wait(wait_nr);
            }
        }

        ring.reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleWriter;

    fn small_cfg(capacity: usize) -> CacheConfig {
        CacheConfig {
            max_cached_matrices: capacity,
            io_queue_depth: capacity.min(4),
            direct_io: false,
            io_worker_cpu: None,
        }
    }

    /// One layer, `n_experts` experts, one matrix each; record `e` is filled with byte `e + 1`.
    fn bundle(n_experts: usize) -> (tempfile::TempDir, std::path::PathBuf, BundleLayout) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experts.bin");
        let layout = BundleLayout::new(1, n_experts, 1, 4096);
        let mut w = BundleWriter::create(&path, layout).unwrap();
        for e in 0..n_experts {
            w.append(&vec![(e + 1) as u8; 4096]).unwrap();
        }
        w.finish().unwrap();
        (dir, path, layout)
    }

    #[test]
    fn test_miss_then_present() {
        let _ = env_logger::try_init();
        let (_dir, path, layout) = bundle(2);
        let cache = ExpertCache::open(&path, layout, &small_cfg(2)).unwrap();

        assert!(!cache.fetch(0, 1, 0));
        let m = cache.get(0, 1, 0);
        cache.wait_until_present(m);
        assert!(m.data().as_slice().iter().all(|&b| b == 2));
        assert_eq!(m.file_offset, 4096);
        cache.check_invariants();
        assert_eq!(cache.stats().n_loaded, 1);
    }

    #[test]
    fn test_rejects_misaligned_matrix_bytes() {
        let (_dir, path, _) = bundle(1);
        let layout = BundleLayout::new(1, 1, 1, 1000);
        assert!(ExpertCache::open(&path, layout, &small_cfg(2)).is_err());
    }

    #[test]
    fn test_rejects_short_bundle() {
        let (_dir, path, _) = bundle(1);
        let layout = BundleLayout::new(1, 4, 1, 4096);
        let err = ExpertCache::open(&path, layout, &small_cfg(2)).err().unwrap();
        assert!(err.to_string().contains("layout needs"), "{err}");
    }

    #[test]
    #[should_panic(expected = "async_fetch on matrix")]
    fn test_fetch_twice_is_fatal() {
        let (_dir, path, layout) = bundle(1);
        let cache = ExpertCache::open(&path, layout, &small_cfg(2)).unwrap();
        let m = cache.get(0, 0, 0);
        let mut state = m.lock();
        cache.async_fetch(m, &mut state);
        cache.async_fetch(m, &mut state);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_get_out_of_range_is_fatal() {
        let (_dir, path, layout) = bundle(1);
        let cache = ExpertCache::open(&path, layout, &small_cfg(2)).unwrap();
        cache.get(0, 1, 0);
    }

    #[test]
    fn test_pinned_entries_are_not_evicted() {
        let (_dir, path, layout) = bundle(3);
        let cache = ExpertCache::open_mmap(&path, layout, &small_cfg(2)).unwrap();
        for e in 0..2 {
            cache.fetch(0, e, 0);
            cache.wait_until_present(cache.get(0, e, 0));
        }
        // Pin the least recently used entry; the other one must go instead.
        cache.get(0, 0, 0).lock().pin(1);
        cache.fetch(0, 2, 0);
        cache.wait_until_present(cache.get(0, 2, 0));
        assert_eq!(cache.get(0, 1, 0).status(), DataStatus::NotPresent);
        assert_eq!(cache.get(0, 0, 0).status(), DataStatus::Present);
        cache.get(0, 0, 0).unpin();
        cache.check_invariants();
    }

    #[test]
    fn test_try_fetch_gives_up_when_everything_is_pinned() {
        let (_dir, path, layout) = bundle(3);
        let cache = ExpertCache::open(&path, layout, &small_cfg(2)).unwrap();
        for e in 0..2 {
            cache.fetch(0, e, 0);
            cache.wait_until_present(cache.get(0, e, 0));
            cache.get(0, e, 0).lock().pin(1);
        }

        let m = cache.get(0, 2, 0);
        assert!(!cache.try_async_fetch(m, &mut m.lock()));
        assert_eq!(m.status(), DataStatus::NotPresent);
        assert_eq!(cache.n_resident(), 2);
        assert_eq!(cache.stats().n_evicted, 0);
        cache.check_invariants();

        cache.get(0, 1, 0).unpin();
        assert!(cache.try_async_fetch(m, &mut m.lock()));
        cache.wait_until_present(m);
        assert!(m.data().as_slice().iter().all(|&b| b == 3));
        assert_eq!(cache.get(0, 1, 0).status(), DataStatus::NotPresent);
        cache.get(0, 0, 0).unpin();
        cache.check_invariants();
    }

    #[test]
    fn test_stats_display() {
        let stats = CacheStats { n_examined: 4, n_cached: 1, ..Default::default() };
        let text = stats.to_string();
        eprintln!("{text}");
        assert!(text.contains("#cached=1 (25.00%)"));
    }
}
