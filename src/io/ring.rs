//! Positional-read ring backends.

use super::{Completion, IoRing, ReadRequest};
use crate::error::Result;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// A byte source that supports reads at an absolute offset.
pub trait ReadAt: Send {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;
}

impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        // Keep reading after partial reads; stop at EOF.
        let mut done = 0;
        while done < buf.len() {
            match FileExt::read_at(self, &mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }
}

impl ReadAt for Mmap {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let start = (offset as usize).min(self.len());
        let end = (start + buf.len()).min(self.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self[start..end]);
        Ok(n)
    }
}

/// Ring whose submissions complete synchronously inside `submit_and_wait`.
pub struct SyncRing<S: ReadAt> {
    source: S,
    queue_depth: usize,
    n_inflight: usize,
    submitted: Vec<ReadRequest>,
    completed: Vec<Completion>,
}

pub type FileRing = SyncRing<File>;
pub type MmapRing = SyncRing<Mmap>;

impl<S: ReadAt> SyncRing<S> {
    pub fn new(source: S, queue_depth: usize) -> Self {
        assert!(queue_depth > 0);
        SyncRing {
            source,
            queue_depth,
            n_inflight: 0,
            submitted: Vec::with_capacity(queue_depth),
            completed: Vec::with_capacity(queue_depth),
        }
    }
}

/// Open the bundle read-only; with `direct` the page cache is bypassed.
pub fn open_file_ring(path: &Path, queue_depth: usize, direct: bool) -> Result<FileRing> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if direct {
            opts.custom_flags(libc::O_DIRECT);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = direct;

    let file = opts.open(path)?;
    Ok(SyncRing::new(file, queue_depth))
}

pub fn open_mmap_ring(path: &Path, queue_depth: usize) -> Result<MmapRing> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(SyncRing::new(mmap, queue_depth))
}

impl<S: ReadAt> IoRing for SyncRing<S> {
    fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    fn n_inflight(&self) -> usize {
        self.n_inflight
    }

    fn enqueue_read(&mut self, req: ReadRequest) {
        assert!(
            self.n_inflight < self.queue_depth,
            "I/O ring overflow ({} requests in flight)",
            self.n_inflight,
        );
        self.n_inflight += 1;
        self.submitted.push(req);
    }

    fn submit_and_wait(&mut self, _wait_nr: usize) {
        for req in self.submitted.drain(..) {
            // SAFETY: the issuer keeps `buf` alive and unaliased until the
            // completion runs (see BufPtr::new).
            let dst = unsafe { std::slice::from_raw_parts_mut(req.buf.as_ptr(), req.len) };
            let got = match self.source.read_at(dst, req.offset) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("read of {} bytes at offset {} failed: {e}", req.len, req.offset);
                    panic!("expert bundle read failed at offset {}: {e}", req.offset);
                }
            };
            if got != req.len {
                log::error!("short read: expected {} bytes, got {got} (offset {})", req.len, req.offset);
                panic!(
                    "expert bundle short read at offset {}: expected {}, got {got}",
                    req.offset, req.len,
                );
            }
            self.completed.push(req.on_complete);
        }
    }

    fn reap(&mut self) -> usize {
        let count = self.completed.len();
        for callback in self.completed.drain(..) {
            callback();
        }
        self.n_inflight -= count;
        count
    }
}
