//! Page-aligned heap buffers for direct I/O.

use crate::config::IO_ALIGNMENT;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// An owned, zero-initialised allocation aligned to [`IO_ALIGNMENT`].
/// Freed on drop.
///
/// Reads go through [`as_slice`](Self::as_slice). The I/O ring writes through
/// the raw pointer from [`as_mut_ptr`](Self::as_mut_ptr), which is only done
/// while the owning cache entry is LOADING; nobody holds a slice into the
/// buffer during that window.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: AlignedBuf owns its memory; shared access is read-only outside the
// LOADING window described above.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes. `len` must be non-zero.
    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0, "zero-sized I/O buffer");
        let layout = Self::layout(len);
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        AlignedBuf { ptr, len }
    }

    fn layout(len: usize) -> Layout {
        match Layout::from_size_align(len, IO_ALIGNMENT) {
            Ok(l) => l,
            Err(e) => panic!("invalid buffer layout ({len} bytes): {e}"),
        }
    }

    /// Length of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Destination pointer for an in-flight read.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.len)) };
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_zeroing() {
        let mut buf = AlignedBuf::zeroed(3 * IO_ALIGNMENT);
        assert_eq!(buf.as_ptr() as usize % IO_ALIGNMENT, 0);
        assert_eq!(buf.len(), 3 * IO_ALIGNMENT);
        assert!(buf.as_slice().iter().all(|&b| b == 0));

        buf.as_mut_slice()[0] = 42;
        buf.as_mut_slice()[3 * IO_ALIGNMENT - 1] = 99;
        assert_eq!(buf.as_slice()[0], 42);
        assert_eq!(buf.as_slice()[3 * IO_ALIGNMENT - 1], 99);
    }
}
