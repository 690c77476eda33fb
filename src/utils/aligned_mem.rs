use std::alloc::{self, Layout};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::{fmt, slice};

/// Page size the buffer is aligned to.
pub const PAGE_SIZE: usize = 4096;

/// An owned, page-aligned, zero-initialized memory area meant to be
/// registered as an RDMA memory region.
///
/// Once registered, a peer may write into the area at any time, so the
/// content is only ever accessed through atomic byte operations and never
/// through plain references.
pub struct AlignedMem {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the area is exclusively owned and all accesses go through atomics.
unsafe impl Send for AlignedMem {}
unsafe impl Sync for AlignedMem {}

impl fmt::Debug for AlignedMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("AlignedMem<{:p}; {}>", self.ptr, self.len()))
    }
}

impl AlignedMem {
    /// Allocate `len` zeroed bytes aligned to [`PAGE_SIZE`].
    /// Return `None` if `len` is zero or the allocation fails.
    pub fn zeroed(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE).ok()?;
        // SAFETY: `layout` has non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// View the area as atomic bytes.
    #[inline]
    pub fn atomics(&self) -> &[AtomicU8] {
        // SAFETY: `AtomicU8` has the same layout as `u8`, the area is
        // initialized and lives as long as `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr() as *const AtomicU8, self.len()) }
    }

    /// Copy `data` into the area starting at `offset`.
    /// Return `false` without writing anything if it does not fit.
    pub fn store(&self, offset: usize, data: &[u8]) -> bool {
        let Some(dst) = offset
            .checked_add(data.len())
            .and_then(|end| self.atomics().get(offset..end))
        else {
            return false;
        };
        for (d, s) in dst.iter().zip(data) {
            d.store(*s, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);
        true
    }

    /// Load a single byte.
    #[inline]
    pub fn load_byte(&self, offset: usize) -> u8 {
        self.atomics()[offset].load(Ordering::Acquire)
    }

    /// Copy bytes in `range` out of the area, stopping before the first NUL.
    pub fn load_until_nul(&self, range: Range<usize>) -> Vec<u8> {
        std::sync::atomic::fence(Ordering::Acquire);
        self.atomics()[range]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .take_while(|b| *b != 0)
            .collect()
    }
}

impl Drop for AlignedMem {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_zeroed() {
        let mem = AlignedMem::zeroed(2 * PAGE_SIZE).unwrap();
        assert_eq!(mem.addr() as usize % PAGE_SIZE, 0);
        assert!(mem.atomics().iter().all(|b| b.load(Ordering::Relaxed) == 0));
        assert!(AlignedMem::zeroed(0).is_none());
    }

    #[test]
    fn store_and_load() {
        let mem = AlignedMem::zeroed(64).unwrap();
        assert!(mem.store(32, b"hello"));
        assert_eq!(mem.load_byte(32), b'h');
        assert_eq!(mem.load_until_nul(32..64), b"hello");
        assert!(mem.load_until_nul(0..32).is_empty());
        assert!(!mem.store(60, b"hello"));
        assert_eq!(mem.load_byte(60), 0);
    }
}
