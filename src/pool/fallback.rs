/// Generic backing allocator contract.
///
/// The pool facade uses an implementation of this trait for everything that
/// falls outside the bucket regime: requests larger than the biggest size
/// class, allocators created with zero buckets, fully drained buckets, the
/// pool's own backing buffer and the per-thread L1 cache arrays.
///
/// All alignment arguments are powers of two `<= MAX_VALID_ALIGNMENT`
/// (16384); callers uphold that precondition.
pub trait RawAllocator: Send + Sync {
    /// Allocate `bytes` with the given alignment. Returns null on failure.
    fn alloc(&self, bytes: usize, alignment: usize) -> *mut u8;

    /// Release a pointer previously returned by [`alloc`](Self::alloc) or
    /// [`realloc`](Self::realloc) on this instance.
    ///
    /// # Safety
    /// `p` must originate from this instance and must not have been freed.
    unsafe fn free(&self, p: *mut u8);

    /// Resize an allocation, preserving `min(old usable size, bytes)` bytes
    /// of content. Returns null (leaving `p` live) on failure.
    ///
    /// # Safety
    /// `p` must originate from this instance and must not have been freed.
    unsafe fn realloc(&self, p: *mut u8, bytes: usize, alignment: usize) -> *mut u8;

    /// Number of bytes actually usable behind `p`. At least the size that
    /// was requested when `p` was allocated.
    ///
    /// # Safety
    /// `p` must originate from this instance and must not have been freed.
    unsafe fn usable_size(&self, p: *mut u8) -> usize;
}

/// Default [`RawAllocator`] backed by the C runtime heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

#[cfg(unix)]
mod platform {
    use super::SystemAllocator;
    use std::ptr;

    impl super::RawAllocator for SystemAllocator {
        fn alloc(&self, bytes: usize, alignment: usize) -> *mut u8 {
            // posix_memalign requires the alignment to be a power of two and
            // a multiple of sizeof(void*).
            let alignment = alignment.max(std::mem::size_of::<*mut u8>());
            let mut p: *mut libc::c_void = ptr::null_mut();
            // Safety: FFI call; p is a valid out-pointer.
            let rc = unsafe { libc::posix_memalign(&mut p, alignment, bytes.max(1)) };
            if rc != 0 {
                return ptr::null_mut();
            }
            p.cast()
        }

        unsafe fn free(&self, p: *mut u8) {
            if p.is_null() {
                return;
            }
            // Safety: p came from posix_memalign on this instance.
            unsafe { libc::free(p.cast()) };
        }

        unsafe fn realloc(&self, p: *mut u8, bytes: usize, alignment: usize) -> *mut u8 {
            if p.is_null() {
                return self.alloc(bytes, alignment);
            }
            // libc::realloc does not preserve alignment above the natural
            // one, so grow by hand: allocate, copy the payload, release.
            let fresh = self.alloc(bytes, alignment);
            if fresh.is_null() {
                return ptr::null_mut();
            }
            // Safety: both pointers are valid for the copied range.
            unsafe {
                let old_size = self.usable_size(p);
                ptr::copy_nonoverlapping(p, fresh, old_size.min(bytes));
                self.free(p);
            }
            fresh
        }

        unsafe fn usable_size(&self, p: *mut u8) -> usize {
            if p.is_null() {
                return 0;
            }
            #[cfg(target_os = "macos")]
            // Safety: FFI call; p is a live heap pointer.
            unsafe {
                libc::malloc_size(p.cast())
            }
            #[cfg(not(target_os = "macos"))]
            // Safety: FFI call; p is a live heap pointer.
            unsafe {
                libc::malloc_usable_size(p.cast())
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::SystemAllocator;
    use std::ptr;

    // The MSVC runtime has no malloc_usable_size, and _aligned_msize needs
    // the original alignment, which free/usable_size callers do not have.
    // Over-allocate from plain malloc instead and keep (base, usable) in a
    // header just below the aligned payload.
    #[repr(C)]
    struct AlignedHeader {
        base: *mut u8,
        usable: usize,
    }

    const HEADER_SIZE: usize = std::mem::size_of::<AlignedHeader>();

    impl super::RawAllocator for SystemAllocator {
        fn alloc(&self, bytes: usize, alignment: usize) -> *mut u8 {
            let alignment = alignment.max(std::mem::align_of::<AlignedHeader>());
            let Some(total) = bytes.checked_add(alignment + HEADER_SIZE) else {
                return ptr::null_mut();
            };
            // Safety: FFI call.
            let base = unsafe { libc::malloc(total) }.cast::<u8>();
            if base.is_null() {
                return ptr::null_mut();
            }
            let payload_start = base.addr() + HEADER_SIZE;
            let aligned_addr = (payload_start + alignment - 1) & !(alignment - 1);
            // Safety: aligned_addr and its header stay inside the
            // allocation; deriving from `base` keeps provenance.
            unsafe {
                let aligned = base.add(aligned_addr - base.addr());
                let header = aligned.sub(HEADER_SIZE).cast::<AlignedHeader>();
                header.write_unaligned(AlignedHeader {
                    base,
                    usable: base.addr() + total - aligned_addr,
                });
                aligned
            }
        }

        unsafe fn free(&self, p: *mut u8) {
            if p.is_null() {
                return;
            }
            // Safety: the header precedes every pointer this impl hands out.
            unsafe {
                let header = p.sub(HEADER_SIZE).cast::<AlignedHeader>().read_unaligned();
                libc::free(header.base.cast());
            }
        }

        unsafe fn realloc(&self, p: *mut u8, bytes: usize, alignment: usize) -> *mut u8 {
            if p.is_null() {
                return self.alloc(bytes, alignment);
            }
            let fresh = self.alloc(bytes, alignment);
            if fresh.is_null() {
                return ptr::null_mut();
            }
            // Safety: both pointers are valid for the copied range.
            unsafe {
                let old_size = self.usable_size(p);
                ptr::copy_nonoverlapping(p, fresh, old_size.min(bytes));
                self.free(p);
            }
            fresh
        }

        unsafe fn usable_size(&self, p: *mut u8) -> usize {
            if p.is_null() {
                return 0;
            }
            // Safety: the header precedes every pointer this impl hands out.
            unsafe { p.sub(HEADER_SIZE).cast::<AlignedHeader>().read_unaligned().usable }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::{RawAllocator, SystemAllocator};

    #[test]
    fn test_alloc_free_roundtrip() {
        let sys = SystemAllocator;
        let p = sys.alloc(256, 64);
        assert!(!p.is_null());
        assert!(p.addr().is_multiple_of(64));
        // Safety: p is a fresh 256-byte allocation.
        unsafe {
            p.write_bytes(0xA7, 256);
            assert!(sys.usable_size(p) >= 256);
            sys.free(p);
        }
    }

    #[test]
    fn test_alloc_max_valid_alignment() {
        let sys = SystemAllocator;
        let p = sys.alloc(1, 16384);
        assert!(!p.is_null());
        assert!(p.addr().is_multiple_of(16384));
        // Safety: p is live.
        unsafe { sys.free(p) };
    }

    #[test]
    fn test_realloc_preserves_content() {
        let sys = SystemAllocator;
        let p = sys.alloc(64, 16);
        assert!(!p.is_null());
        // Safety: p is a fresh 64-byte allocation.
        unsafe {
            for i in 0..64 {
                p.add(i).write(i as u8);
            }
            let q = sys.realloc(p, 4096, 16);
            assert!(!q.is_null());
            for i in 0..64 {
                assert_eq!(q.add(i).read(), i as u8);
            }
            sys.free(q);
        }
    }

    #[test]
    fn test_free_null_is_noop() {
        let sys = SystemAllocator;
        // Safety: null is explicitly tolerated.
        unsafe { sys.free(std::ptr::null_mut()) };
    }
}
