use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(feature = "stats")]
use super::stats::BucketStats;

#[cfg(all(debug_assertions, not(loom)))]
use crate::sync::Mutex;
#[cfg(all(debug_assertions, not(loom)))]
use fixedbitset::FixedBitSet;

/// 64-bit tagged free-list index.
///
/// Bit layout:
/// ```text
///   bits [63:32]  tag     (monotonic, advanced by every push)
///   bits [31:0]   offset  (byte offset of the block from the bucket base)
/// ```
///
/// The tag makes the head CAS ABA-safe: a block that is popped, handed to
/// the user, freed and pushed back at the same offset re-enters the list
/// with a fresh tag, so a stale CAS against the old (tag, offset) pair
/// fails. The 32-bit offset bounds a single bucket region to 4 GiB.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct TaggedIndex(u64);

impl TaggedIndex {
    /// Sentinel for the empty list. Never collides with a real entry:
    /// valid offsets are multiples of 16, and `0xFFFF_FFFF` is not.
    pub(crate) const INVALID: Self = Self(u64::MAX);

    #[inline]
    pub(crate) fn new(tag: u32, offset: u32) -> Self {
        Self(u64::from(tag) << 32 | u64::from(offset))
    }

    #[inline]
    pub(crate) fn offset(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub(crate) fn tag(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for TaggedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TaggedIndex(INVALID)")
        } else {
            write!(f, "TaggedIndex(offset={}, tag={})", self.offset(), self.tag())
        }
    }
}

/// Lock-free LIFO free list for one size class.
///
/// The list is threaded through the free blocks themselves: the first eight
/// bytes of every free block hold the [`TaggedIndex`] of its successor.
/// Allocated blocks carry no metadata at all; the full element size is user
/// payload.
///
/// `head` is the only shared mutable word. A push allocates a fresh tag from
/// `global_tag` and publishes with a release CAS; a pop consumes the head
/// with an acquire CAS, so link writes happen-before the consuming read.
/// A pop could only be fooled if `global_tag` wrapped through 2^32 pushes
/// inside one pop's CAS window, which the target workloads cannot approach.
pub(crate) struct PoolBucket {
    head: AtomicU64,
    global_tag: AtomicU32,
    data: *mut u8,
    end: *mut u8,
    element_size: usize,
    #[cfg(feature = "stats")]
    pub(crate) stats: BucketStats,
    // User-ownership bitmap, maintained by the facade (bit set = block is in
    // some free tier). Catches double-free and frees of live cache entries.
    #[cfg(all(debug_assertions, not(loom)))]
    free_map: Mutex<FixedBitSet>,
}

// Safety: `data`/`end` are immutable after `create`; the only shared mutable
// state is the atomic head/tag pair.
unsafe impl Send for PoolBucket {}
// Safety: see Send; all cross-thread mutation goes through atomics.
unsafe impl Sync for PoolBucket {}

/// Write a block's link word. Used by spill paths that pre-link a chain
/// before handing it to [`PoolBucket::free_interval`].
///
/// # Safety
/// `block` must be an exclusively owned block of at least 8 bytes, aligned
/// to 8.
#[inline]
pub(crate) unsafe fn store_link(block: *mut u8, value: TaggedIndex) {
    // Safety: upheld by caller.
    unsafe { PoolBucket::link_atomic(block) }.store(value.raw(), Ordering::Relaxed);
}

impl PoolBucket {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicU64::new(TaggedIndex::INVALID.raw()),
            global_tag: AtomicU32::new(0),
            data: std::ptr::null_mut(),
            end: std::ptr::null_mut(),
            element_size: 0,
            #[cfg(feature = "stats")]
            stats: BucketStats::new(),
            #[cfg(all(debug_assertions, not(loom)))]
            free_map: Mutex::new(FixedBitSet::new()),
        }
    }

    /// View of a block's link word. Free blocks are accessed concurrently by
    /// poppers while a failed pusher rewrites its tail link, so the word
    /// must only ever be touched through an atomic.
    ///
    /// # Safety
    /// `block` must point at least 8 readable/writable bytes aligned to 8.
    #[inline]
    unsafe fn link_atomic<'a>(block: *mut u8) -> &'a AtomicU64 {
        debug_assert!(block.addr().is_multiple_of(std::mem::align_of::<AtomicU64>()));
        // Safety: upheld by caller; every block is at least 16 bytes and
        // 16-byte aligned within the bucket region.
        unsafe { &*block.cast::<AtomicU64>() }
    }

    /// Thread the whole region into the free list.
    ///
    /// Block `k` receives `(tag = k, offset = (k + 1) * s)`; the last block
    /// gets the sentinel. `head` starts at block 0 and `global_tag` at
    /// `capacity`, so the first batch push cannot reuse an initial tag.
    pub(crate) fn create(&mut self, element_size: usize, data: *mut u8, region_bytes: usize) {
        debug_assert!(element_size.is_multiple_of(super::BLOCK_GRANULARITY));
        let capacity = region_bytes / element_size;
        debug_assert!(capacity * element_size <= u32::MAX as usize);

        self.element_size = element_size;
        self.data = data;
        // Safety: the caller hands us a region of at least `region_bytes`.
        self.end = unsafe { data.add(capacity * element_size) };

        for k in 0..capacity {
            let next = if k + 1 == capacity {
                TaggedIndex::INVALID
            } else {
                TaggedIndex::new(k as u32, ((k + 1) * element_size) as u32)
            };
            // Safety: block k lies inside the region.
            let link = unsafe { Self::link_atomic(data.add(k * element_size)) };
            link.store(next.raw(), Ordering::Relaxed);
        }

        let head = if capacity == 0 {
            TaggedIndex::INVALID
        } else {
            TaggedIndex::new(0, 0)
        };
        self.head.store(head.raw(), Ordering::Release);
        self.global_tag.store(capacity as u32, Ordering::Relaxed);

        #[cfg(all(debug_assertions, not(loom)))]
        {
            let mut map = FixedBitSet::with_capacity(capacity);
            map.set_range(.., true);
            *self.free_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = map;
        }
    }

    /// Pop the head block. Lock-free; returns None when the list is empty.
    pub(crate) fn alloc(&self) -> Option<NonNull<u8>> {
        let mut head = TaggedIndex(self.head.load(Ordering::Acquire));

        loop {
            if head == TaggedIndex::INVALID {
                return None;
            }

            // Safety: a head observed with acquire ordering names a block
            // inside [data, end); its link word was published before the
            // CAS that installed it.
            let p = unsafe { self.data.add(head.offset() as usize) };
            let next = unsafe { Self::link_atomic(p) }.load(Ordering::Relaxed);

            // The CAS is the linearization point. A stale `next` (the block
            // was popped and re-pushed meanwhile) is rejected by the tag.
            match self
                .head
                .compare_exchange(head.raw(), next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return NonNull::new(p),
                Err(observed) => head = TaggedIndex(observed),
            }
        }
    }

    /// Push a pre-linked chain `[head_ptr ..= tail_ptr]` in one CAS.
    ///
    /// The chain's interior links must already be written; `tail_ptr`'s link
    /// word is overwritten here with the observed list head. A singleton
    /// block is pushed as `free_interval(p, p)`.
    pub(crate) fn free_interval(&self, head_ptr: *mut u8, tail_ptr: *mut u8) {
        debug_assert!(self.contains(head_ptr) && self.contains(tail_ptr));

        let tag = self.global_tag.fetch_add(1, Ordering::Relaxed);
        let node = TaggedIndex::new(tag, (head_ptr.addr() - self.data.addr()) as u32);

        // Safety: tail is a block we own until the CAS below publishes it.
        let tail_link = unsafe { Self::link_atomic(tail_ptr) };
        let mut observed = self.head.load(Ordering::Relaxed);

        loop {
            tail_link.store(observed, Ordering::Relaxed);

            // Release publishes the tail link (and the caller's interior
            // links) to any popper that acquires the new head.
            match self
                .head
                .compare_exchange(observed, node.raw(), Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(v) => observed = v,
            }
        }
    }

    #[inline]
    pub(crate) fn contains(&self, p: *mut u8) -> bool {
        p.addr() >= self.data.addr() && p.addr() < self.end.addr()
    }

    #[inline]
    pub(crate) fn data(&self) -> *mut u8 {
        self.data
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        (self.end.addr() - self.data.addr()) / self.element_size
    }

    /// Count the blocks currently on the master list. O(n) walk; test and
    /// diagnostics use only, racy under concurrent traffic.
    #[cfg(test)]
    pub(crate) fn free_block_count(&self) -> usize {
        let mut n = 0;
        let mut cursor = TaggedIndex(self.head.load(Ordering::Acquire));
        while cursor != TaggedIndex::INVALID {
            let offset = cursor.offset() as usize;
            assert!(
                offset.is_multiple_of(self.element_size)
                    && offset < self.capacity() * self.element_size,
                "free list offset {offset} violates the bucket layout"
            );
            n += 1;
            // Safety: the offset was just bounds-checked.
            let p = unsafe { self.data.add(offset) };
            cursor = TaggedIndex(unsafe { Self::link_atomic(p) }.load(Ordering::Relaxed));
        }
        n
    }

    /// Record a block leaving the free regime (returned to the user).
    /// Facade-only; panics on corruption.
    #[cfg(all(debug_assertions, not(loom)))]
    pub(crate) fn debug_acquire(&self, p: *mut u8) {
        let offset = p.addr() - self.data.addr();
        assert!(
            offset.is_multiple_of(self.element_size),
            "pointer {p:p} is not aligned to element size {}",
            self.element_size
        );
        let index = offset / self.element_size;
        let mut map = self.free_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(map.contains(index), "block {index} handed out while user-owned");
        map.set(index, false);
    }

    /// Record a block re-entering the free regime (user called free).
    /// Facade-only; panics on double-free.
    #[cfg(all(debug_assertions, not(loom)))]
    pub(crate) fn debug_release(&self, p: *mut u8) {
        let offset = p.addr() - self.data.addr();
        assert!(
            offset.is_multiple_of(self.element_size),
            "pointer {p:p} is not aligned to element size {}",
            self.element_size
        );
        let index = offset / self.element_size;
        let mut map = self.free_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(!map.contains(index), "double free detected: block {index}");
        map.set(index, true);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    /// 64-byte-aligned scratch region for standalone bucket tests.
    struct TestRegion {
        ptr: *mut u8,
        layout: std::alloc::Layout,
    }

    impl TestRegion {
        fn new(bytes: usize) -> Self {
            let layout = std::alloc::Layout::from_size_align(bytes, 64).unwrap();
            // Safety: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }
    }

    impl Drop for TestRegion {
        fn drop(&mut self) {
            // Safety: allocated in new() with the same layout.
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    fn bucket_over(region: &TestRegion, element_size: usize) -> PoolBucket {
        let mut bucket = PoolBucket::new();
        bucket.create(element_size, region.ptr, region.layout.size());
        bucket
    }

    #[test]
    fn test_pop_ascending_after_create() {
        let region = TestRegion::new(1024);
        let bucket = bucket_over(&region, 64);

        // Initial threading links blocks in ascending offset order.
        for k in 0..16 {
            let p = bucket.alloc().unwrap();
            assert_eq!(p.as_ptr().addr() - region.ptr.addr(), k * 64);
        }
        assert!(bucket.alloc().is_none());
    }

    #[test]
    fn test_lifo_singleton_push() {
        let region = TestRegion::new(1024);
        let bucket = bucket_over(&region, 64);

        let p1 = bucket.alloc().unwrap();
        let p2 = bucket.alloc().unwrap();
        assert_ne!(p1, p2);

        bucket.free_interval(p1.as_ptr(), p1.as_ptr());
        let p3 = bucket.alloc().unwrap();
        assert_eq!(p3, p1);
    }

    #[test]
    fn test_batch_push_preserves_chain_order() {
        let region = TestRegion::new(512);
        let bucket = bucket_over(&region, 64);

        let blocks: Vec<_> = std::iter::from_fn(|| bucket.alloc()).collect();
        assert_eq!(blocks.len(), 8);
        assert!(bucket.alloc().is_none());

        // Hand-link blocks 0 -> 1 -> 2 and push the interval.
        for i in 0..2 {
            let next_offset = (blocks[i + 1].as_ptr().addr() - region.ptr.addr()) as u32;
            // Safety: we own the blocks; link words are atomics in place.
            let link = unsafe { PoolBucket::link_atomic(blocks[i].as_ptr()) };
            link.store(TaggedIndex::new(i as u32, next_offset).raw(), Ordering::Relaxed);
        }
        bucket.free_interval(blocks[0].as_ptr(), blocks[2].as_ptr());

        assert_eq!(bucket.alloc().unwrap(), blocks[0]);
        assert_eq!(bucket.alloc().unwrap(), blocks[1]);
        assert_eq!(bucket.alloc().unwrap(), blocks[2]);
        assert!(bucket.alloc().is_none());
    }

    #[test]
    fn test_contains_bounds() {
        let region = TestRegion::new(256);
        let bucket = bucket_over(&region, 64);

        assert!(bucket.contains(region.ptr));
        // Safety: pointer arithmetic stays within or one past the region.
        unsafe {
            assert!(bucket.contains(region.ptr.add(255)));
            assert!(!bucket.contains(region.ptr.add(256)));
        }
        assert!(!bucket.contains(std::ptr::without_provenance_mut(0x10)));
    }

    #[test]
    fn test_capacity_excludes_remainder() {
        // 1000 / 48 = 20 blocks; the 40-byte remainder is never handed out.
        let region = TestRegion::new(1000);
        let bucket = bucket_over(&region, 48);
        assert_eq!(bucket.capacity(), 20);
        assert_eq!(bucket.free_block_count(), 20);
    }

    #[test]
    fn test_push_tags_are_fresh() {
        let region = TestRegion::new(256);
        let bucket = bucket_over(&region, 64);
        let capacity = bucket.capacity() as u32;

        let p = bucket.alloc().unwrap();
        bucket.free_interval(p.as_ptr(), p.as_ptr());

        // First push consumes the tag the initial threading left off at.
        let head = TaggedIndex(bucket.head.load(Ordering::Acquire));
        assert_eq!(head.tag(), capacity);
        assert_eq!(head.offset(), 0);
    }

    #[test]
    fn test_empty_region_is_always_empty() {
        let region = TestRegion::new(64);
        // Element bigger than the region: zero capacity.
        let bucket = bucket_over(&region, 128);
        assert_eq!(bucket.capacity(), 0);
        assert!(bucket.alloc().is_none());
    }

    #[test]
    fn test_concurrent_pop_push_preserves_block_count() {
        use crate::sync::Arc;
        use crate::sync::thread;

        let region = TestRegion::new(64 * 1024);
        let bucket = Arc::new(bucket_over(&region, 64));
        let initial = bucket.free_block_count();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bucket = bucket.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    if let Some(p) = bucket.alloc() {
                        bucket.free_interval(p.as_ptr(), p.as_ptr());
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(bucket.free_block_count(), initial);
    }

    #[test]
    fn test_concurrent_drain_no_duplicates() {
        use crate::sync::Arc;
        use crate::sync::thread;
        use std::collections::HashSet;

        let region = TestRegion::new(16 * 1024);
        let bucket = Arc::new(bucket_over(&region, 64));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let bucket = bucket.clone();
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(p) = bucket.alloc() {
                    got.push(p.as_ptr().addr());
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for addr in h.join().unwrap() {
                total += 1;
                assert!(seen.insert(addr), "block {addr:#x} handed out twice");
            }
        }
        assert_eq!(total, 256);
    }
}
