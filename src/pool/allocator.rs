use std::fmt;
use std::ptr;

use super::bucket::PoolBucket;
use super::cache::{self, CacheWarmup};
use super::fallback::{RawAllocator, SystemAllocator};
use super::{BLOCK_GRANULARITY, CACHE_LINE_SIZE, MAX_BUCKET_COUNT, MAX_VALID_ALIGNMENT};

#[cfg(feature = "stats")]
use super::stats::BucketStats;
#[cfg(feature = "stats")]
use crate::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub enum PoolError {
    InvalidConfig(String),
    BufferAllocationFailed { bytes: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidConfig(msg) => write!(f, "invalid pool configuration: {msg}"),
            PoolError::BufferAllocationFailed { bytes } => {
                write!(f, "backing buffer allocation of {bytes} bytes failed")
            }
        }
    }
}

impl std::error::Error for PoolError {}

/// Pool geometry. All fields have sensible defaults; set at init time via
/// [`Allocator::with_config`].
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Number of 16-byte-granular size classes, at most 64. Bucket `i`
    /// serves blocks of `16 * (i + 1)` bytes. Zero is legal and forwards
    /// every request to the fallback.
    pub buckets_count: u32,

    /// Bytes of backing buffer per bucket. Rounded up at init so the
    /// largest element divides it evenly and every bucket region keeps the
    /// alignment its size classes can be asked for.
    pub bucket_size_bytes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            buckets_count: 16,
            bucket_size_bytes: 4 * 1024 * 1024,
        }
    }
}

const fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

const fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// Segregated-pool allocator.
///
/// Owns one contiguous buffer divided into `buckets_count` regions; bucket
/// `i` holds a lock-free free list of `16 * (i + 1)`-byte blocks. Requests
/// are routed cache → bucket walk → fallback. There is no per-allocation
/// metadata inside the pool: `free`/`realloc`/`usable_size` recover the
/// size class from the pointer value alone.
///
/// The facade itself is `Sync`; hot paths mutate nothing but the calling
/// thread's cache records and the buckets' atomic heads. Per-thread caches
/// are created and destroyed explicitly ([`Allocator::create_thread_cache`])
/// and must not outlive the allocator.
pub struct Allocator {
    buckets: Box<[PoolBucket]>,
    buffer: *mut u8,
    buffer_end: *mut u8,
    bucket_size_bytes: usize,
    fallback: Box<dyn RawAllocator>,
    #[cfg(feature = "stats")]
    global_miss_count: AtomicUsize,
}

// Safety: buffer/bucket layout is immutable after construction; shared
// mutation goes through the buckets' atomics and the fallback is Send+Sync
// by trait bound.
unsafe impl Send for Allocator {}
// Safety: see Send.
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Create an allocator with `buckets_count` size classes of
    /// `bucket_size_bytes` each, backed by the system heap.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the configuration is invalid or the backing
    /// buffer cannot be allocated.
    pub fn new(buckets_count: u32, bucket_size_bytes: usize) -> Result<Self, PoolError> {
        Self::with_config(AllocatorConfig {
            buckets_count,
            bucket_size_bytes,
        })
    }

    /// Create an allocator from a config, backed by the system heap.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the configuration is invalid or the backing
    /// buffer cannot be allocated.
    pub fn with_config(config: AllocatorConfig) -> Result<Self, PoolError> {
        Self::with_fallback(config, Box::new(SystemAllocator))
    }

    /// Create an allocator that delegates out-of-regime requests (and its
    /// own backing buffer) to `fallback`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the configuration is invalid or the backing
    /// buffer cannot be allocated.
    pub fn with_fallback(
        config: AllocatorConfig,
        fallback: Box<dyn RawAllocator>,
    ) -> Result<Self, PoolError> {
        let buckets_count = config.buckets_count as usize;
        if buckets_count > MAX_BUCKET_COUNT {
            return Err(PoolError::InvalidConfig(format!(
                "buckets_count {buckets_count} exceeds the maximum of {MAX_BUCKET_COUNT}"
            )));
        }

        if buckets_count == 0 {
            return Ok(Self {
                buckets: Box::new([]),
                buffer: ptr::null_mut(),
                buffer_end: ptr::null_mut(),
                bucket_size_bytes: 0,
                fallback,
                #[cfg(feature = "stats")]
                global_miss_count: AtomicUsize::new(0),
            });
        }

        if config.bucket_size_bytes == 0 {
            return Err(PoolError::InvalidConfig(
                "bucket_size_bytes must be non-zero".to_string(),
            ));
        }

        // Round the bucket size up so (a) the largest element divides it
        // evenly, (b) regions stay cache-line aligned, and (c) every
        // power-of-two alignment a bucket can be asked for (at most the
        // largest element size) lands on an aligned region start.
        let largest_element = BLOCK_GRANULARITY * buckets_count;
        let max_served_align = prev_power_of_two(largest_element).min(MAX_VALID_ALIGNMENT);
        let step = lcm(lcm(largest_element, CACHE_LINE_SIZE), max_served_align);
        let bucket_size_bytes = config.bucket_size_bytes.div_ceil(step) * step;

        let total_bytes = buckets_count * bucket_size_bytes;
        let buffer_align = CACHE_LINE_SIZE.max(max_served_align);
        let buffer = fallback.alloc(total_bytes, buffer_align);
        if buffer.is_null() {
            return Err(PoolError::BufferAllocationFailed { bytes: total_bytes });
        }
        // The zero-size sentinel range must never collide with real blocks.
        assert!(
            buffer.addr() > MAX_VALID_ALIGNMENT,
            "backing buffer overlaps the sentinel address range"
        );

        let mut buckets = Vec::with_capacity(buckets_count);
        for i in 0..buckets_count {
            let mut bucket = PoolBucket::new();
            // Safety: region i lies inside the buffer just allocated.
            let region = unsafe { buffer.add(i * bucket_size_bytes) };
            bucket.create(Self::element_size_of(i), region, bucket_size_bytes);
            buckets.push(bucket);
        }

        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            buffer,
            // Safety: one past the buffer is a valid provenance-preserving
            // address.
            buffer_end: unsafe { buffer.add(total_bytes) },
            bucket_size_bytes,
            fallback,
            #[cfg(feature = "stats")]
            global_miss_count: AtomicUsize::new(0),
        })
    }

    /// Pointers at or below this value are sentinels (null, or a zero-size
    /// allocation's alignment) and are never dereferenced.
    #[inline]
    fn is_readable(&self, p: *mut u8) -> bool {
        p.addr() > MAX_VALID_ALIGNMENT
    }

    /// Size class of bucket `index`.
    #[inline]
    pub fn element_size(&self, index: usize) -> usize {
        Self::element_size_of(index)
    }

    #[inline]
    fn element_size_of(index: usize) -> usize {
        (index + 1) * BLOCK_GRANULARITY
    }

    /// Number of blocks bucket `index` was created with, or 0 for an
    /// out-of-range index.
    pub fn elements_count(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, PoolBucket::capacity)
    }

    #[inline]
    pub fn buckets_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket owning `p`, by pure address arithmetic. None for foreign
    /// pointers.
    #[inline]
    fn find_bucket(&self, p: *mut u8) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        // Pointers below the buffer wrap to a huge offset and fail the
        // bound check.
        let offset = p.addr().wrapping_sub(self.buffer.addr());
        let index = offset / self.bucket_size_bytes;
        (index < self.buckets.len()).then_some(index)
    }

    /// Allocate `bytes` with the given `alignment`.
    ///
    /// `alignment` must be a power of two at most 16384 (asserted in debug
    /// builds; a documented precondition in release). Zero-size requests
    /// return the non-dereferenceable sentinel `alignment as *mut u8`.
    /// Returns null only when the pool regime is exhausted or skipped and
    /// the fallback failed.
    pub fn alloc(&self, bytes: usize, alignment: usize) -> *mut u8 {
        debug_assert!(
            alignment.is_power_of_two() && alignment <= MAX_VALID_ALIGNMENT,
            "alignment {alignment} must be a power of two <= {MAX_VALID_ALIGNMENT}"
        );

        if bytes == 0 {
            return ptr::without_provenance_mut(alignment);
        }

        let effective = bytes.max(alignment);
        let mut index = (effective - 1) >> 4;

        // Promote past classes whose size is not a multiple of the request
        // alignment; their block addresses could not satisfy it.
        if alignment > BLOCK_GRANULARITY {
            while index < self.buckets.len()
                && !Self::element_size_of(index).is_multiple_of(alignment)
            {
                index += 1;
            }
        }

        if index < self.buckets.len() {
            let bucket = &self.buckets[index];
            if let Some(p) = cache::with_tls_bucket(index, |tls| tls.alloc(bucket)) {
                #[cfg(all(debug_assertions, not(loom)))]
                bucket.debug_acquire(p.as_ptr());
                #[cfg(feature = "stats")]
                bucket.stats.note_cache_hit();
                return p.as_ptr();
            }
        }

        while index < self.buckets.len() {
            let bucket = &self.buckets[index];
            if alignment > BLOCK_GRANULARITY
                && !Self::element_size_of(index).is_multiple_of(alignment)
            {
                index += 1;
                continue;
            }
            if let Some(p) = bucket.alloc() {
                #[cfg(all(debug_assertions, not(loom)))]
                bucket.debug_acquire(p.as_ptr());
                #[cfg(feature = "stats")]
                bucket.stats.note_hit();
                return p.as_ptr();
            }
            #[cfg(feature = "stats")]
            bucket.stats.note_miss();
            index += 1;
        }

        #[cfg(feature = "stats")]
        self.global_miss_count.fetch_add(1, Ordering::Relaxed);

        // Note: the fallback receives the original byte count, not the
        // alignment-promoted one.
        self.fallback.alloc(bytes, alignment)
    }

    /// Release a pointer obtained from this allocator.
    ///
    /// Null and zero-size sentinels are ignored; foreign pointers forward
    /// to the fallback.
    ///
    /// # Safety
    /// `p` must be null, a sentinel, or a live pointer returned by this
    /// allocator, and must not be used after this call.
    pub unsafe fn free(&self, p: *mut u8) {
        if !self.is_readable(p) {
            return;
        }

        if let Some(index) = self.find_bucket(p) {
            let bucket = &self.buckets[index];
            #[cfg(feature = "stats")]
            bucket.stats.note_free();
            #[cfg(all(debug_assertions, not(loom)))]
            bucket.debug_release(p);

            if !cache::with_tls_bucket(index, |tls| tls.release(bucket, p)) {
                bucket.free_interval(p, p);
            }
            return;
        }

        // Safety: foreign pointers came from the fallback.
        unsafe { self.fallback.free(p) };
    }

    /// Resize an allocation.
    ///
    /// Pool pointers shrink in place (the same pointer is returned) and
    /// grow by allocate + copy + free. Like C `realloc`, calling this
    /// concurrently with any other use of `p` — including the shrink path,
    /// which momentarily releases the block before returning it — is the
    /// caller's race to lose.
    ///
    /// # Safety
    /// `p` must be null, a sentinel, or a live pointer returned by this
    /// allocator.
    pub unsafe fn realloc(&self, p: *mut u8, bytes: usize, alignment: usize) -> *mut u8 {
        if p.is_null() {
            return self.alloc(bytes, alignment);
        }

        if let Some(index) = self.find_bucket(p) {
            let element_size = Self::element_size_of(index);

            if bytes <= element_size {
                // Shrink in place: discard and return the same block. The
                // block transits the free tier here, so an interleaved
                // same-class alloc can re-acquire it while the caller still
                // holds it; see the method docs.
                // Safety: p is a live pool pointer.
                unsafe { self.free(p) };
                // Keep the caller registered as the owner so their eventual
                // free is not misread as a double free.
                #[cfg(all(debug_assertions, not(loom)))]
                self.buckets[index].debug_acquire(p);
                return p;
            }

            let fresh = self.alloc(bytes, alignment);
            if fresh.is_null() {
                return ptr::null_mut(); // old allocation stays live
            }
            // Safety: both blocks are at least element_size bytes.
            unsafe {
                ptr::copy(p, fresh, element_size);
                self.free(p);
            }
            return fresh;
        }

        if bytes == 0 {
            if self.is_readable(p) {
                // Safety: foreign pointers came from the fallback.
                unsafe { self.fallback.free(p) };
            }
            return ptr::without_provenance_mut(alignment);
        }

        if !self.is_readable(p) {
            return self.fallback.alloc(bytes, alignment);
        }

        // Safety: foreign pointers came from the fallback.
        unsafe { self.fallback.realloc(p, bytes, alignment) }
    }

    /// Usable bytes behind `p`: the bucket's element size for pool
    /// pointers, the fallback's answer for foreign ones, 0 for sentinels.
    ///
    /// # Safety
    /// `p` must be null, a sentinel, or a live pointer returned by this
    /// allocator.
    pub unsafe fn usable_size(&self, p: *mut u8) -> usize {
        if !self.is_readable(p) {
            return 0;
        }

        if let Some(index) = self.find_bucket(p) {
            return Self::element_size_of(index);
        }

        // Safety: foreign pointers came from the fallback.
        unsafe { self.fallback.usable_size(p) }
    }

    /// True when `p` lies inside the pool's backing buffer.
    #[inline]
    pub fn is_pool_pointer(&self, p: *mut u8) -> bool {
        p.addr() >= self.buffer.addr() && p.addr() < self.buffer_end.addr()
    }

    /// Index of the bucket owning `p`, or -1 for foreign and sentinel
    /// pointers. Never dereferences `p`.
    pub fn bucket_index(&self, p: *mut u8) -> i32 {
        if !self.is_readable(p) || !self.is_pool_pointer(p) {
            return -1;
        }
        match self.find_bucket(p) {
            Some(index) => index as i32,
            None => -1,
        }
    }

    /// Build the calling thread's L0/L1 cache, optionally pre-warming it
    /// from the master lists. `cache_size_bytes` is split evenly across
    /// buckets (4 bytes per cached block, floor of [`crate::L0_CAPACITY`]
    /// entries each).
    pub fn create_thread_cache(&self, warmup: CacheWarmup, cache_size_bytes: usize) {
        cache::create_thread_cache(&self.buckets, &*self.fallback, warmup, cache_size_bytes);
    }

    /// Tear down the calling thread's cache, returning every pending block
    /// to the master lists. Must be called on each thread that created a
    /// cache, before the allocator is dropped.
    pub fn destroy_thread_cache(&self) {
        cache::destroy_thread_cache(&self.buckets, &*self.fallback);
    }

    /// Counters for bucket `index`, or None when out of range.
    #[cfg(feature = "stats")]
    pub fn bucket_stats(&self, index: usize) -> Option<&BucketStats> {
        self.buckets.get(index).map(|bucket| &bucket.stats)
    }

    /// Requests the pool regime could not serve at all.
    #[cfg(feature = "stats")]
    pub fn global_miss_count(&self) -> usize {
        self.global_miss_count.load(Ordering::Relaxed)
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn bucket(&self, index: usize) -> &PoolBucket {
        &self.buckets[index]
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if !self.buffer.is_null() {
            // Safety: the buffer came from this fallback in with_fallback.
            unsafe { self.fallback.free(self.buffer) };
        }
    }
}

fn prev_power_of_two(v: usize) -> usize {
    debug_assert!(v > 0);
    1 << (usize::BITS - 1 - v.leading_zeros())
}
