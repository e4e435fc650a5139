//! Per-bucket and global allocation counters (feature `stats`).
//!
//! All counters use `Relaxed` ordering: individual values are eventually
//! consistent and cross-counter snapshots may transiently disagree. This is
//! acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions; their absence (building without the feature) must
//! not change allocator behavior.

use crate::sync::atomic::{AtomicUsize, Ordering};

/// Hit/miss counters for one bucket.
pub struct BucketStats {
    cache_hit_count: AtomicUsize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
    free_count: AtomicUsize,
}

impl BucketStats {
    pub(crate) fn new() -> Self {
        Self {
            cache_hit_count: AtomicUsize::new(0),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
        }
    }

    /// Allocation served from the calling thread's L0/L1 cache.
    #[inline]
    pub(crate) fn note_cache_hit(&self) {
        self.cache_hit_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocation served by popping the master free list.
    #[inline]
    pub(crate) fn note_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop attempt that found the master list empty.
    #[inline]
    pub(crate) fn note_miss(&self) {
        self.miss_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Block returned to this bucket (cache or master).
    #[inline]
    pub(crate) fn note_free(&self) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit_count(&self) -> usize {
        self.cache_hit_count.load(Ordering::Relaxed)
    }

    pub fn hit_count(&self) -> usize {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> usize {
        self.miss_count.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }
}
