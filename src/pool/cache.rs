use std::ptr::{self, NonNull};

use super::MAX_BUCKET_COUNT;
use super::bucket::{PoolBucket, TaggedIndex};
use super::fallback::RawAllocator;
use crate::sync::cell::UnsafeCell;

/// Entries in the inline L0 array. Sized so [`TlsBucket`] stays within one
/// cache line on either pointer width.
#[cfg(target_pointer_width = "64")]
pub const L0_CAPACITY: usize = 7;
#[cfg(not(target_pointer_width = "64"))]
pub const L0_CAPACITY: usize = 10;

/// Pre-population policy for a freshly created thread cache.
///
/// A cold cache starts empty and fills organically from free traffic; the
/// warm and hot options pre-pop blocks from the master bucket so the first
/// allocation burst after creation does not miss into the shared list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheWarmup {
    /// Start empty.
    Cold,
    /// Pre-fill half of each bucket's L1 array.
    Warm,
    /// Pre-fill all of L0 and all of L1.
    Hot,
}

/// Per-(thread, bucket) cache record.
///
/// Two tiers: `l0` is a small inline stack, `l1` points into a per-thread
/// array shared by all buckets and carved from one fallback allocation.
/// Both store 32-bit block offsets from `bucket_data`. The record is plain
/// old data so the TLS table can be zero-initialized and bulk-reset.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct TlsBucket {
    bucket_data: *mut u8,
    bucket: *const PoolBucket,
    l1: *mut u32,
    max_l1: u32,
    n_l1: u32,
    l0: [u32; L0_CAPACITY],
    n_l0: u8,
}

// The record must fit a cache line; L0_CAPACITY is chosen per target to
// keep it there.
const _: () = assert!(std::mem::size_of::<TlsBucket>() <= 64);

impl TlsBucket {
    const EMPTY: Self = Self {
        bucket_data: ptr::null_mut(),
        bucket: ptr::null(),
        l1: ptr::null_mut(),
        max_l1: 0,
        n_l1: 0,
        l0: [0; L0_CAPACITY],
        n_l0: 0,
    };

    /// Pop from L0, then L1. `bucket` identifies the caller's allocator; a
    /// record bound elsewhere (or not at all) reports a miss instead of
    /// handing out another allocator's blocks.
    #[inline]
    pub(crate) fn alloc(&mut self, bucket: &PoolBucket) -> Option<NonNull<u8>> {
        if !ptr::eq(self.bucket, bucket) {
            return None;
        }

        if self.n_l0 > 0 {
            self.n_l0 -= 1;
            let offset = self.l0[self.n_l0 as usize];
            // Safety: cached offsets lie inside the bucket region.
            return NonNull::new(unsafe { self.bucket_data.add(offset as usize) });
        }

        if self.n_l1 > 0 {
            self.n_l1 -= 1;
            // Safety: n_l1 < max_l1, inside this record's L1 slice.
            let offset = unsafe { self.l1.add(self.n_l1 as usize).read() };
            // Safety: cached offsets lie inside the bucket region.
            return NonNull::new(unsafe { self.bucket_data.add(offset as usize) });
        }

        None
    }

    /// Take a freed block into the cache. Returns false when this thread
    /// has no cache for `bucket`, in which case the caller frees to the
    /// master list. When both tiers are full, half of L1 spills to the
    /// master as one chain and the block takes the vacated slot.
    #[inline]
    pub(crate) fn release(&mut self, bucket: &PoolBucket, p: *mut u8) -> bool {
        if self.max_l1 == 0 || !ptr::eq(self.bucket, bucket) {
            return false;
        }

        debug_assert!(bucket.contains(p));
        let offset = (p.addr() - self.bucket_data.addr()) as u32;

        if (self.n_l0 as usize) < L0_CAPACITY {
            self.l0[self.n_l0 as usize] = offset;
            self.n_l0 += 1;
            return true;
        }

        if self.n_l1 < self.max_l1 {
            // Safety: n_l1 < max_l1, inside this record's L1 slice.
            unsafe { self.l1.add(self.n_l1 as usize).write(offset) };
            self.n_l1 += 1;
            return true;
        }

        self.return_l1_to_master(self.n_l1 >> 1);
        // Safety: the spill vacated at least one slot.
        unsafe { self.l1.add(self.n_l1 as usize).write(offset) };
        self.n_l1 += 1;
        true
    }

    /// Spill the newest `count` L1 entries back to the master bucket as a
    /// single pre-linked chain.
    ///
    /// Entries are linked in ascending index order; interior links receive
    /// sequential throwaway tags (only the published head's tag matters for
    /// ABA). The last entry becomes the chain tail and `free_interval`
    /// overwrites its link with the observed master head.
    pub(crate) fn return_l1_to_master(&mut self, count: u32) {
        if count == 0 || self.n_l1 == 0 {
            return;
        }
        let count = count.min(self.n_l1);

        let first = (self.n_l1 - count) as usize;
        // Safety: indexes below n_l1 are initialized.
        let head_offset = unsafe { self.l1.add(first).read() };
        // Safety: cached offsets lie inside the bucket region.
        let head = unsafe { self.bucket_data.add(head_offset as usize) };
        let mut prev = head;

        let mut local_tag: u32 = 0x00FF_FFFF;
        for i in (first + 1)..self.n_l1 as usize {
            // Safety: i < n_l1.
            let offset = unsafe { self.l1.add(i).read() };
            // Safety: prev is a cached block we exclusively own.
            unsafe { super::bucket::store_link(prev, TaggedIndex::new(local_tag, offset)) };
            // Safety: cached offsets lie inside the bucket region.
            prev = unsafe { self.bucket_data.add(offset as usize) };
            local_tag = local_tag.wrapping_add(1);
        }

        // Safety: the record is only live while its allocator is.
        unsafe { &*self.bucket }.free_interval(head, prev);
        self.n_l1 -= count;
    }

    #[inline]
    pub(crate) fn cached_count(&self) -> u32 {
        self.n_l1 + u32::from(self.n_l0)
    }
}

// ---------------------------------------------------------------------------
// Per-thread table
// ---------------------------------------------------------------------------

// One record per bucket index. Only ever touched by the owning thread; the
// facade's closures never re-enter the table (they only poke bucket
// atomics), so handing out `&mut` from the UnsafeCell is sound.
thread_local! {
    static TLS_BUCKETS: UnsafeCell<[TlsBucket; MAX_BUCKET_COUNT]> =
        UnsafeCell::new([TlsBucket::EMPTY; MAX_BUCKET_COUNT]);
}

/// Run `f` with the calling thread's record for bucket `index`.
#[inline]
pub(crate) fn with_tls_bucket<R>(index: usize, f: impl FnOnce(&mut TlsBucket) -> R) -> R {
    TLS_BUCKETS.with(|cell| {
        // Safety: single-threaded TLS access; f does not re-enter the table.
        let table = crate::sync::unsafe_cell_get_mut!(cell);
        f(&mut table[index])
    })
}

/// Build this thread's cache for every bucket of `buckets`.
///
/// One contiguous offset array sized `cache_size_bytes` (subject to a
/// per-bucket floor of [`L0_CAPACITY`] entries) is taken from the fallback
/// and split evenly between the buckets. Re-creating an existing cache is a
/// no-op.
pub(crate) fn create_thread_cache(
    buckets: &[PoolBucket],
    fallback: &dyn RawAllocator,
    warmup: CacheWarmup,
    cache_size_bytes: usize,
) {
    if buckets.is_empty() {
        return;
    }

    let per_bucket =
        (cache_size_bytes / std::mem::size_of::<u32>() / buckets.len()).max(L0_CAPACITY) as u32;
    let total_bytes = per_bucket as usize * buckets.len() * std::mem::size_of::<u32>();

    TLS_BUCKETS.with(|cell| {
        // Safety: single-threaded TLS access; nothing below re-enters the
        // table (warmup only pops bucket atomics).
        let table = crate::sync::unsafe_cell_get_mut!(cell);

        if !table[0].bucket.is_null() {
            debug_assert!(
                false,
                "thread cache already exists for this thread; destroy it first"
            );
            return;
        }

        let storage = fallback.alloc(total_bytes, super::CACHE_LINE_SIZE).cast::<u32>();
        if storage.is_null() {
            return; // no cache; every request goes straight to the master
        }

        for (i, bucket) in buckets.iter().enumerate() {
            let record = &mut table[i];
            *record = TlsBucket {
                bucket_data: bucket.data(),
                bucket,
                // Safety: i * per_bucket < total entries.
                l1: unsafe { storage.add(i * per_bucket as usize) },
                max_l1: per_bucket,
                n_l1: 0,
                l0: [0; L0_CAPACITY],
                n_l0: 0,
            };

            let (l0_target, l1_target) = match warmup {
                CacheWarmup::Cold => (0, 0),
                CacheWarmup::Warm => (0, per_bucket / 2),
                CacheWarmup::Hot => (L0_CAPACITY as u32, per_bucket),
            };

            // Pre-pop from the master until the targets are met or the
            // bucket runs dry.
            while u32::from(record.n_l0) < l0_target {
                let Some(p) = bucket.alloc() else { break };
                record.l0[record.n_l0 as usize] = (p.as_ptr().addr() - record.bucket_data.addr()) as u32;
                record.n_l0 += 1;
            }
            while record.n_l1 < l1_target {
                let Some(p) = bucket.alloc() else { break };
                let offset = (p.as_ptr().addr() - record.bucket_data.addr()) as u32;
                // Safety: n_l1 < max_l1.
                unsafe { record.l1.add(record.n_l1 as usize).write(offset) };
                record.n_l1 += 1;
            }
        }
    });
}

/// Tear down this thread's cache for `buckets`: every pending block goes
/// back to its master list and the shared offset array returns to the
/// fallback. Records bound to a different allocator are left alone.
pub(crate) fn destroy_thread_cache(buckets: &[PoolBucket], fallback: &dyn RawAllocator) {
    if buckets.is_empty() {
        return;
    }

    TLS_BUCKETS.with(|cell| {
        // Safety: single-threaded TLS access; spills only poke bucket
        // atomics.
        let table = crate::sync::unsafe_cell_get_mut!(cell);

        if !ptr::eq(table[0].bucket, &buckets[0]) {
            return;
        }
        let storage = table[0].l1;

        for i in 0..buckets.len() {
            let record = &mut table[i];

            record.return_l1_to_master(record.n_l1);

            // Stage L0 through the (now empty) L1 slice so it rides the
            // same chain-spill path. max_l1 >= L0_CAPACITY by construction.
            let pending = record.n_l0;
            for k in 0..pending {
                // Safety: k < L0_CAPACITY <= max_l1.
                unsafe { record.l1.add(k as usize).write(record.l0[k as usize]) };
            }
            record.n_l0 = 0;
            record.n_l1 = u32::from(pending);
            record.return_l1_to_master(record.n_l1);

            *record = TlsBucket::EMPTY;
        }

        // Safety: storage came from this fallback in create_thread_cache.
        unsafe { fallback.free(storage.cast()) };
    });
}
