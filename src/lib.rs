pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
pub mod pool;

// allocator facade
pub use pool::allocator::{Allocator, AllocatorConfig, PoolError};

// per-thread cache controls
pub use pool::cache::{CacheWarmup, L0_CAPACITY};

// fallback contract
pub use pool::fallback::{RawAllocator, SystemAllocator};

// C ABI surface
pub use pool::ffi::{
    FP_CACHE_COLD, FP_CACHE_HOT, FP_CACHE_WARM, fp_allocator_create, fp_allocator_destroy,
    fp_allocator_thread_cache_create, fp_allocator_thread_cache_destroy, fp_free, fp_malloc,
    fp_mbucket, fp_msize, fp_realloc,
};

// counters (feature "stats")
#[cfg(feature = "stats")]
pub use pool::stats::BucketStats;

// limits
pub use pool::{BLOCK_GRANULARITY, MAX_BUCKET_COUNT, MAX_VALID_ALIGNMENT};
