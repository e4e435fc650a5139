pub(crate) mod allocator;
pub(crate) mod bucket;
pub(crate) mod cache;
pub(crate) mod fallback;
pub(crate) mod ffi;
pub(crate) mod integration;
#[cfg(feature = "stats")]
pub(crate) mod stats;

/// Hard limit on the number of size classes.
pub const MAX_BUCKET_COUNT: usize = 64;

/// Largest alignment any entry point accepts. Pointer values at or below
/// this are reserved as zero-size-allocation sentinels.
pub const MAX_VALID_ALIGNMENT: usize = 16384;

/// Size-class granularity: bucket `i` serves `16 * (i + 1)`-byte blocks.
pub const BLOCK_GRANULARITY: usize = 16;

pub(crate) const CACHE_LINE_SIZE: usize = 64;
