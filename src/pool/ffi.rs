//! C ABI façade.
//!
//! Exports the allocator as an opaque handle plus free functions, so engine
//! code in C/C++ can drive the pools directly. The lifecycle functions
//! (create/destroy and the thread-cache pair) tolerate a null handle; the
//! allocation functions require a live one but inherit the [`Allocator`]
//! sentinel rules, so null and zero-size sentinel *pointers* are accepted
//! everywhere and ignored.

use std::ffi::c_void;

use super::allocator::Allocator;
use super::cache::CacheWarmup;

/// `warmup` value for [`fp_allocator_thread_cache_create`]: start empty.
pub const FP_CACHE_COLD: i32 = 0;
/// `warmup` value: pre-fill half of each per-thread L1 array.
pub const FP_CACHE_WARM: i32 = 1;
/// `warmup` value: pre-fill L0 and L1 completely.
pub const FP_CACHE_HOT: i32 = 2;

fn warmup_from_raw(warmup: i32) -> CacheWarmup {
    match warmup {
        FP_CACHE_WARM => CacheWarmup::Warm,
        FP_CACHE_HOT => CacheWarmup::Hot,
        _ => CacheWarmup::Cold,
    }
}

/// Create an allocator with `buckets_count` size classes of
/// `bucket_size_bytes` each. Returns null on invalid configuration or
/// allocation failure.
///
/// The handle must be released with [`fp_allocator_destroy`].
#[unsafe(no_mangle)]
pub extern "C" fn fp_allocator_create(
    buckets_count: u32,
    bucket_size_bytes: usize,
) -> *mut Allocator {
    match Allocator::new(buckets_count, bucket_size_bytes) {
        Ok(allocator) => Box::into_raw(Box::new(allocator)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Destroy an allocator and release its backing buffer.
///
/// # Safety
///
/// `allocator` must be null or a handle from [`fp_allocator_create`] that
/// has not been destroyed. Every thread cache created against it must have
/// been destroyed first, and no pool pointer may be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fp_allocator_destroy(allocator: *mut Allocator) {
    if allocator.is_null() {
        return;
    }
    // Safety: the handle came from Box::into_raw in fp_allocator_create.
    drop(unsafe { Box::from_raw(allocator) });
}

/// Build the calling thread's cache. `warmup` is one of
/// [`FP_CACHE_COLD`], [`FP_CACHE_WARM`], [`FP_CACHE_HOT`] (unknown values
/// fall back to cold); `cache_size` is the per-thread cache budget in
/// bytes.
///
/// # Safety
///
/// `allocator` must be null or a live handle from [`fp_allocator_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fp_allocator_thread_cache_create(
    allocator: *mut Allocator,
    warmup: i32,
    cache_size: usize,
) {
    if allocator.is_null() {
        return;
    }
    // Safety: live handle per contract.
    unsafe { &*allocator }.create_thread_cache(warmup_from_raw(warmup), cache_size);
}

/// Tear down the calling thread's cache, returning pending blocks to the
/// master lists.
///
/// # Safety
///
/// `allocator` must be null or a live handle from [`fp_allocator_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fp_allocator_thread_cache_destroy(allocator: *mut Allocator) {
    if allocator.is_null() {
        return;
    }
    // Safety: live handle per contract.
    unsafe { &*allocator }.destroy_thread_cache();
}

/// Allocate `bytes` with the given power-of-two `alignment` (at most
/// 16384). Zero-size requests return the sentinel `alignment` cast to a
/// pointer; null is returned only on exhaustion.
///
/// # Safety
///
/// `allocator` must be a live handle from [`fp_allocator_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fp_malloc(
    allocator: *mut Allocator,
    bytes: usize,
    alignment: usize,
) -> *mut c_void {
    // Safety: live handle per contract.
    unsafe { &*allocator }.alloc(bytes, alignment).cast()
}

/// Release a pointer obtained from this allocator. Null and sentinel
/// values are ignored.
///
/// # Safety
///
/// `allocator` must be a live handle; `p` must be null, a sentinel, or a
/// live pointer from this allocator, and must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fp_free(allocator: *mut Allocator, p: *mut c_void) {
    // Safety: live handle and pointer per contract.
    unsafe { (*allocator).free(p.cast()) }
}

/// Resize an allocation. Follows C `realloc` conventions plus the pool's
/// shrink-in-place rule (shrinking a pool block returns the same pointer).
///
/// # Safety
///
/// `allocator` must be a live handle; `p` must be null, a sentinel, or a
/// live pointer from this allocator. Reallocating a pointer concurrently
/// with any other use of it is undefined.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fp_realloc(
    allocator: *mut Allocator,
    p: *mut c_void,
    bytes: usize,
    alignment: usize,
) -> *mut c_void {
    // Safety: live handle and pointer per contract.
    unsafe { (*allocator).realloc(p.cast(), bytes, alignment) }.cast()
}

/// Usable bytes behind `p`: the element size for pool pointers, the
/// fallback's answer for foreign ones, 0 for null and sentinels.
///
/// # Safety
///
/// `allocator` must be a live handle; `p` must be null, a sentinel, or a
/// live pointer from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fp_msize(allocator: *mut Allocator, p: *mut c_void) -> usize {
    // Safety: live handle and pointer per contract.
    unsafe { (*allocator).usable_size(p.cast()) }
}

/// Index of the bucket owning `p`, or -1 for foreign, null and sentinel
/// pointers. Never dereferences `p`.
///
/// # Safety
///
/// `allocator` must be a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fp_mbucket(allocator: *mut Allocator, p: *mut c_void) -> i32 {
    // Safety: live handle per contract.
    unsafe { &*allocator }.bucket_index(p.cast())
}
