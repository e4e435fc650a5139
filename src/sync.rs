// Unified synchronization primitive shim.
//
// Under `cfg(loom)`, re-exports from `loom` so the lock-free bucket can be
// model checked.  Otherwise, re-exports from `std`, except `AtomicU64` which
// comes from `portable_atomic`: the tagged free-list head is a 64-bit word
// even on 32-bit targets, where std's `AtomicU64` may not exist.
//
// **Every** file in the crate must import sync primitives through this
// module.  A single direct `use std::sync::atomic::*` would bypass loom's
// scheduler and silently break exhaustive testing.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use portable_atomic::AtomicU64;
}

// ---------------------------------------------------------------------------
// sync (Mutex, Arc)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// cell (UnsafeCell)
//
// loom's UnsafeCell differs from std: `.get()` returns a `ConstPtr<T>`
// wrapper instead of `*mut T`.  Use `unsafe_cell_get_mut!` to write code
// that compiles under both.
// ---------------------------------------------------------------------------
pub(crate) mod cell {
    #[cfg(loom)]
    pub(crate) use loom::cell::UnsafeCell;

    #[cfg(not(loom))]
    pub(crate) use std::cell::UnsafeCell;
}

/// Access the contents of an `UnsafeCell` as `&mut T`.
///
/// Under std: `&mut *cell.get()`
/// Under loom: `cell.with_mut(|p| &mut *p)`
///
/// # Safety
/// Caller must guarantee exclusive access (same as `UnsafeCell::get`).
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: upheld by caller.
            unsafe { &mut *$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: upheld by caller.
            unsafe { $cell.with_mut(|p| &mut *p) }
        }
    }};
}
pub(crate) use unsafe_cell_get_mut;

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, spawn, yield_now};
}
