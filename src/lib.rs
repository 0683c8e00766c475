//! # mapalloc
//!
//! A user-space heap allocator built directly on the kernel's anonymous
//! page-mapping facility, with two independent designs behind one
//! allocate/release/reallocate contract:
//!
//! - [`FreeListAllocator`] — a shared heap over one address-ordered free
//!   list: first-fit search with block splitting, adjacency coalescing on
//!   release, and a direct `mmap` path for page-sized requests. Carries
//!   per-instance counters ([`HeapStats`]).
//! - [`BucketAllocator`] — per-thread power-of-two size-class pages filled
//!   by bump allocation; frees are zero-stamped tombstones reclaimed by a
//!   compaction sweep when a class page fills up.
//!
//! Neither design validates pointers: releasing something an allocator did
//! not hand out, releasing twice, or releasing a bucket chunk on the wrong
//! thread is undefined behavior by contract.
//!
//! ```
//! use mapalloc::FreeListAllocator;
//!
//! let heap = FreeListAllocator::new();
//! let ptr = heap.allocate(64);
//! unsafe {
//!   ptr.as_ptr().write_bytes(0xab, 64);
//!   heap.release(ptr.as_ptr());
//! }
//! assert_eq!(heap.stats().chunks_freed, 1);
//! ```
//!
//! With `--features c_api` the crate additionally exports the C
//! `malloc`/`free`/`calloc`/`realloc` symbols, backed by the bucket
//! allocator's per-thread fast path.

#![allow(clippy::missing_safety_doc)]

mod bucket;
mod freelist;
mod page;
mod stats;

pub use bucket::{BucketAllocator, CLASS_COUNT, MIN_CHUNK_SIZE};
pub use freelist::FreeListAllocator;
pub use page::PAGE_SIZE;
pub use stats::HeapStats;

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static C_HEAP: BucketAllocator = BucketAllocator::new();

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  C_HEAP.allocate(size).as_ptr()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  unsafe { C_HEAP.release(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return core::ptr::null_mut();
  };
  if total == 0 {
    return core::ptr::null_mut();
  }

  let ptr = C_HEAP.allocate(total);
  // Fresh pages arrive zeroed, but recycled chunks do not.
  unsafe { ptr.as_ptr().write_bytes(0, total) };
  ptr.as_ptr()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return C_HEAP.allocate(size).as_ptr();
  }

  if size == 0 {
    unsafe { C_HEAP.release(ptr) };
    return core::ptr::null_mut();
  }

  // The chunk header records the old usable width, so the copy is bounded
  // by the real old size rather than a caller guess.
  unsafe { C_HEAP.reallocate(ptr, size).as_ptr() }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  unsafe { C_HEAP.usable_size(ptr) }
}
