//! Allocation counters for the free-list heap.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::page::PageSource;

/// Monotonic chunk counters, owned by one [`FreeListAllocator`] instance.
///
/// Page traffic lives in that instance's [`PageSource`]; the free-list length
/// is recomputed by walking the list on every snapshot, never cached here.
///
/// [`FreeListAllocator`]: crate::FreeListAllocator
pub(crate) struct StatsRegistry {
  chunks_allocated: AtomicUsize,
  chunks_freed: AtomicUsize,
}

impl StatsRegistry {
  pub(crate) const fn new() -> Self {
    Self {
      chunks_allocated: AtomicUsize::new(0),
      chunks_freed: AtomicUsize::new(0),
    }
  }

  pub(crate) fn count_alloc(&self) {
    self.chunks_allocated.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn count_free(&self) {
    self.chunks_freed.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn snapshot(&self, pages: &PageSource, free_length: usize) -> HeapStats {
    HeapStats {
      pages_mapped: pages.pages_mapped(),
      pages_unmapped: pages.pages_unmapped(),
      chunks_allocated: self.chunks_allocated.load(Ordering::Relaxed),
      chunks_freed: self.chunks_freed.load(Ordering::Relaxed),
      free_length,
    }
  }
}

/// Point-in-time view of one free-list heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
  /// Pages obtained from the kernel over the heap's lifetime.
  pub pages_mapped: usize,
  /// Pages returned to the kernel (large-path releases only).
  pub pages_unmapped: usize,
  /// Total `allocate` calls.
  pub chunks_allocated: usize,
  /// Total `release` calls.
  pub chunks_freed: usize,
  /// Free-list node count at snapshot time.
  pub free_length: usize,
}

impl HeapStats {
  /// Renders the counters to stderr.
  pub fn report(&self) {
    eprintln!("\n== mapalloc heap stats ==");
    eprintln!("Mapped:   {}", self.pages_mapped);
    eprintln!("Unmapped: {}", self.pages_unmapped);
    eprintln!("Allocs:   {}", self.chunks_allocated);
    eprintln!("Frees:    {}", self.chunks_freed);
    eprintln!("Freelen:  {}", self.free_length);
  }
}
