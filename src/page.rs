//! Kernel page mapping. The only place in the crate that talks to the OS.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

/// Unit of acquisition and release between the allocators and the kernel.
pub const PAGE_SIZE: usize = 4096;

const _: () = assert!(PAGE_SIZE.is_power_of_two());

/// Wraps anonymous `mmap`/`munmap` and counts pages in both directions.
///
/// Regions come back page-aligned and zero-filled. Mapping failure is
/// terminal: there is no retry or backpressure policy, so an out-of-memory
/// kernel response aborts the process.
pub struct PageSource {
  mapped: AtomicUsize,
  unmapped: AtomicUsize,
}

impl PageSource {
  pub const fn new() -> Self {
    Self {
      mapped: AtomicUsize::new(0),
      unmapped: AtomicUsize::new(0),
    }
  }

  /// Maps `pages` contiguous pages of zeroed memory.
  pub fn acquire(&self, pages: usize) -> NonNull<u8> {
    debug_assert!(pages > 0);

    let len = pages * PAGE_SIZE;
    let raw = unsafe {
      libc::mmap(
        null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if raw == libc::MAP_FAILED {
      panic!("page mmap of {pages} pages failed");
    }

    self.mapped.fetch_add(pages, Ordering::Relaxed);
    // MAP_FAILED is the only error sentinel; a successful mapping is never null.
    unsafe { NonNull::new_unchecked(raw as *mut u8) }
  }

  /// Unmaps `pages` pages starting at `base`.
  ///
  /// # Safety
  ///
  /// `base` must be the start of a region previously returned by
  /// [`acquire`](Self::acquire) covering at least `pages` pages, and the
  /// region must no longer be referenced.
  pub unsafe fn release(&self, base: *mut u8, pages: usize) {
    debug_assert!(pages > 0);
    debug_assert!(base as usize % PAGE_SIZE == 0);

    unsafe { libc::munmap(base.cast(), pages * PAGE_SIZE) };
    self.unmapped.fetch_add(pages, Ordering::Relaxed);
  }

  pub fn pages_mapped(&self) -> usize {
    self.mapped.load(Ordering::Relaxed)
  }

  pub fn pages_unmapped(&self) -> usize {
    self.unmapped.load(Ordering::Relaxed)
  }
}

impl Default for PageSource {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn acquire_is_page_aligned_and_zeroed() {
    let source = PageSource::new();
    let region = source.acquire(2);

    assert_eq!(region.as_ptr() as usize % PAGE_SIZE, 0);
    assert_eq!(source.pages_mapped(), 2);

    unsafe {
      for offset in [0, 1, PAGE_SIZE, 2 * PAGE_SIZE - 1] {
        assert_eq!(*region.as_ptr().add(offset), 0);
      }
      source.release(region.as_ptr(), 2);
    }

    assert_eq!(source.pages_unmapped(), 2);
  }
}
