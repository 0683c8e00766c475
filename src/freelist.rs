//! Shared free-list heap: address-ordered first-fit with adjacency coalescing.

use core::{
  cell::UnsafeCell,
  hint,
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use crate::page::{PAGE_SIZE, PageSource};
use crate::stats::{HeapStats, StatsRegistry};

/// Size field stored immediately before every payload pointer. Records the
/// whole block width, header included; the large path records the
/// page-rounded mapped width instead.
const HEADER_SIZE: usize = size_of::<usize>();

/// Smallest block that can be rebuilt as a [`FreeNode`] on release.
const MIN_NODE_SIZE: usize = size_of::<FreeNode>();

const _: () = assert!(MIN_NODE_SIZE >= HEADER_SIZE);
const _: () = assert!(MIN_NODE_SIZE < PAGE_SIZE);

/// Reclaimed block, reinterpreted in place. No separate metadata allocation.
#[repr(C)]
struct FreeNode {
  size: usize,
  next: *mut FreeNode,
}

// =============================================================================
// Spin lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// Free list
// =============================================================================

/// Singly-linked list of free blocks, kept in strictly ascending address
/// order. All methods run under the owning allocator's lock.
struct FreeList {
  head: *mut FreeNode,
}

impl FreeList {
  const fn new() -> Self {
    Self { head: null_mut() }
  }

  /// Links `node` at its address-ordered position.
  unsafe fn insert(&mut self, node: *mut FreeNode) {
    unsafe {
      if self.head.is_null() || node < self.head {
        (*node).next = self.head;
        self.head = node;
        return;
      }

      let mut prev = self.head;
      while !(*prev).next.is_null() && (*prev).next < node {
        prev = (*prev).next;
      }
      (*node).next = (*prev).next;
      (*prev).next = node;
    }
  }

  /// First-fit search. Unlinks and returns the first block of at least
  /// `required` bytes; a large enough trailing remainder goes back into the
  /// list as a fresh node, a narrower one is left behind as internal waste.
  unsafe fn take_first_fit(&mut self, required: usize) -> Option<*mut u8> {
    unsafe {
      let mut prev: *mut FreeNode = null_mut();
      let mut node = self.head;

      while !node.is_null() {
        if (*node).size >= required {
          if prev.is_null() {
            self.head = (*node).next;
          } else {
            (*prev).next = (*node).next;
          }

          let excess = (*node).size - required;
          if excess > HEADER_SIZE + MIN_NODE_SIZE {
            let rest = (node as *mut u8).add(required) as *mut FreeNode;
            (*rest).size = excess;
            self.insert(rest);
          }

          return Some(node as *mut u8);
        }

        prev = node;
        node = (*node).next;
      }

      None
    }
  }

  /// Merges every pair of nodes whose regions touch, repeating until a full
  /// pass merges nothing. Handles runs of three or more adjacent nodes.
  unsafe fn coalesce(&mut self) {
    unsafe {
      loop {
        let mut merged = false;
        let mut node = self.head;

        while !node.is_null() {
          let next = (*node).next;
          if !next.is_null() && (node as *mut u8).add((*node).size) == next as *mut u8 {
            (*node).size += (*next).size;
            (*node).next = (*next).next;
            merged = true;
            // Stay put: the widened node may now touch its new neighbor.
          } else {
            node = next;
          }
        }

        if !merged {
          return;
        }
      }
    }
  }

  unsafe fn len(&self) -> usize {
    let mut count = 0;
    let mut node = self.head;
    while !node.is_null() {
      count += 1;
      node = unsafe { (*node).next };
    }
    count
  }
}

// =============================================================================
// Allocator
// =============================================================================

/// Heap backed by one shared free list of reclaimed blocks.
///
/// Requests below one page are served by address-ordered first-fit search
/// over the list, splitting oversized hits; releases rebuild a free node in
/// place and merge physically adjacent neighbors. Requests of a page or more
/// map pages directly and unmap them on release, never touching the list.
/// Small-path pages are never returned to the kernel, even when empty.
///
/// Every instance is an independent heap with its own page counters; all
/// list traffic is serialized behind one internal lock, so a shared instance
/// may be used from any number of threads.
///
/// Releasing a pointer that did not come from the same instance, or
/// releasing one twice, is undefined behavior.
pub struct FreeListAllocator {
  lock: SpinLock,
  list: UnsafeCell<FreeList>,
  pages: PageSource,
  stats: StatsRegistry,
}

unsafe impl Send for FreeListAllocator {}
unsafe impl Sync for FreeListAllocator {}

impl FreeListAllocator {
  pub const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      list: UnsafeCell::new(FreeList::new()),
      pages: PageSource::new(),
      stats: StatsRegistry::new(),
    }
  }

  /// Returns a block of at least `size` usable bytes.
  ///
  /// `allocate(0)` is defined and yields a minimum-width block. Aborts the
  /// process if the kernel refuses a page mapping.
  pub fn allocate(&self, size: usize) -> NonNull<u8> {
    self.stats.count_alloc();

    let Some(total) = size.checked_add(HEADER_SIZE) else {
      panic!("allocation of {size} bytes overflows");
    };
    // Every block must later be wide enough to host a free node in place.
    let required = total.max(MIN_NODE_SIZE);

    if required >= PAGE_SIZE {
      return self.allocate_large(required);
    }

    self.lock.lock();
    let taken = unsafe { (*self.list.get()).take_first_fit(required) };
    self.lock.unlock();

    if let Some(block) = taken {
      return unsafe { Self::stamp(block, required) };
    }

    // Nothing fits: carve the front of a fresh page and return the tail to
    // the list when it can hold a node.
    let base = self.pages.acquire(1).as_ptr();
    if PAGE_SIZE - required >= MIN_NODE_SIZE {
      let rest = unsafe { base.add(required) } as *mut FreeNode;
      self.lock.lock();
      unsafe {
        (*rest).size = PAGE_SIZE - required;
        (*self.list.get()).insert(rest);
      }
      self.lock.unlock();
    }
    unsafe { Self::stamp(base, required) }
  }

  /// Returns `ptr`'s block to the heap.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by this instance's [`allocate`] or
  /// [`reallocate`] and must not have been released already.
  ///
  /// [`allocate`]: Self::allocate
  /// [`reallocate`]: Self::reallocate
  pub unsafe fn release(&self, ptr: *mut u8) {
    self.stats.count_free();

    let block = unsafe { ptr.sub(HEADER_SIZE) };
    let size = unsafe { *(block as *const usize) };

    if size < PAGE_SIZE {
      let node = block as *mut FreeNode;
      self.lock.lock();
      unsafe {
        (*node).size = size;
        let list = &mut *self.list.get();
        list.insert(node);
        list.coalesce();
      }
      self.lock.unlock();
    } else {
      // Large headers are page-rounded at allocation time, so the page count
      // falls out exactly.
      debug_assert_eq!(size % PAGE_SIZE, 0);
      unsafe { self.pages.release(block, size / PAGE_SIZE) };
    }
  }

  /// Moves `ptr`'s payload into a block of at least `new_size` bytes,
  /// preserving the first `min(old, new_size)` bytes.
  ///
  /// # Safety
  ///
  /// Same contract as [`release`](Self::release); `ptr` is consumed.
  pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> NonNull<u8> {
    let old_payload = unsafe { self.usable_size(ptr) };
    let new_ptr = self.allocate(new_size);
    unsafe {
      core::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_payload.min(new_size));
      self.release(ptr);
    }
    new_ptr
  }

  /// Usable payload width recorded behind `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this instance.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    unsafe { *(ptr.sub(HEADER_SIZE) as *const usize) - HEADER_SIZE }
  }

  /// Counter snapshot. Walks the free list for `free_length` on every call.
  pub fn stats(&self) -> HeapStats {
    self.lock.lock();
    let free_length = unsafe { (*self.list.get()).len() };
    self.lock.unlock();

    self.stats.snapshot(&self.pages, free_length)
  }

  /// Writes the counter snapshot to stderr.
  pub fn report(&self) {
    self.stats().report();
  }

  fn allocate_large(&self, required: usize) -> NonNull<u8> {
    let pages = required.div_ceil(PAGE_SIZE);
    let base = self.pages.acquire(pages).as_ptr();
    unsafe { Self::stamp(base, pages * PAGE_SIZE) }
  }

  #[inline]
  unsafe fn stamp(block: *mut u8, width: usize) -> NonNull<u8> {
    unsafe {
      (block as *mut usize).write(width);
      NonNull::new_unchecked(block.add(HEADER_SIZE))
    }
  }
}

impl Default for FreeListAllocator {
  fn default() -> Self {
    Self::new()
  }
}

// Small-path pages are deliberately never unmapped, so dropping an instance
// leaks whatever the kernel still holds for it.
