//! Per-thread size-class heap: bump pages, tombstones, compaction.

use core::{
  cell::UnsafeCell,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
};

use crate::page::{PAGE_SIZE, PageSource};

/// Narrowest chunk handed out; smaller requests are clamped up to it.
pub const MIN_CHUNK_SIZE: usize = 16;

const MIN_CHUNK_LOG2: u32 = MIN_CHUNK_SIZE.trailing_zeros();

/// Power-of-two classes `16, 32, .. 2048`: the widest chunk whose header
/// still fits one page behind the bucket header.
pub const CLASS_COUNT: usize = 8;

/// Size field in front of every chunk; zero marks a tombstone.
const CHUNK_HEADER_SIZE: usize = size_of::<usize>();

const BUCKET_HEADER_SIZE: usize = size_of::<BucketHeader>();

const _: () = assert!(MIN_CHUNK_SIZE.is_power_of_two());
const _: () = assert!(
  BUCKET_HEADER_SIZE + CHUNK_HEADER_SIZE + class_width(CLASS_COUNT - 1) <= PAGE_SIZE
);
const _: () = assert!(
  BUCKET_HEADER_SIZE + CHUNK_HEADER_SIZE + class_width(CLASS_COUNT) > PAGE_SIZE
);
// Class widths and page-rounded large sizes must never collide in a header.
const _: () = assert!(class_width(CLASS_COUNT - 1) < PAGE_SIZE);

/// Sits at offset 0 of each class page, in front of the first chunk.
#[repr(C)]
struct BucketHeader {
  /// Occupied chunk slots, tombstones included until the next compaction.
  used: usize,
}

/// One thread's bucket slots, one lazily-mapped page per active class.
struct ThreadArena {
  buckets: [*mut BucketHeader; CLASS_COUNT],
}

thread_local! {
  static ARENA: UnsafeCell<ThreadArena> = const {
    UnsafeCell::new(ThreadArena {
      buckets: [null_mut(); CLASS_COUNT],
    })
  };
}

/// Page supply shared by every thread's arena; the only cross-thread state
/// in this allocator.
static BUCKET_PAGES: PageSource = PageSource::new();

fn with_arena<R>(f: impl FnOnce(&mut ThreadArena) -> R) -> R {
  ARENA.with(|cell| f(unsafe { &mut *cell.get() }))
}

#[inline(always)]
const fn class_width(index: usize) -> usize {
  MIN_CHUNK_SIZE << index
}

/// `ceil(log2(max(size, MIN_CHUNK_SIZE)))`, rebased so class 0 is the
/// minimum chunk. Indices past `CLASS_COUNT` take the direct-map path.
#[inline(always)]
fn class_index(size: usize) -> usize {
  let size = size.max(MIN_CHUNK_SIZE);
  let ceil_log2 = usize::BITS - (size - 1).leading_zeros();
  (ceil_log2 - MIN_CHUNK_LOG2) as usize
}

/// Heap of per-thread size-class buckets.
///
/// Every calling thread owns a private arena: one page per active
/// power-of-two class, filled by bump allocation. Releasing a chunk only
/// zero-stamps its header; the space comes back when the class page fills
/// up and a compaction sweep shifts live chunks down over the tombstones.
/// Requests wider than the largest class map pages directly.
///
/// A chunk must be released on the thread that allocated it: release and
/// compaction touch that thread's bucket state and nothing else. Moving a
/// chunk across threads and releasing it there is undefined behavior, not a
/// checked error. Arena pages are never returned to the kernel, including at
/// thread exit; only direct-mapped chunks are unmapped on release.
///
/// The handle itself is stateless; independent handles on one thread share
/// that thread's arena. There is no per-heap counter surface here — the
/// page supply is process-wide, so per-handle numbers would be meaningless.
pub struct BucketAllocator;

impl BucketAllocator {
  pub const fn new() -> Self {
    Self
  }

  /// Returns a chunk of the smallest class holding `size` bytes, or a
  /// direct mapping above the largest class. Aborts the process if the
  /// kernel refuses a page mapping.
  pub fn allocate(&self, size: usize) -> NonNull<u8> {
    let index = class_index(size);
    if index >= CLASS_COUNT {
      return allocate_large(size);
    }
    with_arena(|arena| unsafe { allocate_in_class(arena, index, size) })
  }

  /// Tombstones `ptr`'s chunk, or unmaps it on the direct-map path.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this allocator, released on the
  /// thread that allocated it (direct mappings may be released anywhere),
  /// and must not be released twice.
  pub unsafe fn release(&self, ptr: *mut u8) {
    unsafe {
      let header = ptr.sub(CHUNK_HEADER_SIZE) as *mut usize;
      let stored = *header;

      if stored >= PAGE_SIZE {
        BUCKET_PAGES.release(header as *mut u8, stored / PAGE_SIZE);
      } else {
        debug_assert!(stored.is_power_of_two() && stored >= MIN_CHUNK_SIZE);
        // No relinking and no reuse yet; compaction reclaims the slot.
        *header = 0;
      }
    }
  }

  /// Moves `ptr`'s payload into a fresh chunk of at least `new_size` bytes,
  /// preserving the first `min(old, new_size)` bytes.
  ///
  /// # Safety
  ///
  /// Same contract as [`release`](Self::release); `ptr` is consumed.
  pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> NonNull<u8> {
    let old_payload = unsafe { self.usable_size(ptr) };
    let new_ptr = self.allocate(new_size);
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_payload.min(new_size));
      self.release(ptr);
    }
    new_ptr
  }

  /// Usable payload width recorded behind `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this allocator.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    let stored = unsafe { *(ptr.sub(CHUNK_HEADER_SIZE) as *const usize) };
    if stored >= PAGE_SIZE {
      stored - CHUNK_HEADER_SIZE
    } else {
      stored
    }
  }
}

impl Default for BucketAllocator {
  fn default() -> Self {
    Self::new()
  }
}

/// True when slot `used` would start past the page's usable capacity.
#[inline]
fn class_page_full(used: usize, width: usize) -> bool {
  BUCKET_HEADER_SIZE + (used + 1) * width > PAGE_SIZE
}

unsafe fn allocate_in_class(arena: &mut ThreadArena, index: usize, size: usize) -> NonNull<u8> {
  if index >= CLASS_COUNT {
    // Every class from the original request upward was full.
    return allocate_large(size);
  }

  let mut page = arena.buckets[index];
  if page.is_null() {
    page = BUCKET_PAGES.acquire(1).as_ptr() as *mut BucketHeader;
    unsafe { (*page).used = 0 };
    arena.buckets[index] = page;
  }

  let width = CHUNK_HEADER_SIZE + class_width(index);
  unsafe {
    if class_page_full((*page).used, width) {
      compact(page, width);
      if class_page_full((*page).used, width) {
        return allocate_in_class(arena, index + 1, size);
      }
    }

    let used = (*page).used;
    let chunk = (page as *mut u8).add(BUCKET_HEADER_SIZE + used * width);
    (chunk as *mut usize).write(class_width(index));
    (*page).used = used + 1;
    NonNull::new_unchecked(chunk.add(CHUNK_HEADER_SIZE))
  }
}

/// Sweeps a class page up to the last occupied slot, closing every
/// tombstone gap by shifting the chunks behind it down one width.
unsafe fn compact(page: *mut BucketHeader, width: usize) {
  unsafe {
    let first = (page as *mut u8).add(BUCKET_HEADER_SIZE);
    let mut used = (*page).used;
    let mut slot = 0;

    while slot < used {
      let chunk = first.add(slot * width);
      if *(chunk as *const usize) == 0 {
        let tail = (used - slot - 1) * width;
        ptr::copy(chunk.add(width), chunk, tail);
        used -= 1;
        // Rescan this slot: the chunk shifted in may be a tombstone too.
      } else {
        slot += 1;
      }
    }

    (*page).used = used;
  }
}

fn allocate_large(size: usize) -> NonNull<u8> {
  let Some(total) = size.checked_add(CHUNK_HEADER_SIZE) else {
    panic!("allocation of {size} bytes overflows");
  };

  let pages = total.div_ceil(PAGE_SIZE);
  let base = BUCKET_PAGES.acquire(pages).as_ptr();
  unsafe {
    // Page-rounded width, always >= PAGE_SIZE and so never mistaken for a
    // class chunk on release.
    (base as *mut usize).write(pages * PAGE_SIZE);
    NonNull::new_unchecked(base.add(CHUNK_HEADER_SIZE))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::slice;

  const CLASS0_WIDTH: usize = CHUNK_HEADER_SIZE + MIN_CHUNK_SIZE;
  const CLASS0_CAPACITY: usize = (PAGE_SIZE - BUCKET_HEADER_SIZE) / CLASS0_WIDTH;

  fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
    let buf = unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) };
    for (i, byte) in buf.iter_mut().enumerate() {
      *byte = seed.wrapping_add(i as u8);
    }
  }

  fn check(ptr: NonNull<u8>, len: usize, seed: u8) {
    let buf = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
    for (i, byte) in buf.iter().enumerate() {
      assert_eq!(*byte, seed.wrapping_add(i as u8), "byte {i} disturbed");
    }
  }

  #[test]
  fn requests_round_up_to_their_class() {
    let heap = BucketAllocator::new();

    for (size, expected) in [(0, 16), (1, 16), (16, 16), (17, 32), (100, 128), (2048, 2048)] {
      let ptr = heap.allocate(size);
      unsafe {
        assert_eq!(heap.usable_size(ptr.as_ptr()), expected, "size {size}");
        heap.release(ptr.as_ptr());
      }
    }
  }

  #[test]
  fn chunks_bump_forward_within_a_class() {
    let heap = BucketAllocator::new();

    let a = heap.allocate(16);
    let b = heap.allocate(16);
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, CLASS0_WIDTH);

    // Strict bump between compactions: a freed slot is not reused while the
    // page still has headroom.
    unsafe { heap.release(a.as_ptr()) };
    let c = heap.allocate(16);
    assert_eq!(c.as_ptr() as usize - b.as_ptr() as usize, CLASS0_WIDTH);

    unsafe {
      heap.release(b.as_ptr());
      heap.release(c.as_ptr());
    }
  }

  #[test]
  fn compaction_reclaims_a_tombstoned_page() {
    let heap = BucketAllocator::new();

    let chunks: Vec<_> = (0..CLASS0_CAPACITY).map(|_| heap.allocate(16)).collect();
    let first = chunks[0];

    for chunk in &chunks {
      unsafe { heap.release(chunk.as_ptr()) };
    }

    // The page is full of tombstones; the next request sweeps them away and
    // bumps from the front again.
    let reused = heap.allocate(16);
    assert_eq!(reused, first);

    unsafe { heap.release(reused.as_ptr()) };
  }

  #[test]
  fn compaction_keeps_live_chunks_intact() {
    let heap = BucketAllocator::new();

    let chunks: Vec<_> = (0..CLASS0_CAPACITY).map(|_| heap.allocate(16)).collect();
    // Chunks live in one mmap'd page, so masking any of them finds its base.
    let page_base = chunks[0].as_ptr() as usize & !(PAGE_SIZE - 1);

    for (i, chunk) in chunks.iter().enumerate() {
      fill(*chunk, 16, i as u8);
    }

    // Tombstone every other chunk, then force a sweep by filling the page
    // back up. Survivors keep their payloads, at shifted addresses.
    for chunk in chunks.iter().step_by(2) {
      unsafe { heap.release(chunk.as_ptr()) };
    }
    let freed = chunks.len().div_ceil(2);
    let refills: Vec<_> = (0..freed).map(|_| heap.allocate(16)).collect();

    let survivors = chunks.iter().enumerate().filter(|(i, _)| i % 2 == 1);
    for (slot, (i, _)) in survivors.enumerate() {
      let payload = page_base + BUCKET_HEADER_SIZE + slot * CLASS0_WIDTH + CHUNK_HEADER_SIZE;
      check(NonNull::new(payload as *mut u8).unwrap(), 16, i as u8);
    }

    for chunk in refills {
      unsafe { heap.release(chunk.as_ptr()) };
    }
  }

  #[test]
  fn full_class_escalates_to_the_next_width() {
    let heap = BucketAllocator::new();

    // Pin the class-0 page completely full of live chunks.
    let pinned: Vec<_> = (0..CLASS0_CAPACITY).map(|_| heap.allocate(16)).collect();

    // Nothing to compact away, so the request lands in the 32-byte class.
    let escalated = heap.allocate(16);
    unsafe {
      assert_eq!(heap.usable_size(escalated.as_ptr()), 32);
      heap.release(escalated.as_ptr());
    }

    for chunk in pinned {
      unsafe { heap.release(chunk.as_ptr()) };
    }
  }

  #[test]
  fn oversized_requests_map_directly() {
    let heap = BucketAllocator::new();

    for size in [2049, 3000, PAGE_SIZE, 10_000] {
      let ptr = heap.allocate(size);
      let usable = unsafe { heap.usable_size(ptr.as_ptr()) };
      assert!(usable >= size, "size {size}: usable {usable}");

      fill(ptr, size, 0x7e);
      check(ptr, size, 0x7e);
      unsafe { heap.release(ptr.as_ptr()) };
    }
  }

  #[test]
  fn reallocate_preserves_payload_across_classes() {
    let heap = BucketAllocator::new();

    let small = heap.allocate(48);
    fill(small, 48, 0x11);

    let wider = unsafe { heap.reallocate(small.as_ptr(), 300) };
    check(wider, 48, 0x11);

    let direct = unsafe { heap.reallocate(wider.as_ptr(), 3 * PAGE_SIZE) };
    check(direct, 48, 0x11);

    let narrow = unsafe { heap.reallocate(direct.as_ptr(), 20) };
    check(narrow, 20, 0x11);

    unsafe { heap.release(narrow.as_ptr()) };
  }

  #[test]
  fn threads_do_not_disturb_each_other() {
    std::thread::scope(|scope| {
      for seed in [0x21u8, 0xc4] {
        scope.spawn(move || {
          let heap = BucketAllocator::new();
          let chunks: Vec<_> = (0..100).map(|_| heap.allocate(64)).collect();

          for (i, chunk) in chunks.iter().enumerate() {
            fill(*chunk, 64, seed.wrapping_add(i as u8));
          }
          // Interleave more traffic so the other thread is active too.
          for _ in 0..200 {
            let extra = heap.allocate(64);
            unsafe { heap.release(extra.as_ptr()) };
          }
          for (i, chunk) in chunks.iter().enumerate() {
            check(*chunk, 64, seed.wrapping_add(i as u8));
          }

          for chunk in chunks {
            unsafe { heap.release(chunk.as_ptr()) };
          }
        });
      }
    });
  }
}
