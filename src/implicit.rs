//! Implicit-list allocator with a next-fit rover.
//!
//! The simplest of the three variants: free blocks carry no links at all.
//! Finding a fit walks the block sequence itself, using each header's size
//! to hop to the next block, and resumes where the previous search left
//! off:
//!
//! ```text
//!                      rover
//!                        │
//!                        ▼
//!   ┌──────┬─────┬─────┬─────┬───────────┬─────┬──────────┬───┐
//!   │ prol │  A  │  F  │  A  │     F     │  A  │    F     │epi│
//!   └──────┴─────┴─────┴─────┴───────────┴─────┴──────────┴───┘
//!                        └──── search ────►
//!
//!   A = allocated, F = free. The search wraps to the heap start only
//!   after a miss; the rover also follows the survivor of every coalesce.
//! ```
//!
//! Next fit trades utilization for speed: no index to maintain, but every
//! search pays for walking over allocated blocks.

use std::ptr;

use crate::block::{self, BlockPtr, HeapStats};
use crate::header::{self, Header};
use crate::mem::{self, MemorySystem};
use crate::{DWORD, MIN_BLOCK, WORD, align};

/// Heap extension granularity: 4 KiB.
const CHUNK: usize = 1 << 12;

/// Implicit-list allocator. See the module docs for the search policy.
pub struct ImplicitAllocator {
  mem: MemorySystem,
  /// Prologue payload; the heap walk starts here.
  first: BlockPtr,
  /// Next-fit resume position.
  rover: BlockPtr,
}

impl ImplicitAllocator {
  /// Sets up a heap over the default-sized reservation.
  pub fn new() -> Option<Self> {
    Self::with_capacity(mem::MAX_HEAP)
  }

  /// Sets up a heap bounded by `capacity` bytes: writes the sentinel
  /// blocks and seeds the heap with one [`CHUNK`]-sized free block.
  /// Returns `None` only if the memory system refuses.
  pub fn with_capacity(capacity: usize) -> Option<Self> {
    let mut mem = MemorySystem::with_capacity(capacity)?;
    let base = mem.extend(4 * WORD);
    if base.is_null() {
      return None;
    }

    unsafe {
      (base as *mut u32).write(0); // alignment padding
      header::store(base.add(WORD) as *mut u32, Header::new(DWORD, true)); // prologue header
      header::store(base.add(2 * WORD) as *mut u32, Header::new(DWORD, true)); // prologue footer
      header::store(base.add(3 * WORD) as *mut u32, Header::new(0, true)); // epilogue

      let first = BlockPtr(base.add(2 * WORD));
      let mut heap = Self { mem, first, rover: first };
      heap.extend_heap(CHUNK / WORD)?;
      Some(heap)
    }
  }

  /// Allocates at least `size` bytes and returns an 8-byte-aligned pointer
  /// to them, or null when `size` is zero or the heap cannot grow any
  /// further.
  ///
  /// # Safety
  ///
  /// The allocator's heap must not be mutated behind its back; the
  /// returned region is exclusively the caller's until passed to
  /// [`deallocate`](Self::deallocate) or [`reallocate`](Self::reallocate).
  pub unsafe fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      if size == 0 {
        return ptr::null_mut();
      }

      // Round up to a full block: payload + 8 bytes of boundary tags,
      // never below the minimum block.
      let asize = if size <= DWORD { MIN_BLOCK } else { align!(size + DWORD) };

      if let Some(bp) = self.find_fit(asize) {
        self.place(bp, asize);
        return bp.payload();
      }

      let Some(bp) = self.extend_heap(asize.max(CHUNK) / WORD) else {
        return ptr::null_mut();
      };
      self.place(bp, asize);
      bp.payload()
    }
  }

  /// Returns a block to the heap and merges it with free neighbors.
  ///
  /// # Safety
  ///
  /// `ptr` must be a non-null pointer previously returned by this
  /// allocator and not released since.
  pub unsafe fn deallocate(
    &mut self,
    ptr: *mut u8,
  ) {
    unsafe {
      let bp = BlockPtr(ptr);
      let size = bp.size();
      bp.write(size, false);
      self.coalesce(bp);
    }
  }

  /// Resizes a previous allocation. Null `ptr` behaves as
  /// [`allocate`](Self::allocate); `size == 0` behaves as
  /// [`deallocate`](Self::deallocate) and returns null. Otherwise the
  /// payload prefix is preserved; the block grows in place into a free
  /// successor when possible and is relocated by copy otherwise.
  ///
  /// # Safety
  ///
  /// Same contract as [`deallocate`](Self::deallocate); the old pointer is
  /// invalidated unless it is itself returned.
  pub unsafe fn reallocate(
    &mut self,
    old: *mut u8,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      if old.is_null() {
        return self.allocate(size);
      }
      if size == 0 {
        self.deallocate(old);
        return ptr::null_mut();
      }

      let bp = BlockPtr(old);
      let asize = if size <= DWORD { MIN_BLOCK } else { align!(size + DWORD) };
      let csize = bp.size();

      // Already large enough: keep the surplus attached rather than
      // splitting off a sliver.
      if asize <= csize {
        return old;
      }

      // Grow in place when the successor is free and covers the deficit.
      let next = bp.next();
      if !next.is_allocated() && csize + next.size() >= asize {
        let total = csize + next.size();
        if total - asize >= MIN_BLOCK {
          bp.write(asize, true);
          let rest = bp.next();
          rest.write(total - asize, false);
          self.coalesce(rest);
        } else {
          bp.write(total, true);
          self.rover = bp;
        }
        return old;
      }

      // Relocate: fresh block, copy the old payload, release the original.
      let newp = self.allocate(size);
      if newp.is_null() {
        return ptr::null_mut();
      }
      let copy = size.min(csize - DWORD);
      log::trace!("relocating {copy}-byte payload during resize");
      ptr::copy_nonoverlapping(old, newp, copy);
      self.deallocate(old);
      newp
    }
  }

  fn extend_heap(
    &mut self,
    words: usize,
  ) -> Option<BlockPtr> {
    unsafe {
      // An even word count keeps block sizes multiples of 8.
      let size = if words % 2 == 1 { (words + 1) * WORD } else { words * WORD };
      let raw = self.mem.extend(size);
      if raw.is_null() {
        return None;
      }
      log::debug!("extended heap by {size} bytes");

      // The new region starts where the old epilogue sat, so the old
      // epilogue header becomes the new block's header.
      let bp = BlockPtr(raw);
      bp.write(size, false);
      header::store(bp.next().header_ptr(), Header::new(0, true));
      Some(self.coalesce(bp))
    }
  }

  /// Merges `bp` with whichever neighbors are free and parks the rover on
  /// the survivor.
  unsafe fn coalesce(
    &mut self,
    mut bp: BlockPtr,
  ) -> BlockPtr {
    unsafe {
      let prev = bp.prev();
      let next = bp.next();
      let prev_alloc = prev.is_allocated();
      let next_alloc = next.is_allocated();
      let mut size = bp.size();

      if prev_alloc && next_alloc {
        // nothing to merge
      } else if prev_alloc && !next_alloc {
        size += next.size();
        bp.write(size, false);
      } else if !prev_alloc && next_alloc {
        size += prev.size();
        bp = prev;
        bp.write(size, false);
      } else {
        size += prev.size() + next.size();
        bp = prev;
        bp.write(size, false);
      }

      self.rover = bp;
      bp
    }
  }

  /// Next-fit search: forward from the rover to the epilogue. On a miss
  /// the rover resets to the heap start and the caller extends instead.
  unsafe fn find_fit(
    &mut self,
    asize: usize,
  ) -> Option<BlockPtr> {
    unsafe {
      for bp in block::blocks_from(self.rover) {
        if !bp.is_allocated() && asize <= bp.size() {
          self.rover = bp;
          return Some(bp);
        }
      }
      self.rover = self.first;
      None
    }
  }

  /// Installs an `asize`-byte allocation at the head of free block `bp`,
  /// splitting off the tail when it can stand as a block of its own.
  unsafe fn place(
    &mut self,
    bp: BlockPtr,
    asize: usize,
  ) {
    unsafe {
      let csize = bp.size();

      if csize - asize >= MIN_BLOCK {
        bp.write(asize, true);
        let rest = bp.next();
        rest.write(csize - asize, false);
      } else {
        bp.write(csize, true);
      }
    }
  }

  /// Walks the whole heap verifying the block invariants, and returns the
  /// aggregate figures. Panics on a corrupt heap; meant for tests and
  /// debugging sessions.
  pub fn check_heap(&self) -> HeapStats {
    unsafe {
      let lo = self.mem.lo() as usize;
      let hi = self.mem.hi() as usize;
      let mut stats = HeapStats::default();
      let mut prev_free = false;
      let mut rover_on_boundary = false;

      assert_eq!(DWORD, self.first.size());
      assert!(self.first.is_allocated());
      if self.rover == self.first {
        rover_on_boundary = true;
      }

      for bp in block::blocks_from(self.first.next()) {
        assert_eq!(0, bp.addr() % DWORD, "payload not 8-byte aligned");
        assert!(bp.addr() > lo && bp.addr() < hi, "block outside heap bounds");
        assert!(bp.size() >= MIN_BLOCK, "undersized block");

        let h = bp.header();
        let f = header::load(bp.footer_ptr());
        assert_eq!(h.size, f.size, "header/footer size mismatch");
        assert_eq!(h.is_allocated(), f.is_allocated(), "header/footer alloc mismatch");

        let free = !h.is_allocated();
        assert!(!(prev_free && free), "adjacent free blocks");
        prev_free = free;

        if bp == self.rover {
          rover_on_boundary = true;
        }
        stats.observe(bp);
      }

      assert!(rover_on_boundary, "rover is not parked on a block boundary");

      // A zero-sized, allocated epilogue closes the heap.
      let epilogue = BlockPtr(self.mem.hi());
      assert_eq!(0, epilogue.size());
      assert!(epilogue.is_allocated());

      stats
    }
  }

  /// Prints the block map.
  pub fn dump(&self) {
    println!("implicit heap, {} bytes:", self.mem.len());
    unsafe { block::dump_from(self.first, self.mem.lo()) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zero_size_request_returns_null() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 16).unwrap();
    unsafe {
      assert!(heap.allocate(0).is_null());
    }
    heap.check_heap();
  }

  #[test]
  fn basic_allocation_and_write_read() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let a = heap.allocate(8);
      let b = heap.allocate(100);
      assert!(!a.is_null());
      assert!(!b.is_null());
      assert_eq!(0, a as usize % 8);
      assert_eq!(0, b as usize % 8);

      ptr::write_bytes(a, 0x11, 8);
      ptr::write_bytes(b, 0x22, 100);
      assert_eq!(0x11, a.add(7).read());
      assert_eq!(0x22, b.read());
      assert_eq!(0x22, b.add(99).read());
    }

    let stats = heap.check_heap();
    assert_eq!(3, stats.blocks); // a, b, and the unsplit remainder
    assert_eq!(1, stats.free_blocks);
  }

  #[test]
  fn releasing_neighbors_coalesces_into_one_region() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let a = heap.allocate(1);
      let b = heap.allocate(1);
      heap.deallocate(a);
      heap.deallocate(b);
    }

    let stats = heap.check_heap();
    assert_eq!(1, stats.free_blocks);
    assert_eq!(1, stats.blocks);
    assert!(stats.largest_free >= 32);
  }

  #[test]
  fn freed_block_is_reused_for_a_smaller_request() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let a = heap.allocate(16);
      let b = heap.allocate(16) as *mut u64;
      b.write(0xFEEDFACE_CAFEBEEF);

      heap.deallocate(a);
      let c = heap.allocate(8);

      assert_eq!(a, c);
      assert_eq!(0xFEEDFACE_CAFEBEEF, b.read());
    }
    heap.check_heap();
  }

  #[test]
  fn search_resumes_from_the_rover() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let a = heap.allocate(100);
      let b = heap.allocate(100);
      assert!((b as usize) > (a as usize));

      // Freeing parks the rover on the freed block, so the next fitting
      // request lands right back on it.
      heap.deallocate(a);
      let c = heap.allocate(50);
      assert_eq!(a, c);

      // The 112-byte hole was split; the search resumes at the 48-byte
      // remainder right behind `c` rather than rescanning from the start.
      let d = heap.allocate(8);
      assert_eq!(a as usize + 64, d as usize);

      // Too big for the leftover sliver: the search walks on past `b`.
      let e = heap.allocate(40);
      assert!((e as usize) > (b as usize));
    }
    heap.check_heap();
  }

  #[test]
  fn resize_grows_in_place_into_a_free_successor() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let a = heap.allocate(100);
      ptr::write_bytes(a, 0xAB, 100);

      let q = heap.reallocate(a, 200);
      assert_eq!(a, q);
      for i in 0..100 {
        assert_eq!(0xAB, q.add(i).read());
      }

      // Shrinking keeps the surplus attached and the pointer stable.
      let r = heap.reallocate(q, 50);
      assert_eq!(q, r);
    }
    heap.check_heap();
  }

  #[test]
  fn resize_relocates_when_the_successor_is_allocated() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let a = heap.allocate(64);
      let b = heap.allocate(64);
      ptr::write_bytes(a, 0x5A, 64);

      let q = heap.reallocate(a, 2048);
      assert_ne!(a, q);
      for i in 0..64 {
        assert_eq!(0x5A, q.add(i).read());
      }

      // The original block was released and is available again.
      let c = heap.allocate(40);
      assert_eq!(a, c);
      assert!(!b.is_null());
    }
    heap.check_heap();
  }

  #[test]
  fn null_resize_allocates_and_zero_resize_releases() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let p = heap.reallocate(ptr::null_mut(), 32);
      assert!(!p.is_null());

      assert!(heap.reallocate(p, 0).is_null());
    }
    let stats = heap.check_heap();
    assert_eq!(1, stats.free_blocks);
  }

  #[test]
  fn allocation_fails_cleanly_when_the_reservation_is_exhausted() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 13).unwrap();

    unsafe {
      assert!(heap.allocate(1 << 20).is_null());

      // The heap stays usable after the failure.
      let p = heap.allocate(64);
      assert!(!p.is_null());
    }
    heap.check_heap();
  }

  #[test]
  fn mixed_workload_keeps_the_heap_consistent() {
    let mut heap = ImplicitAllocator::with_capacity(1 << 20).unwrap();
    fastrand::seed(0x1357);

    unsafe {
      let mut live: Vec<(*mut u8, usize)> = Vec::new();

      for step in 0..2_000 {
        if live.is_empty() || fastrand::bool() {
          let size = fastrand::usize(8..=1024);
          let p = heap.allocate(size);
          assert!(!p.is_null());
          ptr::write_bytes(p, (size & 0xFF) as u8, size);
          live.push((p, size));
        } else {
          let (p, size) = live.swap_remove(fastrand::usize(..live.len()));
          assert_eq!((size & 0xFF) as u8, p.read());
          assert_eq!((size & 0xFF) as u8, p.add(size - 1).read());
          heap.deallocate(p);
        }

        if step % 500 == 0 {
          heap.check_heap();
        }
      }

      for (p, _) in live {
        heap.deallocate(p);
      }
    }

    let stats = heap.check_heap();
    assert_eq!(1, stats.free_blocks);
    assert_eq!(stats.free_bytes, stats.largest_free);
  }
}
