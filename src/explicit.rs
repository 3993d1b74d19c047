//! Explicit free-list allocator: LIFO insertion, first-fit search.
//!
//! Free blocks are threaded onto one doubly linked list whose node words
//! live inside the free payloads themselves. The prologue doubles as the
//! list head: it is an unconditionally present, allocated, minimum-sized
//! block whose payload holds the two link words, and the list is circular
//! through it. That removes every null check from insert and unlink, and
//! lets the first-fit walk terminate naturally when it wraps back around
//! to an allocated block:
//!
//! ```text
//!            ┌───────────────────────────────────────────┐
//!            ▼                                           │
//!   ┌─────────────┐      ┌─────────┐      ┌─────────┐    │
//!   │  prologue   │ succ │ free  C │ succ │ free  A │    │
//!   │  (sentinel) │─────►│ (newest)│─────►│ (oldest)│────┘
//!   └─────────────┘      └─────────┘      └─────────┘
//!
//!   Releases push at the front, so a block freed moments ago is the
//!   first candidate for the next request.
//! ```

use std::ptr;

use crate::block::{self, BlockPtr, HeapStats};
use crate::header::{self, Header};
use crate::mem::{self, MemorySystem};
use crate::{DWORD, MIN_BLOCK, WORD, align};

/// Heap extension granularity: 4 KiB.
const CHUNK: usize = 1 << 12;

/// Explicit-list allocator. See the module docs for the list discipline.
pub struct ExplicitAllocator {
  mem: MemorySystem,
  /// Prologue payload: heap walk start and free-list sentinel in one.
  head: BlockPtr,
}

impl ExplicitAllocator {
  /// Sets up a heap over the default-sized reservation.
  pub fn new() -> Option<Self> {
    Self::with_capacity(mem::MAX_HEAP)
  }

  /// Sets up a heap bounded by `capacity` bytes: sentinel blocks, the
  /// self-linked list head, and one initial free block.
  pub fn with_capacity(capacity: usize) -> Option<Self> {
    let mut mem = MemorySystem::with_capacity(capacity)?;
    let base = mem.extend(6 * WORD);
    if base.is_null() {
      return None;
    }

    unsafe {
      let head = BlockPtr(base.add(2 * WORD));

      (base as *mut u32).write(0); // alignment padding
      header::store(base.add(WORD) as *mut u32, Header::new(MIN_BLOCK, true)); // prologue header
      header::store(base.add(4 * WORD) as *mut u32, Header::new(MIN_BLOCK, true)); // prologue footer
      header::store(base.add(5 * WORD) as *mut u32, Header::new(0, true)); // epilogue

      // Empty list: the sentinel links to itself.
      head.set_pred(mem.lo(), Some(head));
      head.set_succ(mem.lo(), Some(head));

      let mut heap = Self { mem, head };
      heap.extend_heap(CHUNK / WORD)?;
      Some(heap)
    }
  }

  /// Allocates at least `size` bytes, 8-byte aligned; null when `size` is
  /// zero or the heap cannot grow.
  ///
  /// # Safety
  ///
  /// The returned region is exclusively the caller's until passed back to
  /// [`deallocate`](Self::deallocate) or [`reallocate`](Self::reallocate).
  pub unsafe fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      if size == 0 {
        return ptr::null_mut();
      }

      let asize = (align!(size) + DWORD).max(MIN_BLOCK);

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

  /// Returns a block to the free list, merging with free neighbors first.
  /// Null is a silent no-op.
  ///
  /// # Safety
  ///
  /// A non-null `ptr` must come from this allocator and not have been
  /// released since.
  pub unsafe fn deallocate(
    &mut self,
    ptr: *mut u8,
  ) {
    unsafe {
      if ptr.is_null() {
        return;
      }

      let bp = BlockPtr(ptr);
      let size = bp.size();
      bp.write(size, false);
      self.coalesce(bp);
    }
  }

  /// Resizes a previous allocation, preserving the payload prefix. Null
  /// `ptr` allocates; `size == 0` releases and returns null. Shrinks split
  /// the surplus off in place when it can stand alone; grows absorb a
  /// sufficient free successor in place and relocate by copy otherwise.
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
      let asize = (align!(size) + DWORD).max(MIN_BLOCK);
      let csize = bp.size();

      if asize == csize {
        return old;
      }

      if asize < csize {
        // Shrink: give the tail back when it can stand as a block,
        // otherwise keep the surplus attached.
        if csize - asize >= MIN_BLOCK {
          bp.write(asize, true);
          let tail = bp.next();
          tail.write(csize - asize, false);
          self.coalesce(tail);
        }
        return old;
      }

      // Grow into a free successor when the pair covers the request.
      let next = bp.next();
      if !next.is_allocated() && csize + next.size() >= asize {
        let total = csize + next.size();
        self.unlink(next);
        if total - asize >= MIN_BLOCK {
          bp.write(asize, true);
          let tail = bp.next();
          tail.write(total - asize, false);
          self.push_front(tail);
        } else {
          bp.write(total, true);
        }
        return old;
      }

      // Relocate: fresh block, copy, release the original.
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
      let size = if words % 2 == 1 { (words + 1) * WORD } else { words * WORD };
      let raw = self.mem.extend(size);
      if raw.is_null() {
        return None;
      }
      log::debug!("extended heap by {size} bytes");

      let bp = BlockPtr(raw);
      bp.write(size, false);
      header::store(bp.next().header_ptr(), Header::new(0, true));
      Some(self.coalesce(bp))
    }
  }

  /// Merges `bp` with free neighbors, unlinking whichever the merge
  /// absorbs, and pushes the survivor onto the list front.
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

      if prev_alloc && !next_alloc {
        self.unlink(next);
        size += next.size();
        bp.write(size, false);
      } else if !prev_alloc && next_alloc {
        self.unlink(prev);
        size += prev.size();
        bp = prev;
        bp.write(size, false);
      } else if !prev_alloc && !next_alloc {
        self.unlink(prev);
        self.unlink(next);
        size += prev.size() + next.size();
        bp = prev;
        bp.write(size, false);
      }

      self.push_front(bp);
      bp
    }
  }

  /// First fit: walk successor links from the sentinel until the walk
  /// comes back around to an allocated block.
  unsafe fn find_fit(
    &self,
    asize: usize,
  ) -> Option<BlockPtr> {
    unsafe {
      let mut bp = self.succ_of(self.head);
      while !bp.is_allocated() {
        if asize <= bp.size() {
          return Some(bp);
        }
        bp = self.succ_of(bp);
      }
      None
    }
  }

  /// Installs an allocation at the head of free block `bp`, splitting off
  /// the tail when it can stand as a block of its own.
  unsafe fn place(
    &mut self,
    bp: BlockPtr,
    asize: usize,
  ) {
    unsafe {
      let csize = bp.size();
      self.unlink(bp);

      if csize - asize >= MIN_BLOCK {
        bp.write(asize, true);
        let rest = bp.next();
        rest.write(csize - asize, false);
        self.push_front(rest);
      } else {
        bp.write(csize, true);
      }
    }
  }

  // Circular-list plumbing. The sentinel makes both operations branchless.

  unsafe fn push_front(
    &mut self,
    bp: BlockPtr,
  ) {
    unsafe {
      let base = self.mem.lo();
      let old = self.succ_of(self.head);
      bp.set_succ(base, Some(old));
      bp.set_pred(base, Some(self.head));
      old.set_pred(base, Some(bp));
      self.head.set_succ(base, Some(bp));
    }
  }

  unsafe fn unlink(
    &mut self,
    bp: BlockPtr,
  ) {
    unsafe {
      let base = self.mem.lo();
      let pred = self.pred_of(bp);
      let succ = self.succ_of(bp);
      pred.set_succ(base, Some(succ));
      succ.set_pred(base, Some(pred));
    }
  }

  unsafe fn succ_of(
    &self,
    bp: BlockPtr,
  ) -> BlockPtr {
    unsafe { bp.succ(self.mem.lo()).unwrap_or(self.head) }
  }

  unsafe fn pred_of(
    &self,
    bp: BlockPtr,
  ) -> BlockPtr {
    unsafe { bp.pred(self.mem.lo()).unwrap_or(self.head) }
  }

  /// Walks the heap and the free list, verifying the block invariants and
  /// that the two agree on the set of free blocks. Panics on corruption.
  pub fn check_heap(&self) -> HeapStats {
    unsafe {
      let lo = self.mem.lo() as usize;
      let hi = self.mem.hi() as usize;
      let mut stats = HeapStats::default();
      let mut free_addrs = Vec::new();
      let mut prev_free = false;

      assert_eq!(MIN_BLOCK, self.head.size());
      assert!(self.head.is_allocated());

      for bp in block::blocks_from(self.head.next()) {
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

        if free {
          free_addrs.push(bp.addr());
        }
        stats.observe(bp);
      }

      let epilogue = BlockPtr(self.mem.hi());
      assert_eq!(0, epilogue.size());
      assert!(epilogue.is_allocated());

      // The list must name exactly the free blocks, each once.
      free_addrs.sort_unstable();
      let mut listed = Vec::new();
      let mut bp = self.succ_of(self.head);
      while bp != self.head {
        assert!(!bp.is_allocated(), "allocated block on the free list");
        listed.push(bp.addr());
        assert!(listed.len() <= free_addrs.len(), "free list longer than the heap's free set");
        bp = self.succ_of(bp);
      }
      listed.sort_unstable();
      assert_eq!(free_addrs, listed, "free list disagrees with heap scan");

      stats
    }
  }

  /// Prints the block map.
  pub fn dump(&self) {
    println!("explicit heap, {} bytes:", self.mem.len());
    unsafe { block::dump_from(self.head, self.mem.lo()) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zero_size_request_returns_null() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 16).unwrap();
    unsafe {
      assert!(heap.allocate(0).is_null());
    }
    heap.check_heap();
  }

  #[test]
  fn releasing_null_is_a_noop() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 16).unwrap();
    unsafe {
      heap.deallocate(ptr::null_mut());
    }
    heap.check_heap();
  }

  #[test]
  fn lifo_release_reuses_the_same_block() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let p = heap.allocate(24);
      heap.deallocate(p);
      let q = heap.allocate(24);
      assert_eq!(p, q);
    }
    heap.check_heap();
  }

  #[test]
  fn first_fit_prefers_the_most_recently_freed_block() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let _a = heap.allocate(32);
      let b = heap.allocate(32);
      let _c = heap.allocate(32);

      // `b` is isolated between allocated neighbors, so freeing it adds
      // it to the list front ahead of the big initial remainder.
      heap.deallocate(b);
      let q = heap.allocate(32);
      assert_eq!(b, q);
    }
    heap.check_heap();
  }

  #[test]
  fn releasing_neighbors_coalesces_into_one_region() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let a = heap.allocate(1);
      let b = heap.allocate(1);
      heap.deallocate(a);
      heap.deallocate(b);
    }

    let stats = heap.check_heap();
    assert_eq!(1, stats.free_blocks);
    assert!(stats.largest_free >= 32);
  }

  #[test]
  fn resize_shrink_returns_the_tail_to_the_list() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let p = heap.allocate(100);
      ptr::write_bytes(p, 0x3C, 100);

      let q = heap.reallocate(p, 40);
      assert_eq!(p, q);
      for i in 0..40 {
        assert_eq!(0x3C, q.add(i).read());
      }
    }

    let stats = heap.check_heap();
    assert_eq!(1, stats.free_blocks); // tail merged into the remainder
  }

  #[test]
  fn resize_grows_in_place_into_a_free_successor() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let p = heap.allocate(64);
      ptr::write_bytes(p, 0x77, 64);

      let q = heap.reallocate(p, 400);
      assert_eq!(p, q);
      for i in 0..64 {
        assert_eq!(0x77, q.add(i).read());
      }
    }
    heap.check_heap();
  }

  #[test]
  fn resize_relocates_past_an_allocated_successor() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 16).unwrap();

    unsafe {
      let p = heap.allocate(64);
      let b = heap.allocate(64);
      ptr::write_bytes(p, 0x99, 64);

      let q = heap.reallocate(p, 300);
      assert_ne!(p, q);
      for i in 0..64 {
        assert_eq!(0x99, q.add(i).read());
      }

      // The vacated block went to the list front and is reused first.
      let r = heap.allocate(16);
      assert_eq!(p, r);
      assert!(!b.is_null());
    }
    heap.check_heap();
  }

  #[test]
  fn allocation_fails_cleanly_when_the_reservation_is_exhausted() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 13).unwrap();

    unsafe {
      assert!(heap.allocate(1 << 20).is_null());

      let p = heap.allocate(64);
      assert!(!p.is_null());
    }
    heap.check_heap();
  }

  #[test]
  fn mixed_workload_keeps_the_heap_and_list_in_agreement() {
    let mut heap = ExplicitAllocator::with_capacity(1 << 20).unwrap();
    fastrand::seed(0x2468);

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
