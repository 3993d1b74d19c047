//! Segregated-fits allocator with reallocation tagging.
//!
//! The most elaborate of the three variants. Free blocks are indexed by 20
//! size-class lists; list *k* holds blocks whose size lies in
//! `[2^k, 2^(k+1))`, with the last list unbounded above:
//!
//! ```text
//!   lists[4]  ──► 16..31    ──► ...
//!   lists[5]  ──► 32..63    ──► ...
//!   lists[6]  ──► 64..127
//!     ...
//!   lists[19] ──► 2^19..       (catch-all)
//!
//!   Within one list (head = smallest, pred walks toward larger):
//!
//!   lists[k] ──► [ 48 ] ─pred─► [ 56 ] ─pred─► [ 56 ] ─pred─► [ 60 ]
//!                  ▲succ──────────┘  ▲succ────────┘   ▲succ─────┘
//! ```
//!
//! A search starts at the smallest class that could hold the request and
//! walks predecessor links, so the first fit inside a bucket is also the
//! best fit. Ties place the newest arrival nearest the head.
//!
//! ## Reallocation tagging
//!
//! Workloads that grow one buffer repeatedly are pathological for a plain
//! allocator: every growth copies the payload. Two countermeasures here:
//!
//! - every resize pads its target by a 128-byte buffer, and
//! - when the padded block ends up with less than 256 bytes of surplus,
//!   the *following* block's header is tagged as **reserved**. A reserved
//!   block is invisible to fit search and never merged over by a release
//!   in front of it, so the next resize of the same allocation finds it
//!   still there and absorbs it in place. Releasing the preceding block
//!   lifts the reservation.
//!
//! Large requests (adjusted size >= 100) are additionally placed at the
//! *tail* of their free block: big allocations tend to be released sooner
//! than small ones, and a big block at the tail coalesces with whatever
//! comes after it.

use std::ptr;

use crate::block::{self, BlockPtr, HeapStats};
use crate::header::{self, Header};
use crate::mem::{self, MemorySystem};
use crate::{DWORD, MIN_BLOCK, WORD, align};

/// Number of size-class lists.
const LIST_LIMIT: usize = 20;

/// First heap seeding: 64 bytes.
const INIT_CHUNK: usize = 1 << 6;

/// Heap extension granularity: 4 KiB.
const CHUNK: usize = 1 << 12;

/// Padding added to every resize target, anticipating further growth.
const REALLOC_BUFFER: usize = 1 << 7;

/// Adjusted sizes at least this large are placed at the tail of their
/// free block.
const TAIL_PLACE_MIN: usize = 100;

/// Size class for `size`: the index of its power-of-two bucket, clamped
/// to the last list.
fn class_of(size: usize) -> usize {
  let mut size = size;
  let mut class = 0;

  while class < LIST_LIMIT - 1 && size > 1 {
    size >>= 1;
    class += 1;
  }
  class
}

/// Segregated-fits allocator. See the module docs for the policies.
pub struct SegregatedAllocator {
  mem: MemorySystem,
  /// Size-class list heads; `None` marks an empty class.
  lists: [Option<BlockPtr>; LIST_LIMIT],
  /// Prologue payload; the heap walk starts here.
  first: BlockPtr,
}

impl SegregatedAllocator {
  /// Sets up a heap over the default-sized reservation.
  pub fn new() -> Option<Self> {
    Self::with_capacity(mem::MAX_HEAP)
  }

  /// Sets up a heap bounded by `capacity` bytes: empty size classes,
  /// sentinel blocks, and one small initial free block.
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

      let mut heap = Self {
        mem,
        lists: [None; LIST_LIMIT],
        first: BlockPtr(base.add(2 * WORD)),
      };
      heap.extend_heap(INIT_CHUNK)?;
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

      let asize = if size <= DWORD { MIN_BLOCK } else { align!(size + DWORD) };

      let bp = match self.find_fit(asize) {
        Some(bp) => bp,
        None => {
          let Some(bp) = self.extend_heap(asize.max(CHUNK)) else {
            return ptr::null_mut();
          };
          bp
        }
      };
      self.place(bp, asize).payload()
    }
  }

  /// Returns a block to its size class, merging with free neighbors
  /// first, and lifts this block's hold on its successor. Null is a
  /// silent no-op.
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

      // This block will never resize in place again; release its claim
      // on the successor.
      header::clear_reservation(bp.next().header_ptr());

      bp.write_keep_tag(size, false);
      self.insert(bp, size);
      let merged = self.coalesce(bp);

      // If the reservation just lifted had covered a free block, that
      // block was barred from merging forward when it was released; one
      // more round reunites the survivor with it.
      if !merged.next().is_allocated() {
        self.coalesce(merged);
      }
    }
  }

  /// Resizes a previous allocation, preserving the payload prefix. Null
  /// `ptr` allocates; `size == 0` releases and returns null.
  ///
  /// The target is padded by [`REALLOC_BUFFER`] so repeated growth of the
  /// same allocation usually stays in place: the block is grown over a
  /// free successor (or straight over the epilogue, extending the heap)
  /// whenever possible, and relocated by copy only as a last resort. When
  /// the resized block ends up with little surplus, its successor is
  /// tagged as reserved for the next round.
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

      let mut bp = BlockPtr(old);
      let base_size = if size <= DWORD { MIN_BLOCK } else { align!(size + DWORD) };
      let asize = base_size + REALLOC_BUFFER;

      if bp.size() < asize {
        let grown = 'grow: {
          let next = bp.next();
          // Only a free successor or the epilogue can be grown over.
          if next.is_allocated() && next.size() != 0 {
            break 'grow false;
          }

          let mut gap = bp.size() as isize + next.size() as isize - asize as isize;
          if gap < 0 {
            // The deficit is made up by extending the heap, which is
            // contiguous with this block only at the heap end.
            let at_end = next.size() == 0 || next.next().size() == 0;
            if !at_end {
              break 'grow false;
            }

            // The successor is about to be consumed; its reservation
            // must not keep the fresh region from merging into it.
            header::clear_reservation(next.header_ptr());

            let need = ((-gap) as usize).max(CHUNK);
            if self.extend_heap(need).is_none() {
              return ptr::null_mut();
            }
            gap += need as isize;
          }

          self.remove(bp.next());
          bp.write((asize as isize + gap) as usize, true);
          true
        };

        if !grown {
          // Relocate: fresh padded block, copy, release the original.
          let newp = self.allocate(asize - DWORD);
          if newp.is_null() {
            return ptr::null_mut();
          }
          let copy = size.min(bp.size() - DWORD);
          log::trace!("relocating {copy}-byte payload during resize");
          ptr::copy_nonoverlapping(old, newp, copy);
          self.deallocate(old);
          bp = BlockPtr(newp);
        }
      }

      // Little surplus left: hold the successor back for the next round.
      let slack = bp.size() as isize - asize as isize;
      if slack < 2 * REALLOC_BUFFER as isize {
        header::reserve(bp.next().header_ptr());
      }

      bp.payload()
    }
  }

  fn extend_heap(
    &mut self,
    size: usize,
  ) -> Option<BlockPtr> {
    unsafe {
      let asize = align!(size);
      let raw = self.mem.extend(asize);
      if raw.is_null() {
        return None;
      }
      log::debug!("extended heap by {asize} bytes");

      // The new block overlays the old epilogue; writing it untagged also
      // discards a reservation parked on the epilogue header.
      let bp = BlockPtr(raw);
      bp.write(asize, false);
      header::store(bp.next().header_ptr(), Header::new(0, true));

      self.insert(bp, asize);
      Some(self.coalesce(bp))
    }
  }

  /// Merges an indexed free block with free, unreserved neighbors.
  /// Participants are removed from their classes and the survivor is
  /// re-inserted under its merged size.
  unsafe fn coalesce(
    &mut self,
    mut bp: BlockPtr,
  ) -> BlockPtr {
    unsafe {
      let prev = bp.prev();
      let next = bp.next();
      // A reserved predecessor is off limits: it is being held for its
      // own predecessor's next resize.
      let prev_alloc = prev.is_allocated() || prev.is_reserved();
      let next_alloc = next.is_allocated();
      let mut size = bp.size();

      if prev_alloc && next_alloc {
        return bp;
      }

      if prev_alloc && !next_alloc {
        self.remove(bp);
        self.remove(next);
        size += next.size();
        bp.write_keep_tag(size, false);
      } else if !prev_alloc && next_alloc {
        self.remove(bp);
        self.remove(prev);
        size += prev.size();
        bp = prev;
        bp.write_keep_tag(size, false);
      } else {
        self.remove(bp);
        self.remove(prev);
        self.remove(next);
        size += prev.size() + next.size();
        bp = prev;
        bp.write_keep_tag(size, false);
      }

      self.insert(bp, size);
      bp
    }
  }

  /// Searches the size classes for the smallest unreserved fit, starting
  /// at the class matching `asize` and falling through to the catch-all.
  unsafe fn find_fit(
    &self,
    asize: usize,
  ) -> Option<BlockPtr> {
    unsafe {
      let base = self.mem.lo();
      let mut searchsize = asize;

      for class in 0..LIST_LIMIT {
        if class == LIST_LIMIT - 1 || (searchsize <= 1 && self.lists[class].is_some()) {
          let mut cur = self.lists[class];
          while let Some(bp) = cur {
            if asize <= bp.size() && !bp.is_reserved() {
              return Some(bp);
            }
            cur = bp.pred(base);
          }
        }
        searchsize >>= 1;
      }
      None
    }
  }

  /// Installs an `asize`-byte allocation in free block `bp` and returns
  /// the allocated block: the head of `bp`, or its tail for large
  /// requests. A splittable remainder goes back into its class.
  unsafe fn place(
    &mut self,
    bp: BlockPtr,
    asize: usize,
  ) -> BlockPtr {
    unsafe {
      let csize = bp.size();
      let remainder = csize - asize;
      self.remove(bp);

      if remainder < MIN_BLOCK {
        bp.write(csize, true);
        bp
      } else if asize >= TAIL_PLACE_MIN {
        bp.write(remainder, false);
        let tail = bp.next();
        tail.write(asize, true);
        self.insert(bp, remainder);
        tail
      } else {
        bp.write(asize, true);
        let rest = bp.next();
        rest.write(remainder, false);
        self.insert(rest, remainder);
        bp
      }
    }
  }

  /// Splices `bp` into the class for `size`, keeping the list ordered by
  /// size from the head outward along predecessor links.
  unsafe fn insert(
    &mut self,
    bp: BlockPtr,
    size: usize,
  ) {
    unsafe {
      let base = self.mem.lo();
      let class = class_of(size);

      // Walk toward larger blocks until the candidate is no smaller.
      let mut search = self.lists[class];
      let mut passed: Option<BlockPtr> = None;
      while let Some(s) = search {
        if size <= s.size() {
          break;
        }
        passed = Some(s);
        search = s.pred(base);
      }

      match (search, passed) {
        // Between two entries.
        (Some(s), Some(p)) => {
          s.set_succ(base, Some(bp));
          bp.set_pred(base, Some(s));
          bp.set_succ(base, Some(p));
          p.set_pred(base, Some(bp));
        }
        // No smaller entry: new head.
        (Some(s), None) => {
          bp.set_pred(base, Some(s));
          s.set_succ(base, Some(bp));
          bp.set_succ(base, None);
          self.lists[class] = Some(bp);
        }
        // Walked past everything: new largest entry.
        (None, Some(p)) => {
          bp.set_pred(base, None);
          bp.set_succ(base, Some(p));
          p.set_pred(base, Some(bp));
        }
        // Empty class.
        (None, None) => {
          bp.set_pred(base, None);
          bp.set_succ(base, None);
          self.lists[class] = Some(bp);
        }
      }
    }
  }

  /// Unlinks `bp` from the class matching its current size.
  unsafe fn remove(
    &mut self,
    bp: BlockPtr,
  ) {
    unsafe {
      let base = self.mem.lo();
      let class = class_of(bp.size());

      match (bp.pred(base), bp.succ(base)) {
        (Some(p), Some(s)) => {
          p.set_succ(base, Some(s));
          s.set_pred(base, Some(p));
        }
        // No successor means `bp` is the head.
        (Some(p), None) => {
          p.set_succ(base, None);
          self.lists[class] = Some(p);
        }
        (None, Some(s)) => {
          s.set_pred(base, None);
        }
        (None, None) => {
          self.lists[class] = None;
        }
      }
    }
  }

  /// Walks the heap and every size class, verifying the block invariants,
  /// class membership, in-class ordering, and that the classes together
  /// name exactly the free blocks. Panics on corruption.
  pub fn check_heap(&self) -> HeapStats {
    unsafe {
      let lo = self.mem.lo() as usize;
      let hi = self.mem.hi() as usize;
      let base = self.mem.lo();
      let mut stats = HeapStats::default();
      let mut free_addrs = Vec::new();
      let mut prev_free = false;
      let mut prev_reserved = false;

      assert_eq!(DWORD, self.first.size());
      assert!(self.first.is_allocated());

      for bp in block::blocks_from(self.first.next()) {
        assert_eq!(0, bp.addr() % DWORD, "payload not 8-byte aligned");
        assert!(bp.addr() > lo && bp.addr() < hi, "block outside heap bounds");
        assert!(bp.size() >= MIN_BLOCK, "undersized block");

        let h = bp.header();
        let f = header::load(bp.footer_ptr());
        assert_eq!(h.size, f.size, "header/footer size mismatch");
        assert_eq!(h.is_allocated(), f.is_allocated(), "header/footer alloc mismatch");

        // A reserved free block legitimately sits next to a free
        // successor, since releases in front of it may not merge over it.
        let free = !h.is_allocated();
        assert!(!(prev_free && free && !prev_reserved), "adjacent free blocks");
        prev_free = free;
        prev_reserved = h.is_reserved();

        if free {
          free_addrs.push(bp.addr());
        }
        stats.observe(bp);
      }

      let epilogue = BlockPtr(self.mem.hi());
      assert_eq!(0, epilogue.size());
      assert!(epilogue.is_allocated());

      // Every class lists only free blocks of its own size range, ordered
      // by size, with mutually consistent links...
      free_addrs.sort_unstable();
      let mut listed = Vec::new();
      for class in 0..LIST_LIMIT {
        let mut cur = self.lists[class];
        let mut last_size = 0;

        while let Some(bp) = cur {
          assert!(!bp.is_allocated(), "allocated block in a size class");
          assert_eq!(class, class_of(bp.size()), "block filed under the wrong size class");
          assert!(last_size <= bp.size(), "size class out of order");
          last_size = bp.size();

          if let Some(p) = bp.pred(base) {
            assert_eq!(Some(bp), p.succ(base), "inconsistent class links");
          }

          listed.push(bp.addr());
          assert!(listed.len() <= free_addrs.len(), "size classes list more blocks than are free");
          cur = bp.pred(base);
        }
      }

      // ...and together they name exactly the free blocks.
      listed.sort_unstable();
      assert_eq!(free_addrs, listed, "size classes disagree with heap scan");

      stats
    }
  }

  /// Prints the block map.
  pub fn dump(&self) {
    println!("segregated heap, {} bytes:", self.mem.len());
    unsafe { block::dump_from(self.first, self.mem.lo()) }
  }
}
