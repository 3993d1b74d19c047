//! Block view over the raw heap.
//!
//! A block is a header word, a payload, and a footer word. [`BlockPtr`]
//! wraps the *payload* address (the pointer callers receive) and derives
//! everything else from the boundary tags:
//!
//! ```text
//!        header_ptr()   payload            footer_ptr()
//!             │            │                    │
//!             ▼            ▼                    ▼
//!   ──────┬───────┬─────────────────────┬───────┬──────
//!    ...  │ size|A│  size - 8 bytes     │ size|A│  ...
//!   ──────┴───────┴─────────────────────┴───────┴──────
//!             ◄─────────── size ───────────────►
//! ```
//!
//! While a block is free, the first eight payload bytes are reinterpreted
//! as two u32 link words holding *offsets from the heap base* (predecessor
//! at +0, successor at +4, offset 0 meaning "none"). Offsets rather than
//! pointers keep the 16-byte minimum block intact on 64-bit hosts.

use crate::header::{self, Header};
use crate::{DWORD, WORD};

/// A block, addressed by its payload pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockPtr(pub *mut u8);

impl BlockPtr {
  pub fn payload(self) -> *mut u8 {
    self.0
  }

  pub fn addr(self) -> usize {
    self.0 as usize
  }

  /// # Safety
  ///
  /// `self` must address the payload of a block with valid boundary tags.
  /// This contract applies to every method below that reads or writes
  /// through the pointer.
  pub unsafe fn header_ptr(self) -> *mut u32 {
    unsafe { self.0.sub(WORD) as *mut u32 }
  }

  pub unsafe fn header(self) -> Header {
    unsafe { header::load(self.header_ptr()) }
  }

  pub unsafe fn footer_ptr(self) -> *mut u32 {
    unsafe { self.0.add(self.size() - DWORD) as *mut u32 }
  }

  pub unsafe fn size(self) -> usize {
    unsafe { self.header().size }
  }

  pub unsafe fn is_allocated(self) -> bool {
    unsafe { self.header().is_allocated() }
  }

  pub unsafe fn is_reserved(self) -> bool {
    unsafe { self.header().is_reserved() }
  }

  pub unsafe fn next(self) -> BlockPtr {
    unsafe { BlockPtr(self.0.add(self.size())) }
  }

  pub unsafe fn prev(self) -> BlockPtr {
    unsafe {
      let prev_footer = self.0.sub(DWORD) as *mut u32;
      BlockPtr(self.0.sub(header::load(prev_footer).size))
    }
  }

  /// Rewrites header and footer with a new size and allocation state. The
  /// footer position is derived from the new size, so a single call covers
  /// both in-place rewrites and merges that move the footer. Any
  /// reservation bit on either word is cleared; fresh split remainders and
  /// newly extended regions must be written this way.
  pub unsafe fn write(
    self,
    size: usize,
    allocated: bool,
  ) {
    unsafe {
      let h = Header::new(size, allocated);
      header::store(self.header_ptr(), h);
      header::store(self.footer_ptr(), h);
    }
  }

  /// Like [`write`](Self::write), but preserves a reservation bit already
  /// present on the words. Release and coalescing in the segregated
  /// variant go through this so a reserved block keeps its reservation
  /// across the free transition.
  pub unsafe fn write_keep_tag(
    self,
    size: usize,
    allocated: bool,
  ) {
    unsafe {
      let h = Header::new(size, allocated);
      header::store_keep_tag(self.header_ptr(), h);
      header::store_keep_tag(self.footer_ptr(), h);
    }
  }

  // Free-list link words. Valid only while the block is free (or is a
  // sentinel whose payload is dedicated to links).

  unsafe fn pred_slot(self) -> *mut u32 {
    self.0 as *mut u32
  }

  unsafe fn succ_slot(self) -> *mut u32 {
    unsafe { self.0.add(WORD) as *mut u32 }
  }

  pub unsafe fn pred(
    self,
    base: *mut u8,
  ) -> Option<BlockPtr> {
    unsafe { from_offset(base, self.pred_slot().read()) }
  }

  pub unsafe fn succ(
    self,
    base: *mut u8,
  ) -> Option<BlockPtr> {
    unsafe { from_offset(base, self.succ_slot().read()) }
  }

  pub unsafe fn set_pred(
    self,
    base: *mut u8,
    link: Option<BlockPtr>,
  ) {
    unsafe { self.pred_slot().write(to_offset(base, link)) }
  }

  pub unsafe fn set_succ(
    self,
    base: *mut u8,
    link: Option<BlockPtr>,
  ) {
    unsafe { self.succ_slot().write(to_offset(base, link)) }
  }
}

fn to_offset(
  base: *mut u8,
  link: Option<BlockPtr>,
) -> u32 {
  match link {
    Some(bp) => (bp.addr() - base as usize) as u32,
    None => 0,
  }
}

unsafe fn from_offset(
  base: *mut u8,
  off: u32,
) -> Option<BlockPtr> {
  if off == 0 {
    None
  } else {
    Some(BlockPtr(unsafe { base.add(off as usize) }))
  }
}

/// Iterator over the blocks from `start` up to (not including) the
/// epilogue.
pub struct Blocks {
  cur: BlockPtr,
}

/// # Safety
///
/// `start` must be a valid block inside a well-formed heap terminated by a
/// zero-sized epilogue.
pub unsafe fn blocks_from(start: BlockPtr) -> Blocks {
  Blocks { cur: start }
}

impl Iterator for Blocks {
  type Item = BlockPtr;

  fn next(&mut self) -> Option<BlockPtr> {
    unsafe {
      if self.cur.size() == 0 {
        return None;
      }
      let bp = self.cur;
      self.cur = bp.next();
      Some(bp)
    }
  }
}

/// Aggregate heap figures returned by the consistency checkers. Sentinel
/// blocks are not counted.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HeapStats {
  pub blocks: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

impl HeapStats {
  pub(crate) unsafe fn observe(
    &mut self,
    bp: BlockPtr,
  ) {
    unsafe {
      self.blocks += 1;
      if !bp.is_allocated() {
        self.free_blocks += 1;
        self.free_bytes += bp.size();
        self.largest_free = self.largest_free.max(bp.size());
      }
    }
  }
}

/// Prints a one-line-per-block map of the heap, sentinels included.
pub(crate) unsafe fn dump_from(
  first: BlockPtr,
  lo: *mut u8,
) {
  unsafe {
    println!("  offset     size  state");
    for bp in blocks_from(first) {
      let state = match (bp.is_allocated(), bp.is_reserved()) {
        (true, false) => "allocated",
        (true, true) => "allocated, reserved",
        (false, true) => "free, reserved",
        (false, false) => "free",
      };
      println!("  {:#08x} {:>8}  {}", bp.addr() - lo as usize, bp.size(), state);
    }
    println!("  (epilogue)");
  }
}
