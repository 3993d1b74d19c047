//! Boundary-word encoding.
//!
//! Every block begins and ends with one 4-byte word packing the block size
//! together with two status bits. Sizes are multiples of 8, so bits 0-2 of
//! the word never carry size information:
//!
//! ```text
//!   31                                3   2    1      0
//!   ┌──────────────────────────────────┬───┬──────┬───────┐
//!   │            size (bytes)          │ - │ RSVD │ ALLOC │
//!   └──────────────────────────────────┴───┴──────┴───────┘
//! ```
//!
//! `ALLOC` marks the block as handed out to a caller. `RSVD` is the
//! reallocation tag used by the segregated allocator: a block whose header
//! carries it is held back for the preceding block's next in-place resize,
//! and is treated as allocated by both fit search and coalescing even while
//! its `ALLOC` bit is clear.
//!
//! Rather than masking bits at every call site, the word is decoded into a
//! [`Header`] value on read and re-encoded on write.

use bitflags::bitflags;

bitflags! {
  /// Status bits stored in the low bits of a boundary word.
  #[derive(Clone, Copy, PartialEq, Eq, Debug)]
  pub struct Tags: u32 {
    /// Block is allocated to a caller.
    const ALLOCATED = 0b01;
    /// Block is reserved for the preceding block's next resize.
    const RESERVED = 0b10;
  }
}

/// A decoded boundary word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Header {
  pub size: usize,
  pub tags: Tags,
}

impl Header {
  pub fn new(
    size: usize,
    allocated: bool,
  ) -> Self {
    let tags = if allocated { Tags::ALLOCATED } else { Tags::empty() };
    Self { size, tags }
  }

  pub fn is_allocated(self) -> bool {
    self.tags.contains(Tags::ALLOCATED)
  }

  pub fn is_reserved(self) -> bool {
    self.tags.contains(Tags::RESERVED)
  }

  fn encode(self) -> u32 {
    self.size as u32 | self.tags.bits()
  }

  fn decode(word: u32) -> Self {
    Self {
      size: (word & !0x7) as usize,
      tags: Tags::from_bits_truncate(word & 0x3),
    }
  }
}

/// Reads the boundary word at `p`.
///
/// # Safety
///
/// `p` must point at a live, 4-byte-aligned boundary word inside the heap.
pub unsafe fn load(p: *const u32) -> Header {
  unsafe { Header::decode(p.read()) }
}

/// Writes `h` to the boundary word at `p`, clearing any reservation bit
/// previously stored there.
///
/// # Safety
///
/// Same contract as [`load`].
pub unsafe fn store(
  p: *mut u32,
  h: Header,
) {
  unsafe { p.write(h.encode()) }
}

/// Writes `h` to the boundary word at `p` while preserving the reservation
/// bit currently stored there.
///
/// # Safety
///
/// Same contract as [`load`].
pub unsafe fn store_keep_tag(
  p: *mut u32,
  h: Header,
) {
  unsafe {
    let reserved = p.read() & Tags::RESERVED.bits();
    p.write(h.encode() | reserved);
  }
}

/// Sets the reservation bit of the boundary word at `p`.
///
/// # Safety
///
/// Same contract as [`load`].
pub unsafe fn reserve(p: *mut u32) {
  unsafe { p.write(p.read() | Tags::RESERVED.bits()) }
}

/// Clears the reservation bit of the boundary word at `p`.
///
/// # Safety
///
/// Same contract as [`load`].
pub unsafe fn clear_reservation(p: *mut u32) {
  unsafe { p.write(p.read() & !Tags::RESERVED.bits()) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_decode_round_trip() {
    for size in [0usize, 8, 16, 4096, 1 << 20] {
      for allocated in [false, true] {
        let h = Header::new(size, allocated);
        let back = Header::decode(h.encode());
        assert_eq!(h, back);
        assert_eq!(size, back.size);
        assert_eq!(allocated, back.is_allocated());
      }
    }
  }

  #[test]
  fn store_clears_reservation_and_store_keep_tag_does_not() {
    let mut word: u32 = 0;
    let p = &mut word as *mut u32;

    unsafe {
      store(p, Header::new(32, true));
      reserve(p);
      assert!(load(p).is_reserved());

      store_keep_tag(p, Header::new(48, false));
      let h = load(p);
      assert_eq!(48, h.size);
      assert!(!h.is_allocated());
      assert!(h.is_reserved());

      store(p, Header::new(48, false));
      assert!(!load(p).is_reserved());

      reserve(p);
      clear_reservation(p);
      assert!(!load(p).is_reserved());
    }
  }
}
