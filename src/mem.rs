//! Memory-system facade.
//!
//! The allocators never talk to the operating system directly. They consume
//! exactly two capabilities: *extend the heap by N bytes, returning the old
//! break*, and *the current heap bounds*. This module provides both over a
//! single contiguous region reserved up front with `mmap`:
//!
//! ```text
//!   lo                    brk                              limit
//!   │                      │                                 │
//!   ▼                      ▼                                 ▼
//!   ┌──────────────────────┬─────────────────────────────────┐
//!   │   heap (in use)      │      reserved, not yet handed   │
//!   │                      │      to the allocator           │
//!   └──────────────────────┴─────────────────────────────────┘
//!
//!   extend(n) moves brk forward by n and returns the old brk.
//! ```
//!
//! Reserving the whole region up front keeps the heap contiguous even when
//! several allocator instances live in one process, which a raw `sbrk`
//! break cannot guarantee. The break only ever moves forward; the region is
//! returned to the OS when the facade is dropped.

use std::ptr;

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void};

/// Default arena reservation: 20 MiB, plenty for every workload the
/// allocators are exercised with.
pub const MAX_HEAP: usize = 20 * (1 << 20);

/// A contiguous, monotonically growing heap region.
pub struct MemorySystem {
  lo: *mut u8,
  brk: *mut u8,
  limit: *mut u8,
  capacity: usize,
}

impl MemorySystem {
  /// Reserves the default-sized region.
  pub fn new() -> Option<Self> {
    Self::with_capacity(MAX_HEAP)
  }

  /// Reserves a region of at most `capacity` bytes. Returns `None` if the
  /// OS refuses the mapping.
  pub fn with_capacity(capacity: usize) -> Option<Self> {
    unsafe {
      let lo = libc::mmap(
        ptr::null_mut(),
        capacity,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
      );
      if lo == MAP_FAILED {
        log::error!("mmap refused a {capacity}-byte heap reservation");
        return None;
      }

      let lo = lo as *mut u8;
      Some(Self {
        lo,
        brk: lo,
        limit: lo.add(capacity),
        capacity,
      })
    }
  }

  /// Grows the heap by `incr` bytes and returns the old break, the first
  /// byte of the newly usable region. Returns null when the reservation is
  /// exhausted; the break is left untouched in that case.
  pub fn extend(
    &mut self,
    incr: usize,
  ) -> *mut u8 {
    let remaining = self.limit as usize - self.brk as usize;
    if incr > remaining {
      log::error!("heap reservation exhausted: asked for {incr} bytes, {remaining} left");
      return ptr::null_mut();
    }

    let old = self.brk;
    self.brk = unsafe { self.brk.add(incr) };
    old
  }

  /// First byte of the heap.
  pub fn lo(&self) -> *mut u8 {
    self.lo
  }

  /// Current break: one past the last usable heap byte.
  pub fn hi(&self) -> *mut u8 {
    self.brk
  }

  /// Bytes handed out so far.
  pub fn len(&self) -> usize {
    self.brk as usize - self.lo as usize
  }

  pub fn is_empty(&self) -> bool {
    self.brk == self.lo
  }
}

impl Drop for MemorySystem {
  fn drop(&mut self) {
    unsafe {
      libc::munmap(self.lo as *mut c_void, self.capacity);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extend_returns_contiguous_regions() {
    let mut mem = MemorySystem::with_capacity(1 << 16).unwrap();
    assert!(mem.is_empty());

    let a = mem.extend(64);
    let b = mem.extend(128);
    assert!(!a.is_null());
    assert_eq!(a, mem.lo());
    assert_eq!(unsafe { a.add(64) }, b);
    assert_eq!(192, mem.len());
    assert_eq!(unsafe { b.add(128) }, mem.hi());
  }

  #[test]
  fn extend_past_the_reservation_fails_without_moving_the_break() {
    let mut mem = MemorySystem::with_capacity(4096).unwrap();

    assert!(!mem.extend(4096).is_null());
    let brk = mem.hi();

    assert!(mem.extend(8).is_null());
    assert_eq!(brk, mem.hi());
    assert_eq!(4096, mem.len());
  }

  #[test]
  fn extended_memory_is_writable() {
    let mut mem = MemorySystem::with_capacity(4096).unwrap();
    let p = mem.extend(256);

    unsafe {
      ptr::write_bytes(p, 0xA5, 256);
      assert_eq!(0xA5, p.read());
      assert_eq!(0xA5, p.add(255).read());
    }
  }
}
