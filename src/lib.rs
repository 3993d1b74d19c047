//! # rmalloc - Boundary-Tag Dynamic Storage Allocators
//!
//! This crate implements a general-purpose dynamic storage allocator over a
//! single contiguous, monotonically growing byte region, in three
//! progressively sophisticated variants that share one block format:
//!
//! ```text
//!   Heap layout (all variants):
//!
//!   ┌─────┬──────────┬──────────────────────────────────────┬──────────┐
//!   │ pad │ prologue │    blocks: allocated and free,       │ epilogue │
//!   │     │ (alloc)  │    each with header + footer tags    │ (alloc)  │
//!   └─────┴──────────┴──────────────────────────────────────┴──────────┘
//!                                                           ▲
//!                                      heap grows this way ─┘
//!
//!   Single block:
//!
//!   ┌────────────────┬───────────────────────────┬────────────────┐
//!   │ header (4B)    │ payload / free-link area  │ footer (4B)    │
//!   │ size|alloc|tag │                           │ size|alloc|tag │
//!   └────────────────┴───────────────────────────┴────────────────┘
//!                    ▲
//!                    └── pointer returned to the caller (8-byte aligned)
//! ```
//!
//! The prologue and epilogue are allocated sentinel blocks, so coalescing
//! can always read a neighbor's boundary tag without bounds checks.
//!
//! ## The three variants
//!
//! | Type                   | Free-block index                | Fit policy   |
//! |------------------------|---------------------------------|--------------|
//! | [`ImplicitAllocator`]  | none - linear heap walk         | next fit     |
//! | [`ExplicitAllocator`]  | one LIFO doubly linked list     | first fit    |
//! | [`SegregatedAllocator`]| 20 size-bucketed ordered lists  | best of bucket |
//!
//! All three split a chosen free block when the tail would make a valid
//! 16-byte block, coalesce eagerly on release, and grow the heap through
//! the [`mem::MemorySystem`] facade when no fit exists. The segregated
//! variant additionally tags the block after a freshly resized one as
//! *reserved*, hiding it from fit search and coalescing so a likely
//! follow-up resize can absorb it in place.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rmalloc::SegregatedAllocator;
//!
//! fn main() {
//!     let mut heap = SegregatedAllocator::new().expect("heap reservation failed");
//!
//!     unsafe {
//!         let p = heap.allocate(64);
//!         assert!(!p.is_null());
//!
//!         let p = heap.reallocate(p, 1024);
//!         heap.deallocate(p);
//!     }
//! }
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no locks, no atomics; wrap an instance in a
//!   `Mutex` if you must share it.
//! - **No heap shrinking**: released memory is recycled, never returned to
//!   the OS before the allocator is dropped.
//! - **8-byte alignment only**: requests with stronger alignment needs are
//!   out of scope.
//! - **Unchecked pointers**: releasing a pointer this allocator did not
//!   return, or releasing twice, is undefined behavior by design.

pub mod align;
mod block;
mod explicit;
mod header;
mod implicit;
pub mod mem;
mod seglist;

pub use block::HeapStats;
pub use explicit::ExplicitAllocator;
pub use implicit::ImplicitAllocator;
pub use seglist::SegregatedAllocator;

/// Word size: the width of one boundary tag.
pub const WORD: usize = 4;

/// Double word: payload alignment and the per-block tag overhead.
pub const DWORD: usize = 8;

/// Smallest representable block: header + two link words + footer.
pub const MIN_BLOCK: usize = 16;
