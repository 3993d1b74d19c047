use std::io::Read;
use std::ptr;

use rmalloc::SegregatedAllocator;

/// Waits until the user presses ENTER.
/// Useful when you want to follow the block maps step by step, or inspect
/// the process with tools like `pmap` or `gdb` between operations.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn main() {
  // The segregated allocator: 20 size-class free lists over one
  // boundary-tagged heap, with tail placement for large requests and
  // reservation tagging for realloc-heavy workloads.
  let mut heap = SegregatedAllocator::new().expect("heap reservation failed");

  unsafe {
    println!("[0] Fresh heap: sentinels plus one small free block.");
    heap.dump();
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 1) A small allocation: placed at the head of its free block, the
    //    tail split off and filed under its size class.
    // --------------------------------------------------------------------
    let small = heap.allocate(24);
    println!("\n[1] allocate(24) -> {small:?}");
    small.write(0x2A);
    heap.dump();
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 2) A large allocation: note that it lands at the *tail* of the free
    //    region, not the head. Big blocks tend to be released early, and
    //    a big block at the tail coalesces with whatever follows it.
    // --------------------------------------------------------------------
    let big = heap.allocate(600);
    println!("\n[2] allocate(600) -> {big:?} (tail-placed)");
    ptr::write_bytes(big, 0xAB, 600);
    heap.dump();
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 3) Grow the small allocation. The resize pads its target by 128
    //    bytes and absorbs the free successor in place, so the pointer is
    //    unchanged and nothing is copied.
    // --------------------------------------------------------------------
    let grown = heap.reallocate(small, 200);
    println!("\n[3] reallocate(.., 200) -> {grown:?}");
    println!(
      "[3] in place? {}",
      if grown == small { "yes, absorbed the free successor" } else { "no, relocated" }
    );
    println!("[3] payload prefix survived: {}", grown.read() == 0x2A);
    heap.dump();
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 4) Release the large block, then the grown one. Watch the free
    //    blocks coalesce back into a single region.
    // --------------------------------------------------------------------
    heap.deallocate(big);
    println!("\n[4] deallocate(big)");
    heap.dump();
    block_until_enter_pressed();

    heap.deallocate(grown);
    println!("\n[5] deallocate(grown)");
    heap.dump();

    let stats = heap.check_heap();
    println!(
      "\n[5] {} free block(s), {} free bytes, largest {}",
      stats.free_blocks, stats.free_bytes, stats.largest_free
    );
    println!("\n[6] End of walkthrough. The region is unmapped on drop.");
  }
}
