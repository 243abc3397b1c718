//! Fragments a page on purpose and shows the block-level diagnostics
//! before and after the holes coalesce.

use structalloc::StructAlloc;

fn main() {
    env_logger::init();

    let mut alloc = StructAlloc::new();

    alloc.register("employee", 96).expect("fresh name");

    let blocks: Vec<*mut u8> = (0..5).map(|_| alloc.xcalloc("employee", 1)).collect();

    // punch a hole in the middle of the page
    unsafe { alloc.xfree(blocks[2]) };

    println!("--- one hole ---");
    alloc.print_memory_usage(Some("employee"));
    alloc.print_block_usage();

    // freeing both neighbours merges the three spans into one
    unsafe {
        alloc.xfree(blocks[1]);
        alloc.xfree(blocks[3]);
    }

    println!("--- after coalescing ---");
    alloc.print_memory_usage(Some("employee"));
    alloc.print_block_usage();

    unsafe {
        alloc.xfree(blocks[0]);
        alloc.xfree(blocks[4]);
    }

    println!("--- everything freed ---");
    alloc.print_memory_usage(Some("employee"));
    alloc.print_block_usage();
}
