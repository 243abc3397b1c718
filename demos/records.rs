//! Registers a few records and walks through the allocation round trip,
//! printing what the manager hands back.

use structalloc::StructAlloc;

fn main() {
    env_logger::init();

    let mut alloc = StructAlloc::new();

    alloc.register("employee", 96).expect("fresh name");
    alloc.register("station", 160).expect("fresh name");

    if let Err(error) = alloc.register("employee", 96) {
        println!("second registration refused: {error}");
    }

    alloc.print_registered_records();

    let team = alloc.xcalloc("employee", 5);
    let hub = alloc.xcalloc("station", 2);
    println!("5 employees at {team:?}, 2 stations at {hub:?}");

    let nobody = alloc.xcalloc("visitor", 1);
    println!("unregistered record allocates {nobody:?}");

    unsafe {
        alloc.xfree(team);
        alloc.xfree(hub);
    }
    println!("all freed, pages returned to the OS");
}
