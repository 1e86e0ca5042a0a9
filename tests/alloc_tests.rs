use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use libw32::Process;

/// Counts allocations made by the calling thread.
struct Counting;

thread_local! {
    static ALLOCS: Cell<usize> = const { Cell::new(0) };
    static FREES: Cell<usize> = const { Cell::new(0) };
}

fn bump(counter: &'static std::thread::LocalKey<Cell<usize>>) {
    let _ = counter.try_with(|c| c.set(c.get() + 1));
}

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        bump(&ALLOCS);
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        bump(&FREES);
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static GLOBAL: Counting = Counting;

fn counts() -> (usize, usize) {
    (ALLOCS.with(Cell::get), FREES.with(Cell::get))
}

#[test]
fn close_releases_every_entry_once() {
    let (mut proc, host) = Process::in_memory();
    host.mkdir("C:\\many").unwrap();
    for i in 0..32 {
        host.create_file(&format!("C:\\many\\file{i:02}.dat"), i).unwrap();
    }
    // warm up any lazily created state
    proc.opendir("C:\\many").unwrap().close();

    let (allocs_before, frees_before) = counts();
    let mut dir = proc.opendir("C:\\many").unwrap();
    assert_eq!(dir.len(), 33);
    while dir.read().is_some() {}

    let (allocs_open, frees_open) = counts();
    let live = (allocs_open - allocs_before) - (frees_open - frees_before);
    // one name per entry, the entry vector and the scratch record's name
    assert!(live >= 33 + 2, "only {live} live allocations");

    dir.close();
    let (allocs_after, frees_after) = counts();
    assert_eq!(allocs_after, allocs_open, "close allocated");
    assert_eq!(frees_after - frees_open, live);
}
