//! Allocation-counting global allocator.
//!
//! Grounded on `zmalloc.rs`: wraps the system allocator to keep a running
//! byte count, surfaced only as a coarse stat in logging (see design notes
//! in spec section 9 on `reply_bytes` over-reporting) — never as an
//! enforced limit, since `maxmemory` accounting is a Non-goal here.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

#[global_allocator]
static ALLOCATOR: CountingAlloc = CountingAlloc;

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);

pub struct CountingAlloc;

impl CountingAlloc {
    pub fn used_memory() -> usize {
        ALLOCATED.load(Relaxed)
    }
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            ALLOCATED.fetch_add(layout.size(), Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        ALLOCATED.fetch_sub(layout.size(), Relaxed);
    }
}
