//! Demonstration driver: exercises the allocator the way a caller would and
//! dumps the free index between steps.

use core::ptr::NonNull;

use palloc::heap::block::Block;
use palloc::{alloc, free, realloc, show};

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Peek at the payload size behind a live allocation.
fn payload_size(ptr: *mut u8) -> usize {
    unsafe { Block::from_payload(NonNull::new(ptr).expect("allocation failed")).size() }
}

fn main() {
    log::set_logger(&LOGGER).ok();
    log::set_max_level(log::LevelFilter::Trace);

    let p1 = alloc(100_000);
    show("oversized request, an arena of its own");
    println!("p1 carries {} bytes\n", payload_size(p1));

    let p2 = alloc(5);
    let p3 = alloc(543);
    let p4 = alloc(4096);
    println!("p2 carries {} bytes", payload_size(p2));
    println!("p3 carries {} bytes", payload_size(p3));
    println!("p4 carries {} bytes", payload_size(p4));
    show("three small allocations carved from one arena");

    let p5 = alloc(543);
    println!("p5 carries {} bytes", payload_size(p5));
    show("another 543-byte allocation, split from the remainder");

    let p1 = unsafe { realloc(p1, 80_000) };
    println!("p1 reallocated, now {} bytes", payload_size(p1));
    show("oversized reallocation moved to a snug arena");

    unsafe { free(p5) };
    show("p5 freed and re-indexed");

    let p4 = unsafe { realloc(p4, 2543) };
    println!("p4 reallocated, now {} bytes", payload_size(p4));
    show("p4 shrunk in place, the cut returned to the index");

    unsafe {
        free(p4);
        free(p3);
        free(p2);
        free(p1);
    }
    show("everything freed, every arena handed back");
}
