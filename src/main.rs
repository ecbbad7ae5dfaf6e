// Copyright (c) 2024-2026 Christian Moeller
// SPDX-License-Identifier: MIT

//! Thin boot harness for the networking stack.
//!
//! This binary exists to link `anynet` into something that runs: a global
//! allocator, a serial console, and a poll loop that drives the stack's
//! timers. It does not model GDT/IDT/PIC/PIT setup, physical/virtual memory,
//! or a bootloader handoff — those live in a full kernel and are out of
//! scope for this crate (see [`anynet::arch::hal`] for the seam this stack
//! actually depends on).

#![no_std]
#![no_main]
#![allow(dead_code, static_mut_refs)]

extern crate alloc;

use anynet::{arch, drivers, logging, net, serial_println};
use linked_list_allocator::LockedHeap;

/// Backing storage for the heap. 8 MiB is generous for netbufs, TCP
/// reassembly queues, and the DNS cache; this stack does no paging so the
/// whole heap is this one static array.
const HEAP_SIZE: usize = 8 * 1024 * 1024;
static mut HEAP_MEM: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[no_mangle]
pub extern "C" fn _start() -> ! {
    drivers::serial::init();
    logging::init();
    serial_println!("");
    serial_println!("==============================");
    serial_println!("  anynet boot harness");
    serial_println!("==============================");

    unsafe {
        ALLOCATOR
            .lock()
            .init(HEAP_MEM.as_mut_ptr(), HEAP_SIZE);
    }
    serial_println!("[OK] Heap initialized ({} KiB)", HEAP_SIZE / 1024);

    net::init();

    loop {
        arch::hal::tick();
        net::poll();
    }
}

// The panic and alloc-error handlers live in `anynet::panic` — this binary
// links against them rather than defining its own, since a `#[panic_handler]`
// is a single crate-graph-wide lang item.
