//! Kernel panic and allocation error handlers.
//!
//! Serial is the only output surface in scope here; the framebuffer Red
//! Screen of Death lives in the display subsystem, not this crate.

use core::panic::PanicInfo;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::arch::hal::disable_interrupts();

    crate::serial_println!("=== KERNEL PANIC ===");
    crate::serial_println!("{}", info);

    loop {
        crate::arch::hal::halt();
    }
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("heap allocation failed: {:?}", layout);
}
