//! Minimal hardware-abstraction seam consumed by the networking stack.
//!
//! Mirrors the subset of the platform HAL that `net::` and `sync::` actually
//! call: a monotonic tick counter and interrupt enable/disable. Everything
//! else (page tables, PCI enumeration, per-arch boot code) lives in drivers
//! and arch code outside this crate's scope and is not modeled here.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Ticks since boot, advanced by the timer interrupt handler (or, under
/// `cfg(test)`, by [`advance_ticks`]).
static TICKS: AtomicU32 = AtomicU32::new(0);
static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Current value of the monotonic tick counter.
///
/// One tick corresponds to one timer interrupt period (10ms on real
/// hardware); retransmission and cache timeouts are expressed in ticks.
#[inline]
pub fn timer_current_ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Advance the tick counter. Called from the timer interrupt handler.
#[inline]
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
pub fn advance_ticks(n: u32) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}

#[inline]
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.store(false, Ordering::Relaxed);
}

#[inline]
pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.store(true, Ordering::Relaxed);
}

/// Logical CPU index of the calling core. Single-core target for now.
#[inline]
pub fn cpu_id() -> u32 {
    0
}

/// Halt the CPU until the next interrupt.
#[inline]
pub fn halt() {
    #[cfg(all(not(test), target_arch = "x86_64"))]
    unsafe {
        core::arch::asm!("hlt");
    }
    #[cfg(any(test, not(target_arch = "x86_64")))]
    core::hint::spin_loop();
}
