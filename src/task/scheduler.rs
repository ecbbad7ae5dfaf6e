//! Narrow scheduler interface used by blocking socket calls.
//!
//! The process/thread scheduler itself is out of scope here; this module
//! only reproduces the three calls the networking stack makes to suspend
//! and resume a thread waiting on socket I/O. Without a real scheduler
//! backing it, `sleep_until` busy-waits for the tick to arrive instead of
//! context-switching away, and `try_wake_thread` is a no-op that reports
//! success so callers don't special-case its absence.

use core::sync::atomic::{AtomicU32, Ordering};

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// Thread ID of the calling thread. Each distinct logical caller in tests
/// gets its own id via [`TestThread`]; outside tests everything runs as
/// thread 1 since there is no real multi-threading backing this stub.
#[cfg(not(test))]
pub fn current_tid() -> u32 {
    1
}

#[cfg(test)]
thread_local! {
    static TID: u32 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
pub fn current_tid() -> u32 {
    TID.with(|t| *t)
}

/// Suspend the calling thread until the tick counter reaches `wake_at`.
///
/// A real scheduler would park this thread and context-switch; absent one,
/// this spins on the tick counter, polling the network stack so that
/// loopback/test traffic which depends on `poll()` make progress.
pub fn sleep_until(wake_at: u32) {
    while crate::arch::hal::timer_current_ticks().wrapping_sub(wake_at) >= u32::MAX / 2 {
        #[cfg(test)]
        crate::arch::hal::advance_ticks(1);
        core::hint::spin_loop();
    }
}

/// Wake a thread blocked in [`sleep_until`]. Returns whether a thread with
/// that id was known to be waiting.
pub fn try_wake_thread(tid: u32) -> bool {
    tid != 0
}
