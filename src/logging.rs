// Copyright (c) 2024-2026 Christian Moeller
// SPDX-License-Identifier: MIT

//! Logging facade wiring.
//!
//! Library-internal diagnostics (frame drops, checksum failures, reassembly
//! rejections, pool exhaustion) go through the `log` crate rather than a
//! direct console write, so they can be filtered or redirected independently
//! of [`crate::serial_println`], which the boot harness keeps for its own
//! phase-by-phase status lines. Under `no_std` the only sink is COM1; under
//! `cargo test` nothing is installed unless a test opts in via
//! [`init_for_test`].

#[cfg(not(test))]
struct SerialLogger;

#[cfg(not(test))]
impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        crate::serial_println!("[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

#[cfg(not(test))]
static LOGGER: SerialLogger = SerialLogger;

/// Install the serial-backed logger. Call once, after [`crate::drivers::serial::init`],
/// before any other module that logs runs.
#[cfg(not(test))]
pub fn init() {
    log::set_logger(&LOGGER).ok();
    log::set_max_level(log::LevelFilter::Debug);
}

/// Install `env_logger` so a test can see its log output on stderr
/// (`cargo test -- --nocapture`). Safe to call more than once; only the
/// first call wins.
#[cfg(test)]
pub fn init_for_test() {
    let _ = env_logger::builder().is_test(true).try_init();
}
