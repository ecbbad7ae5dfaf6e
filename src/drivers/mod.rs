//! Device drivers consumed by the networking stack.
//!
//! Only the serial console (for diagnostics/panic output) and the network
//! driver seam live here; storage, display, input, and USB drivers are a
//! different subsystem entirely.

pub mod network;
pub mod serial;
