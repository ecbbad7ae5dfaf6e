//! Architecture abstraction layer.
//!
//! The networking stack only ever touches the timer tick counter and the
//! interrupt enable/disable primitives exposed here. Real interrupt
//! controllers, page tables, and CPU bring-up live outside this crate's
//! scope; [`hal`] is the narrow seam the stack depends on.

pub mod hal;
