// Copyright (c) 2024-2026 Christian Moeller
// SPDX-License-Identifier: MIT

//! `anynet` — the networking subsystem of an educational kernel: netbuf
//! pooling, a device registry, Ethernet/ARP, IPv4 with routing and
//! fragmentation/reassembly, ICMP, UDP, a full TCP state machine
//! (congestion control, RTT estimation, TIME_WAIT), a BSD-style socket
//! layer, and a recursive DNS resolver with cache.
//!
//! Built as a library so the protocol logic can run under a hosted `std`
//! test harness (`cargo test`) as well as link into the `no_std` kernel
//! binary in `main.rs`. [`arch::hal`] is the narrow seam the stack depends
//! on in place of a real interrupt controller, page tables, or PCI
//! enumeration — those live in a full kernel, not here.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), feature(alloc_error_handler))]
#![allow(dead_code, static_mut_refs)]

extern crate alloc;

pub mod arch;
pub mod drivers;
pub mod logging;
pub mod net;
pub mod sync;
pub mod task;

mod panic;
