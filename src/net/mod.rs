//! Network stack coordinator.
//! Provides global network configuration, packet polling, and sub-module access.

pub mod types;
pub mod error;
pub mod checksum;
pub mod netbuf;
pub mod device;
pub mod route;
pub mod reassembly;
pub mod ethernet;
pub mod arp;
pub mod ipv4;
pub mod icmp;
pub mod udp;
pub mod dhcp;
pub mod dns;
pub mod tcp;
pub mod socket;
pub mod interfaces;

use types::{Ipv4Addr, MacAddr, NetConfig};
use crate::sync::spinlock::Spinlock;

/// Global network configuration protected by a spinlock.
static NET_CONFIG: Spinlock<NetConfig> = Spinlock::new(NetConfig::new());

/// Initialize the network stack. Call once a device has been registered
/// with [`device::register`] (driver probing itself is out of scope here).
pub fn init() {
    let mac = device::default_mac().unwrap_or(MacAddr([0; 6]));

    {
        let mut cfg = NET_CONFIG.lock();
        cfg.mac = mac;
    }

    arp::init();
    icmp::init();
    udp::init();
    tcp::init();
    socket::init();

    crate::serial_println!("[OK] Network stack initialized (MAC={})", mac);
}

/// Get a snapshot of the current network config.
pub fn config() -> NetConfig {
    let cfg = NET_CONFIG.lock();
    NetConfig {
        ip: cfg.ip,
        mask: cfg.mask,
        gateway: cfg.gateway,
        dns: cfg.dns,
        mac: cfg.mac,
    }
}

/// Update network configuration (e.g. after DHCP or a static interface
/// apply). Also feeds the resolved DNS server into the resolver's server
/// list so `dns::resolve` picks it up without a separate wiring step.
pub fn set_config(ip: Ipv4Addr, mask: Ipv4Addr, gateway: Ipv4Addr, dns: Ipv4Addr) {
    {
        let mut cfg = NET_CONFIG.lock();
        cfg.ip = ip;
        cfg.mask = mask;
        cfg.gateway = gateway;
        cfg.dns = dns;
    }
    if dns != Ipv4Addr::ZERO {
        dns::configure_servers(&[dns]);
    }
}

/// Feed one received Ethernet frame into the stack. The driver owning the
/// device (interrupt handler or its own poll loop) calls this; how frames
/// actually arrive off the wire is outside the stack's concern. Delivered
/// to the first registered device; use [`device::receive`] directly to
/// target a specific one on a multi-device setup.
pub fn inject_frame(data: &[u8]) {
    if let Some(name) = device::names().into_iter().next() {
        device::receive(&name, data);
    }
}

/// Run the protocol stack's periodic housekeeping: TCP retransmission and
/// delayed-ACK timers, TIME_WAIT/FIN cleanup, and fragment reassembly
/// expiry. Safe to call frequently; each check is a cheap no-op when idle.
pub fn poll_rx() {
    tcp::check_retransmissions();
    reassembly::check_timeouts(crate::arch::hal::timer_current_ticks());
}

/// Alias for [`poll_rx`] kept for callers that think in terms of "run one
/// stack tick" rather than "drain pending receives".
pub fn poll() {
    poll_rx();
}
