//! UDP (User Datagram Protocol) -- connectionless datagram transport.
//! Supports port binding, non-blocking and blocking receive, raw sends for DHCP,
//! per-port options (broadcast, receive timeout), and multicast/broadcast destinations.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use super::types::Ipv4Addr;
use super::ipv4::Ipv4Packet;
use crate::sync::spinlock::Spinlock;

const UDP_HEADER_LEN: usize = 8;
const MAX_QUEUE_LEN: usize = 128;

// Socket option constants (match stdlib)
pub const SO_BROADCAST: u32 = 1;
pub const SO_RCVTIMEO: u32 = 2;
/// Non-standard: enables/disables UDP checksum generation and verification
/// on a bound port. On by default, matching RFC 768's recommendation.
pub const SO_CHECKSUM: u32 = 3;

/// Datagrams dropped because a bound port's receive queue was full.
static BUFFER_FULL: AtomicU64 = AtomicU64::new(0);

pub fn buffer_full() -> u64 {
    BUFFER_FULL.load(Ordering::Relaxed)
}

/// A received UDP datagram with source address/port and payload.
pub struct UdpDatagram {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub data: Vec<u8>,
}

/// Per-port configuration and receive queue.
struct PortConfig {
    queue: VecDeque<UdpDatagram>,
    broadcast: bool,
    timeout_ms: u32,
    checksum_on: bool,
}

impl PortConfig {
    fn new() -> Self {
        PortConfig {
            queue: VecDeque::new(),
            broadcast: false,
            timeout_ms: 0,
            checksum_on: true,
        }
    }
}

/// Port bindings: port -> config + queue of received datagrams
static UDP_PORTS: Spinlock<Option<BTreeMap<u16, PortConfig>>> = Spinlock::new(None);

/// Initialize the UDP subsystem. Must be called before binding ports.
pub fn init() {
    let mut ports = UDP_PORTS.lock();
    *ports = Some(BTreeMap::new());
}

/// Bind to a UDP port (creates a receive queue). Returns true if newly bound.
pub fn bind(port: u16) -> bool {
    let mut ports = UDP_PORTS.lock();
    if let Some(map) = ports.as_mut() {
        if map.contains_key(&port) {
            return false; // already bound
        }
        map.insert(port, PortConfig::new());
        true
    } else {
        false
    }
}

/// Unbind a UDP port
pub fn unbind(port: u16) {
    let mut ports = UDP_PORTS.lock();
    if let Some(map) = ports.as_mut() {
        map.remove(&port);
    }
}

/// Set a per-port option. Returns true on success.
pub fn set_opt(port: u16, opt: u32, val: u32) -> bool {
    let mut ports = UDP_PORTS.lock();
    if let Some(map) = ports.as_mut() {
        if let Some(cfg) = map.get_mut(&port) {
            match opt {
                SO_BROADCAST => { cfg.broadcast = val != 0; true }
                SO_RCVTIMEO => { cfg.timeout_ms = val; true }
                SO_CHECKSUM => { cfg.checksum_on = val != 0; true }
                _ => false,
            }
        } else {
            false
        }
    } else {
        false
    }
}

/// Get the receive timeout for a bound port (ms). Returns 0 if not bound or non-blocking.
pub fn get_timeout_ms(port: u16) -> u32 {
    let ports = UDP_PORTS.lock();
    if let Some(map) = ports.as_ref() {
        if let Some(cfg) = map.get(&port) {
            return cfg.timeout_ms;
        }
    }
    0
}

/// Check if broadcast is enabled on a port.
pub fn is_broadcast_enabled(port: u16) -> bool {
    let ports = UDP_PORTS.lock();
    if let Some(map) = ports.as_ref() {
        if let Some(cfg) = map.get(&port) {
            return cfg.broadcast;
        }
    }
    false
}

/// Check if checksum generation/verification is enabled on a port. Defaults
/// to `true` (and applies to the on-wire side regardless of port, since the
/// wire doesn't know which local port bound the socket) unless a bound
/// port's config says otherwise.
pub fn is_checksum_enabled(port: u16) -> bool {
    let ports = UDP_PORTS.lock();
    if let Some(map) = ports.as_ref() {
        if let Some(cfg) = map.get(&port) {
            return cfg.checksum_on;
        }
    }
    true
}

/// Send a UDP datagram. For broadcast destinations, the source port must have
/// SO_BROADCAST enabled (or `force_broadcast` must be true for internal callers).
pub fn send(dst_ip: Ipv4Addr, src_port: u16, dst_port: u16, data: &[u8]) -> bool {
    // Check broadcast permission
    if dst_ip == Ipv4Addr::BROADCAST || dst_ip.is_broadcast_for(super::config().mask) {
        if !is_broadcast_enabled(src_port) {
            return false;
        }
    }
    send_unchecked(dst_ip, src_port, dst_port, data)
}

/// Internal send without broadcast permission check (for kernel-internal callers like DHCP).
pub fn send_unchecked(dst_ip: Ipv4Addr, src_port: u16, dst_port: u16, data: &[u8]) -> bool {
    let src_ip = super::config().ip;
    let checksum_on = is_checksum_enabled(src_port);
    let udp = build_segment(src_ip, dst_ip, src_port, dst_port, data, checksum_on);
    super::ipv4::send_ipv4(dst_ip, super::ipv4::PROTO_UDP, &udp)
}

/// Send a UDP datagram with raw IP (for DHCP before config)
pub fn send_raw(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dst_mac: super::types::MacAddr,
                src_port: u16, dst_port: u16, data: &[u8]) -> bool {
    let checksum_on = is_checksum_enabled(src_port);
    let udp = build_segment(src_ip, dst_ip, src_port, dst_port, data, checksum_on);
    super::ipv4::send_ipv4_raw(src_ip, dst_ip, dst_mac, super::ipv4::PROTO_UDP, &udp)
}

/// Build a UDP segment, computing the checksum over the pseudo-header and
/// segment when `checksum_on` is set. RFC 768: a computed checksum of
/// exactly zero is transmitted as all-ones, since all-zero on the wire
/// means "no checksum".
fn build_segment(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16, data: &[u8], checksum_on: bool) -> Vec<u8> {
    let total_len = UDP_HEADER_LEN + data.len();
    let mut udp = Vec::with_capacity(total_len);

    udp.push((src_port >> 8) as u8);
    udp.push((src_port & 0xFF) as u8);
    udp.push((dst_port >> 8) as u8);
    udp.push((dst_port & 0xFF) as u8);
    udp.push((total_len >> 8) as u8);
    udp.push((total_len & 0xFF) as u8);
    udp.push(0); udp.push(0); // checksum placeholder
    udp.extend_from_slice(data);

    if checksum_on {
        let pseudo_sum = super::checksum::pseudo_header_checksum(
            src_ip.as_bytes(),
            dst_ip.as_bytes(),
            super::ipv4::PROTO_UDP,
            total_len as u16,
        );

        let mut sum = pseudo_sum;
        let mut i = 0;
        while i + 1 < total_len {
            sum += ((udp[i] as u32) << 8) | (udp[i + 1] as u32);
            i += 2;
        }
        if i < total_len {
            sum += (udp[i] as u32) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        let cksum = match !(sum as u16) {
            0 => 0xFFFF,
            c => c,
        };
        udp[6] = (cksum >> 8) as u8;
        udp[7] = (cksum & 0xFF) as u8;
    }

    udp
}

/// Receive a UDP datagram on a bound port (non-blocking)
pub fn recv(port: u16) -> Option<UdpDatagram> {
    let mut ports = UDP_PORTS.lock();
    if let Some(map) = ports.as_mut() {
        if let Some(cfg) = map.get_mut(&port) {
            return cfg.queue.pop_front();
        }
    }
    None
}

/// Receive a UDP datagram with timeout (blocking with polling)
pub fn recv_timeout(port: u16, timeout_ticks: u32) -> Option<UdpDatagram> {
    let start = crate::arch::hal::timer_current_ticks();
    loop {
        super::poll();

        if let Some(dgram) = recv(port) {
            return Some(dgram);
        }

        let now = crate::arch::hal::timer_current_ticks();
        if now.wrapping_sub(start) >= timeout_ticks {
            return None;
        }

        core::hint::spin_loop();
    }
}

/// Handle an incoming UDP packet. A non-zero checksum field is verified
/// against the pseudo-header; an all-zero field means the sender opted out
/// (RFC 768) and is accepted unconditionally.
pub fn handle_udp(pkt: &Ipv4Packet<'_>) {
    let data = pkt.payload;
    if data.len() < UDP_HEADER_LEN { return; }

    let src_port = ((data[0] as u16) << 8) | data[1] as u16;
    let dst_port = ((data[2] as u16) << 8) | data[3] as u16;
    let length = ((data[4] as u16) << 8) | data[5] as u16;
    let checksum = ((data[6] as u16) << 8) | data[7] as u16;

    if (length as usize) > data.len() { return; }
    let segment = &data[..length as usize];

    if checksum != 0 {
        let pseudo_sum = super::checksum::pseudo_header_checksum(
            pkt.src.as_bytes(),
            pkt.dst.as_bytes(),
            super::ipv4::PROTO_UDP,
            length,
        );
        let mut sum = pseudo_sum;
        let mut i = 0;
        while i + 1 < segment.len() {
            sum += ((segment[i] as u32) << 8) | (segment[i + 1] as u32);
            i += 2;
        }
        if i < segment.len() {
            sum += (segment[i] as u32) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        if !(sum as u16) != 0 {
            log::debug!("udp: checksum mismatch from {:?}:{}, dropping", pkt.src, src_port);
            return;
        }
    }

    let payload = &data[UDP_HEADER_LEN..(length as usize)];

    let mut ports = UDP_PORTS.lock();
    if let Some(map) = ports.as_mut() {
        if let Some(cfg) = map.get_mut(&dst_port) {
            if cfg.queue.len() < MAX_QUEUE_LEN {
                cfg.queue.push_back(UdpDatagram {
                    src_ip: pkt.src,
                    src_port,
                    data: Vec::from(payload),
                });
            } else {
                BUFFER_FULL.fetch_add(1, Ordering::Relaxed);
                log::debug!("udp: receive queue full on port {}, dropping datagram", dst_port);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset() {
        init();
    }

    fn test_packet<'a>(src: Ipv4Addr, dst: Ipv4Addr, segment: &'a [u8]) -> super::super::ipv4::Ipv4Packet<'a> {
        super::super::ipv4::Ipv4Packet {
            src,
            dst,
            protocol: super::super::ipv4::PROTO_UDP,
            ttl: 64,
            payload: segment,
            total_len: 0,
            header_len: 20,
            id: 0,
            dont_fragment: false,
            more_fragments: false,
            frag_offset: 0,
        }
    }

    #[test]
    #[serial]
    fn build_segment_computes_verifiable_checksum() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let segment = build_segment(src, dst, 53, 12345, b"hello", true);
        assert_ne!(segment[6], 0);
        assert_ne!(segment[7], 0);

        let pkt = test_packet(src, dst, &segment);

        reset();
        bind(12345);
        handle_udp(&pkt);
        let dgram = recv(12345).expect("valid checksum should be accepted");
        assert_eq!(dgram.data, b"hello");
    }

    #[test]
    #[serial]
    fn handle_udp_drops_on_checksum_mismatch() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut segment = build_segment(src, dst, 53, 12346, b"hello", true);
        segment[8] ^= 0xFF; // corrupt a payload byte after the checksum was computed

        let pkt = test_packet(src, dst, &segment);

        reset();
        bind(12346);
        handle_udp(&pkt);
        assert!(recv(12346).is_none());
    }

    #[test]
    #[serial]
    fn handle_udp_accepts_disabled_checksum() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let segment = build_segment(src, dst, 53, 12347, b"hi", false);
        assert_eq!(segment[6], 0);
        assert_eq!(segment[7], 0);

        let pkt = test_packet(src, dst, &segment);

        reset();
        bind(12347);
        handle_udp(&pkt);
        assert!(recv(12347).is_some());
    }

    #[test]
    #[serial]
    fn full_queue_increments_buffer_full_and_drops() {
        crate::logging::init_for_test();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);

        reset();
        bind(12348);
        let before = buffer_full();
        for _ in 0..MAX_QUEUE_LEN + 1 {
            let segment = build_segment(src, dst, 53, 12348, b"x", false);
            let pkt = test_packet(src, dst, &segment);
            handle_udp(&pkt);
        }
        assert_eq!(buffer_full(), before + 1);
    }

    #[test]
    #[serial]
    fn checksum_opt_toggles_per_port() {
        reset();
        bind(12349);
        assert!(is_checksum_enabled(12349));
        assert!(set_opt(12349, SO_CHECKSUM, 0));
        assert!(!is_checksum_enabled(12349));
    }
}
