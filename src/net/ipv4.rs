//! IPv4: header construction/validation, routing, fragmentation, reassembly,
//! and protocol dispatch.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use super::types::{Ipv4Addr, MacAddr};
use super::checksum;
use super::ethernet;
use super::error::{NetError, NetResult};

const IPV4_HEADER_LEN: usize = 20;
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Count of received packets whose protocol number matched no handler.
static NO_PROTOCOL: AtomicU64 = AtomicU64::new(0);

/// Number of packets dropped in [`dispatch`] for lacking a registered handler.
pub fn no_protocol_count() -> u64 {
    NO_PROTOCOL.load(Ordering::Relaxed)
}

/// A parsed IPv4 header plus a view into its payload.
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub payload: &'a [u8],
    pub total_len: u16,
    pub header_len: usize,
    pub id: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Fragment offset in bytes (already multiplied out from the 8-byte wire unit).
    pub frag_offset: u16,
}

impl<'a> Ipv4Packet<'a> {
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.frag_offset != 0
    }
}

/// Parse an IPv4 packet, validating version, IHL, total length, and header checksum.
pub fn parse(data: &[u8]) -> Option<Ipv4Packet<'_>> {
    if data.len() < IPV4_HEADER_LEN {
        return None;
    }

    let version = data[0] >> 4;
    if version != 4 {
        return None;
    }

    let ihl = (data[0] & 0x0F) as usize;
    let header_len = ihl * 4;
    if header_len < IPV4_HEADER_LEN || data.len() < header_len {
        return None;
    }

    if checksum::internet_checksum(&data[..header_len]) != 0 {
        return None;
    }

    let total_len = ((data[2] as u16) << 8) | data[3] as u16;
    if (total_len as usize) > data.len() || (total_len as usize) < header_len {
        return None;
    }

    let id = ((data[4] as u16) << 8) | data[5] as u16;
    let flags_frag = ((data[6] as u16) << 8) | data[7] as u16;
    let dont_fragment = flags_frag & 0x4000 != 0;
    let more_fragments = flags_frag & 0x2000 != 0;
    let frag_offset = (flags_frag & 0x1FFF) * 8;

    let ttl = data[8];
    let protocol = data[9];
    let src = Ipv4Addr([data[12], data[13], data[14], data[15]]);
    let dst = Ipv4Addr([data[16], data[17], data[18], data[19]]);

    let payload = &data[header_len..(total_len as usize)];

    Some(Ipv4Packet {
        src, dst, protocol, ttl, payload, total_len, header_len,
        id, dont_fragment, more_fragments, frag_offset,
    })
}

fn build_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, id: u16, frag_offset: u16, more_fragments: bool, payload_len: usize) -> [u8; IPV4_HEADER_LEN] {
    let total_len = IPV4_HEADER_LEN + payload_len;
    let mut header = [0u8; IPV4_HEADER_LEN];
    header[0] = 0x45;
    header[1] = 0;
    header[2] = (total_len >> 8) as u8;
    header[3] = (total_len & 0xFF) as u8;
    header[4] = (id >> 8) as u8;
    header[5] = (id & 0xFF) as u8;

    let frag_units = frag_offset / 8;
    let mut flags_frag = frag_units & 0x1FFF;
    if more_fragments {
        flags_frag |= 0x2000;
    }
    header[6] = (flags_frag >> 8) as u8;
    header[7] = (flags_frag & 0xFF) as u8;

    header[8] = 64; // TTL
    header[9] = protocol;
    header[10] = 0;
    header[11] = 0;
    header[12..16].copy_from_slice(&src.0);
    header[16..20].copy_from_slice(&dst.0);

    let cksum = checksum::internet_checksum(&header);
    header[10] = (cksum >> 8) as u8;
    header[11] = (cksum & 0xFF) as u8;
    header
}

static IP_ID: AtomicU16 = AtomicU16::new(1);

fn next_id() -> u16 {
    IP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Resolve the destination MAC for `next_hop`/`dst`, handling broadcast specially.
fn resolve_dst_mac(dst: Ipv4Addr, next_hop: Ipv4Addr) -> NetResult<MacAddr> {
    if dst == Ipv4Addr::BROADCAST || dst.is_limited_broadcast() {
        return Ok(MacAddr::BROADCAST);
    }
    super::arp::resolve(next_hop, 200).ok_or(NetError::AddressUnresolved)
}

/// Build, fragment if necessary, and send an IPv4 packet from the
/// configured local address, routing via the routing table.
pub fn send_ipv4(dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> bool {
    send_ipv4_checked(dst, protocol, payload).is_ok()
}

pub fn send_ipv4_checked(dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> NetResult<()> {
    let cfg = super::config();

    let resolved = if dst.is_limited_broadcast() {
        super::route::Resolved { next_hop: dst, device: device_name() }
    } else {
        super::route::lookup(dst).ok_or(NetError::NoRoute)?
    };

    let dst_mac = resolve_dst_mac(dst, resolved.next_hop)?;
    send_fragmented(cfg.ip, dst, protocol, payload, dst_mac, &resolved.device)
}

/// Build and send an IPv4 packet with an explicit source IP and resolved
/// destination MAC. Used by DHCP before the interface has an address.
pub fn send_ipv4_raw(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dst_mac: MacAddr, protocol: u8, payload: &[u8]) -> bool {
    send_fragmented(src_ip, dst_ip, protocol, payload, dst_mac, &device_name()).is_ok()
}

/// MTU of the named egress interface, falling back to the stack's default
/// if the device isn't (or is no longer) registered.
fn mtu_for(device: &str) -> usize {
    super::device::with_device(device, |d| d.mtu).unwrap_or(super::device::DEFAULT_MTU)
}

fn send_fragmented(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8], dst_mac: MacAddr, device: &str) -> NetResult<()> {
    let mtu = mtu_for(device);

    if payload.len() + IPV4_HEADER_LEN <= mtu {
        return send_one(src, dst, protocol, next_id(), 0, false, payload, dst_mac);
    }

    let max_payload_per_fragment = mtu.saturating_sub(IPV4_HEADER_LEN) & !7;
    let id = next_id();
    let mut offset = 0usize;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let take = remaining.min(max_payload_per_fragment);
        let more = offset + take < payload.len();
        send_one(src, dst, protocol, id, offset as u16, more, &payload[offset..offset + take], dst_mac)?;
        offset += take;
    }
    Ok(())
}

fn send_one(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, id: u16, frag_offset: u16, more_fragments: bool, payload: &[u8], dst_mac: MacAddr) -> NetResult<()> {
    let header = build_header(src, dst, protocol, id, frag_offset, more_fragments, payload.len());
    let mut packet = Vec::with_capacity(header.len() + payload.len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(payload);
    ethernet::send_frame(dst_mac, ethernet::ETHERTYPE_IPV4, &packet);
    Ok(())
}

fn device_name() -> alloc::string::String {
    super::device::names().into_iter().next().unwrap_or_default()
}

/// Handle an incoming IPv4 packet: reassemble if fragmented, then dispatch
/// by protocol number.
pub fn handle_ipv4(data: &[u8]) {
    let pkt = match parse(data) {
        Some(p) => p,
        None => return,
    };

    if pkt.is_fragment() {
        let now = crate::arch::hal::timer_current_ticks();
        match super::reassembly::insert_fragment(
            pkt.src, pkt.dst, pkt.protocol, pkt.id, pkt.ttl,
            pkt.frag_offset, pkt.more_fragments, pkt.payload, now,
        ) {
            super::reassembly::FragmentResult::Complete(full, ttl) => {
                dispatch(pkt.src, pkt.dst, pkt.protocol, ttl, &full);
            }
            super::reassembly::FragmentResult::Pending
            | super::reassembly::FragmentResult::TableFull
            | super::reassembly::FragmentResult::Overlap => {}
        }
        return;
    }

    dispatch(pkt.src, pkt.dst, pkt.protocol, pkt.ttl, pkt.payload);
}

fn dispatch(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, ttl: u8, payload: &[u8]) {
    match protocol {
        PROTO_ICMP => {
            if let Some(pkt) = reconstruct(src, dst, protocol, ttl, payload) {
                super::icmp::handle_icmp(&pkt);
            }
        }
        PROTO_UDP => {
            if let Some(pkt) = reconstruct(src, dst, protocol, ttl, payload) {
                super::udp::handle_udp(&pkt);
            }
        }
        PROTO_TCP => {
            if let Some(pkt) = reconstruct(src, dst, protocol, ttl, payload) {
                super::tcp::handle_tcp(&pkt);
            }
        }
        _ => {
            NO_PROTOCOL.fetch_add(1, Ordering::Relaxed);
            log::debug!("ipv4: no handler for protocol {}", protocol);
        }
    }
}

/// Build a synthetic `Ipv4Packet` view over a reassembled (or never-fragmented)
/// payload, for handlers that only care about the parsed header fields.
fn reconstruct<'a>(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, ttl: u8, payload: &'a [u8]) -> Option<Ipv4Packet<'a>> {
    Some(Ipv4Packet {
        src, dst, protocol, ttl, payload,
        total_len: (IPV4_HEADER_LEN + payload.len()) as u16,
        header_len: IPV4_HEADER_LEN,
        id: 0, dont_fragment: false, more_fragments: false, frag_offset: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use serial_test::serial;
    use super::super::device::{self, DeviceOps};
    use super::super::error::NetResult;

    struct LoopbackOps;
    impl DeviceOps for LoopbackOps {
        fn open(&mut self) -> NetResult<()> { Ok(()) }
        fn close(&mut self) -> NetResult<()> { Ok(()) }
        fn start_xmit(&mut self, _frame: &[u8]) -> NetResult<()> { Ok(()) }
        fn set_mac(&mut self, _mac: MacAddr) -> NetResult<()> { Ok(()) }
        fn ioctl(&mut self, _cmd: u32, _arg: u32) -> NetResult<u32> { Ok(0) }
        fn link_up(&self) -> bool { true }
    }

    #[test]
    fn mtu_for_falls_back_to_default_when_device_missing() {
        assert_eq!(mtu_for("nonexistent"), super::super::device::DEFAULT_MTU);
    }

    #[test]
    #[serial]
    fn fragmentation_threshold_follows_device_mtu() {
        device::test_reset();
        device::register("eth0", MacAddr([1, 2, 3, 4, 5, 6]), Box::new(LoopbackOps)).unwrap();
        device::with_device("eth0", |d| d.mtu = 100).unwrap();

        // 300 bytes at a 100-byte MTU (80-byte max payload per fragment,
        // rounded down to a multiple of 8) splits into 4 fragments.
        let payload = vec![7u8; 300];
        send_ipv4_checked(Ipv4Addr::BROADCAST, PROTO_UDP, &payload).unwrap();
        device::with_device("eth0", |d| assert_eq!(d.stats.tx_packets, 4)).unwrap();
    }

    #[test]
    #[serial]
    fn unknown_protocol_is_counted() {
        let before = no_protocol_count();
        dispatch(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 253, 64, &[]);
        assert_eq!(no_protocol_count(), before + 1);
    }
}
