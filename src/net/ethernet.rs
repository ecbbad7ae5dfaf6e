//! Ethernet frame handling: length validation, destination classification,
//! and dispatch to ARP/IPv4 on receive; header construction on send.
//!
//! Frames arrive as a pool-backed [`NetbufHandle`] allocated by
//! [`super::device::receive`]; the header is inspected and pulled off in
//! place (no copy) before the remaining payload is handed up to the next
//! layer. On send, the header is pushed in front of the caller's payload
//! the same way, so both directions exercise the pool rather than only
//! building frames out of ad hoc `Vec<u8>`s.

use super::netbuf::NetbufHandle;
use super::types::MacAddr;

/// EtherType value for ARP frames.
pub const ETHERTYPE_ARP: u16  = 0x0806;
/// EtherType value for IPv4 frames.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

const ETH_HEADER_LEN: usize = 14;
/// Smallest legal Ethernet frame, excluding FCS (RFC 894 padding floor).
const MIN_FRAME_LEN: usize = 60;
/// Largest legal untagged Ethernet frame, excluding FCS.
const MAX_FRAME_LEN: usize = 1518;

/// Where a frame's destination MAC places it relative to the receiving device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Broadcast,
    Multicast,
    UnicastForUs,
    UnicastOther,
}

fn classify(dst: MacAddr, our_mac: MacAddr) -> Destination {
    if dst == MacAddr::BROADCAST {
        Destination::Broadcast
    } else if dst.0[0] & 0x01 != 0 {
        // I/G bit set: group (multicast) address.
        Destination::Multicast
    } else if dst == our_mac {
        Destination::UnicastForUs
    } else {
        Destination::UnicastOther
    }
}

/// Validate length, classify the destination, and (unless `promisc`) drop
/// unicast frames addressed to someone else, then strip the header and
/// dispatch the remainder by EtherType.
pub fn handle_frame(dev_name: &str, promisc: bool, mut buf: NetbufHandle) {
    let len = buf.len();
    if len < MIN_FRAME_LEN || len > MAX_FRAME_LEN {
        log::debug!("{}: dropping frame with invalid length {}", dev_name, len);
        let _ = super::device::with_device(dev_name, |d| {
            d.stats.rx_errors += 1;
            d.stats.rx_dropped += 1;
        });
        return;
    }

    let our_mac = super::config().mac;
    let header = buf.with_bytes(|data| {
        if data.len() < ETH_HEADER_LEN {
            return None;
        }
        let dst = MacAddr([data[0], data[1], data[2], data[3], data[4], data[5]]);
        let ethertype = ((data[12] as u16) << 8) | data[13] as u16;
        Some((dst, ethertype))
    });
    let (dst, ethertype) = match header {
        Some(h) => h,
        None => return,
    };

    match classify(dst, our_mac) {
        Destination::UnicastOther if !promisc => {
            let _ = super::device::with_device(dev_name, |d| d.stats.rx_dropped += 1);
            return;
        }
        _ => {}
    }

    if buf.pull(ETH_HEADER_LEN).is_none() {
        return;
    }

    // Copy the remaining window out before dispatching: IPv4/ARP handling
    // above this layer may itself need to allocate a netbuf (e.g. an ICMP
    // reply), and that would deadlock against the pool lock `with_bytes`
    // would otherwise hold for the duration of the closure.
    let payload = buf.to_vec();
    drop(buf);

    match ethertype {
        ETHERTYPE_ARP => super::arp::handle_arp(&payload),
        ETHERTYPE_IPV4 => super::ipv4::handle_ipv4(&payload),
        _ => {}
    }
}

/// Build an Ethernet frame around `payload` in a pool-backed netbuf and
/// transmit it out the default device, padding to the minimum frame size.
pub fn send_frame(dst: MacAddr, ethertype: u16, payload: &[u8]) {
    let our_mac = super::config().mac;

    let mut buf = match super::netbuf::alloc() {
        Some(b) => b,
        None => {
            log::warn!("eth: netbuf pool exhausted, dropping {} byte tx frame", payload.len());
            return;
        }
    };

    match buf.put(payload.len()) {
        Some(mut dst_bytes) => dst_bytes.copy_from_slice(payload),
        None => {
            log::warn!("eth: payload ({} bytes) exceeds netbuf tailroom", payload.len());
            return;
        }
    }

    match buf.push(ETH_HEADER_LEN) {
        Some(mut hdr) => {
            hdr[0..6].copy_from_slice(&dst.0);
            hdr[6..12].copy_from_slice(&our_mac.0);
            hdr[12] = (ethertype >> 8) as u8;
            hdr[13] = (ethertype & 0xFF) as u8;
        }
        None => {
            log::warn!("eth: insufficient headroom for Ethernet header");
            return;
        }
    }

    let mut frame = buf.to_vec();
    while frame.len() < MIN_FRAME_LEN {
        frame.push(0);
    }

    if let Err(e) = super::device::transmit(&frame) {
        log::warn!("eth: tx failed: {:?}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;
    use serial_test::serial;
    use super::super::device;
    use super::super::error::NetResult;

    struct LoopbackOps {
        sent: Vec<Vec<u8>>,
    }

    impl device::DeviceOps for LoopbackOps {
        fn open(&mut self) -> NetResult<()> { Ok(()) }
        fn close(&mut self) -> NetResult<()> { Ok(()) }
        fn start_xmit(&mut self, frame: &[u8]) -> NetResult<()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }
        fn set_mac(&mut self, _mac: MacAddr) -> NetResult<()> { Ok(()) }
        fn ioctl(&mut self, _cmd: u32, _arg: u32) -> NetResult<u32> { Ok(0) }
        fn link_up(&self) -> bool { true }
    }

    fn reset() {
        device::test_reset();
    }

    fn frame_of_len(dst: MacAddr, ethertype: u16, len: usize) -> Vec<u8> {
        let our_mac = MacAddr([9, 9, 9, 9, 9, 9]);
        let mut f = Vec::with_capacity(len);
        f.extend_from_slice(&dst.0);
        f.extend_from_slice(&our_mac.0);
        f.push((ethertype >> 8) as u8);
        f.push((ethertype & 0xFF) as u8);
        while f.len() < len {
            f.push(0);
        }
        f
    }

    #[test]
    #[serial]
    fn short_frame_is_dropped_and_counted() {
        crate::logging::init_for_test();
        reset();
        device::register("eth0", MacAddr([1, 2, 3, 4, 5, 6]), Box::new(LoopbackOps { sent: vec![] })).unwrap();
        let raw = frame_of_len(MacAddr([1, 2, 3, 4, 5, 6]), ETHERTYPE_IPV4, 40);
        let buf = super::super::netbuf::alloc_from(&raw).unwrap();
        handle_frame("eth0", false, buf);
        device::with_device("eth0", |d| assert_eq!(d.stats.rx_dropped, 1)).unwrap();
    }

    #[test]
    #[serial]
    fn unicast_not_for_us_is_dropped_unless_promiscuous() {
        reset();
        device::register("eth0", MacAddr([1, 2, 3, 4, 5, 6]), Box::new(LoopbackOps { sent: vec![] })).unwrap();
        let raw = frame_of_len(MacAddr([7, 7, 7, 7, 7, 7]), ETHERTYPE_IPV4, MIN_FRAME_LEN);

        let buf = super::super::netbuf::alloc_from(&raw).unwrap();
        handle_frame("eth0", false, buf);
        device::with_device("eth0", |d| assert_eq!(d.stats.rx_dropped, 1)).unwrap();

        let buf = super::super::netbuf::alloc_from(&raw).unwrap();
        handle_frame("eth0", true, buf);
        device::with_device("eth0", |d| assert_eq!(d.stats.rx_dropped, 1)).unwrap();
    }

    #[test]
    fn classify_recognizes_broadcast_multicast_unicast() {
        let us = MacAddr([2, 0, 0, 0, 0, 1]);
        assert_eq!(classify(MacAddr::BROADCAST, us), Destination::Broadcast);
        assert_eq!(classify(MacAddr([0x01, 0x00, 0x5E, 0, 0, 1]), us), Destination::Multicast);
        assert_eq!(classify(us, us), Destination::UnicastForUs);
        assert_eq!(classify(MacAddr([2, 0, 0, 0, 0, 2]), us), Destination::UnicastOther);
    }

    #[test]
    #[serial]
    fn send_frame_pads_to_minimum_and_transmits() {
        reset();
        device::register("eth0", MacAddr([1, 2, 3, 4, 5, 6]), Box::new(LoopbackOps { sent: vec![] })).unwrap();
        send_frame(MacAddr::BROADCAST, ETHERTYPE_ARP, b"hi");
        device::with_device("eth0", |d| assert_eq!(d.stats.tx_packets, 1)).unwrap();
    }
}
