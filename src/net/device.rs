//! Network device registry.
//!
//! A [`NetworkDevice`] wraps a driver-provided [`DeviceOps`] vtable (open,
//! close, transmit, set MAC, ioctl) with the stack-facing bookkeeping every
//! interface needs regardless of the underlying hardware: its name, MAC
//! address, MTU, [`DeviceFlags`], and [`DeviceStats`]. The registry is the
//! stack's one source of truth for "what interfaces exist" —
//! [`super::ethernet`] and [`super::route`] both look devices up by name
//! through it rather than talking to a driver directly.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use super::error::{NetError, NetResult};
use super::types::MacAddr;
use crate::sync::spinlock::Spinlock;

/// Default MTU for Ethernet-framed devices (1500 per RFC 894, plus the stack
/// itself never generates jumbo frames).
pub const DEFAULT_MTU: usize = 1500;

bitflags! {
    /// Interface flags, mirroring the `IFF_*` bits a real kernel reports via
    /// `ioctl(SIOCGIFFLAGS)`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// Administratively up. [`NetworkDevice::transmit`] refuses to send
        /// while this is clear, independent of the driver's physical link state.
        const UP        = 0b0001;
        const BROADCAST = 0b0010;
        const MULTICAST = 0b0100;
        /// Accept frames addressed to a different unicast MAC instead of
        /// dropping them in [`super::ethernet::handle_frame`].
        const PROMISC   = 0b1000;
    }
}

/// Packet counters for a device, the way `ip -s link` reports them.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

/// Capability-set vtable a device driver implements. Distinct from
/// [`crate::drivers::network::NetworkDriver`], which is the raw hardware
/// seam (PCI probe, DMA rings); `DeviceOps` is what the protocol stack
/// actually calls once a driver has been wrapped into a [`NetworkDevice`].
pub trait DeviceOps: Send {
    /// Bring the device up. Called once at registration.
    fn open(&mut self) -> NetResult<()>;
    /// Bring the device down. Buffers in flight are allowed to drain.
    fn close(&mut self) -> NetResult<()>;
    /// Transmit one already-framed Ethernet frame.
    fn start_xmit(&mut self, frame: &[u8]) -> NetResult<()>;
    /// Change the device's MAC address, if supported.
    fn set_mac(&mut self, mac: MacAddr) -> NetResult<()>;
    /// Driver-specific out-of-band control (link renegotiation, stats reset, ...).
    fn ioctl(&mut self, cmd: u32, arg: u32) -> NetResult<u32>;
    /// Whether the physical link is currently up.
    fn link_up(&self) -> bool;
}

/// A registered network interface.
pub struct NetworkDevice {
    pub name: String,
    pub mac: MacAddr,
    pub mtu: usize,
    pub flags: DeviceFlags,
    pub stats: DeviceStats,
    ops: Box<dyn DeviceOps>,
}

impl NetworkDevice {
    pub fn new(name: impl Into<String>, mac: MacAddr, ops: Box<dyn DeviceOps>) -> Self {
        NetworkDevice {
            name: name.into(),
            mac,
            mtu: DEFAULT_MTU,
            flags: DeviceFlags::UP | DeviceFlags::BROADCAST | DeviceFlags::MULTICAST,
            stats: DeviceStats::default(),
            ops,
        }
    }

    /// Transmit one already-framed Ethernet frame, accounting for it in
    /// [`DeviceStats`]. Refuses while the device is administratively down
    /// ([`DeviceFlags::UP`] clear) or the driver reports no physical link.
    pub fn transmit(&mut self, frame: &[u8]) -> NetResult<()> {
        if !self.flags.contains(DeviceFlags::UP) || !self.ops.link_up() {
            self.stats.tx_errors += 1;
            self.stats.tx_dropped += 1;
            return Err(NetError::LinkDown);
        }
        match self.ops.start_xmit(frame) {
            Ok(()) => {
                self.stats.tx_packets += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.tx_errors += 1;
                self.stats.tx_dropped += 1;
                Err(e)
            }
        }
    }

    pub fn link_up(&self) -> bool {
        self.ops.link_up()
    }

    pub fn set_mac(&mut self, mac: MacAddr) -> NetResult<()> {
        self.ops.set_mac(mac)?;
        self.mac = mac;
        Ok(())
    }

    pub fn ioctl(&mut self, cmd: u32, arg: u32) -> NetResult<u32> {
        self.ops.ioctl(cmd, arg)
    }
}

struct Registry {
    devices: Vec<NetworkDevice>,
    /// Name of the device used when a caller doesn't specify one. Set to
    /// the first device registered unless overridden.
    default: Option<usize>,
}

static REGISTRY: Spinlock<Registry> = Spinlock::new(Registry { devices: Vec::new(), default: None });

/// Register a new device under `name`, opening it immediately.
pub fn register(name: impl Into<String>, mac: MacAddr, ops: Box<dyn DeviceOps>) -> NetResult<()> {
    let mut dev = NetworkDevice::new(name, mac, ops);
    dev.ops.open()?;

    let mut reg = REGISTRY.lock();
    if reg.default.is_none() {
        reg.default = Some(reg.devices.len());
    }
    reg.devices.push(dev);
    Ok(())
}

/// Remove a device from the registry by name, closing it first.
pub fn unregister(name: &str) -> NetResult<()> {
    let mut reg = REGISTRY.lock();
    let idx = reg.devices.iter().position(|d| d.name == name).ok_or(NetError::NoDevice)?;
    reg.devices[idx].ops.close()?;
    reg.devices.remove(idx);
    if reg.devices.is_empty() {
        reg.default = None;
    } else if let Some(def) = reg.default {
        if def >= reg.devices.len() {
            reg.default = Some(0);
        }
    }
    Ok(())
}

/// Run `f` with exclusive access to the named device.
pub fn with_device<R>(name: &str, f: impl FnOnce(&mut NetworkDevice) -> R) -> NetResult<R> {
    let mut reg = REGISTRY.lock();
    let dev = reg.devices.iter_mut().find(|d| d.name == name).ok_or(NetError::NoDevice)?;
    Ok(f(dev))
}

/// Run `f` with exclusive access to the default device (the first one
/// registered, unless a later call changes it).
pub fn with_default<R>(f: impl FnOnce(&mut NetworkDevice) -> R) -> NetResult<R> {
    let mut reg = REGISTRY.lock();
    let idx = reg.default.ok_or(NetError::NoDevice)?;
    Ok(f(&mut reg.devices[idx]))
}

/// Transmit a frame out the default device.
pub fn transmit(frame: &[u8]) -> NetResult<()> {
    with_default(|dev| dev.transmit(frame))?
}

/// Lift one frame off `name`'s RX path into the stack: allocate a netbuf
/// from the pool, account for it in the device's statistics, and hand it
/// to [`super::ethernet::handle_frame`]. If the pool is exhausted the frame
/// is dropped and counted as an RX error rather than processed.
pub fn receive(name: &str, raw: &[u8]) {
    let promisc = with_device(name, |d| d.flags.contains(DeviceFlags::PROMISC)).unwrap_or(false);

    match super::netbuf::alloc_from(raw) {
        Some(buf) => {
            let _ = with_device(name, |d| d.stats.rx_packets += 1);
            super::ethernet::handle_frame(name, promisc, buf);
        }
        None => {
            let _ = with_device(name, |d| {
                d.stats.rx_errors += 1;
                d.stats.rx_dropped += 1;
            });
            log::warn!("{}: netbuf pool exhausted, dropping {} byte frame", name, raw.len());
        }
    }
}

/// MAC address of the default device.
pub fn default_mac() -> NetResult<MacAddr> {
    with_default(|dev| dev.mac)
}

/// Names of all currently registered devices.
pub fn names() -> Vec<String> {
    REGISTRY.lock().devices.iter().map(|d| d.name.clone()).collect()
}

/// Count of currently registered devices.
pub fn count() -> usize {
    REGISTRY.lock().devices.len()
}

/// Clear the registry between tests. Exposed crate-wide (not just to this
/// module's own `tests`) so [`super::ethernet`]'s tests can start from a
/// known-empty registry too.
#[cfg(test)]
pub(crate) fn test_reset() {
    let mut reg = REGISTRY.lock();
    reg.devices.clear();
    reg.default = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use alloc::vec;

    struct LoopbackOps {
        up: bool,
        sent: Vec<alloc::vec::Vec<u8>>,
    }

    impl DeviceOps for LoopbackOps {
        fn open(&mut self) -> NetResult<()> { self.up = true; Ok(()) }
        fn close(&mut self) -> NetResult<()> { self.up = false; Ok(()) }
        fn start_xmit(&mut self, frame: &[u8]) -> NetResult<()> {
            self.sent.push(frame.to_vec());
            Ok(())
        }
        fn set_mac(&mut self, _mac: MacAddr) -> NetResult<()> { Ok(()) }
        fn ioctl(&mut self, _cmd: u32, _arg: u32) -> NetResult<u32> { Ok(0) }
        fn link_up(&self) -> bool { self.up }
    }

    fn reset_registry() {
        test_reset();
    }

    #[test]
    #[serial]
    fn register_and_transmit() {
        reset_registry();
        let mac = MacAddr([0, 1, 2, 3, 4, 5]);
        register("lo0", mac, Box::new(LoopbackOps { up: true, sent: vec![] })).unwrap();
        assert_eq!(count(), 1);
        assert_eq!(default_mac().unwrap(), mac);
        transmit(b"hello").unwrap();
        with_device("lo0", |d| {
            assert!(d.link_up());
            assert!(d.flags.contains(DeviceFlags::UP));
            assert_eq!(d.stats.tx_packets, 1);
        }).unwrap();
    }

    #[test]
    #[serial]
    fn transmit_with_no_device_fails() {
        reset_registry();
        assert_eq!(transmit(b"x"), Err(NetError::NoDevice));
    }

    #[test]
    #[serial]
    fn link_down_blocks_transmit() {
        reset_registry();
        register("eth0", MacAddr([0; 6]), Box::new(LoopbackOps { up: false, sent: vec![] })).unwrap();
        assert_eq!(transmit(b"x"), Err(NetError::LinkDown));
        with_device("eth0", |d| assert_eq!(d.stats.tx_dropped, 1)).unwrap();
    }

    #[test]
    #[serial]
    fn new_device_defaults_up_broadcast_multicast_not_promisc() {
        reset_registry();
        register("eth2", MacAddr([0; 6]), Box::new(LoopbackOps { up: true, sent: vec![] })).unwrap();
        with_device("eth2", |d| {
            assert!(d.flags.contains(DeviceFlags::UP));
            assert!(d.flags.contains(DeviceFlags::BROADCAST));
            assert!(d.flags.contains(DeviceFlags::MULTICAST));
            assert!(!d.flags.contains(DeviceFlags::PROMISC));
        }).unwrap();
    }

    #[test]
    #[serial]
    fn receive_counts_rx_packets_even_for_frames_ethernet_later_drops() {
        crate::logging::init_for_test();
        reset_registry();
        register("eth3", MacAddr([1, 2, 3, 4, 5, 6]), Box::new(LoopbackOps { up: true, sent: vec![] })).unwrap();
        receive("eth3", b"short"); // below the 60-byte Ethernet minimum
        with_device("eth3", |d| assert_eq!(d.stats.rx_packets, 1)).unwrap();
    }

    #[test]
    #[serial]
    fn receive_with_no_device_drops_silently() {
        reset_registry();
        receive("ghost", b"whatever");
    }
}
