//! IPv4 routing table with longest-prefix-match lookup.
//!
//! The original stack only ever knew about one interface and one gateway
//! (see [`super::types::NetConfig`]); [`RoutingTable`] replaces that with a
//! proper table so [`super::ipv4::send_ipv4`] can pick a next hop and
//! egress device for an arbitrary destination, falling back to the
//! default route when nothing more specific matches.

use alloc::string::String;
use alloc::vec::Vec;
use super::types::Ipv4Addr;
use crate::sync::spinlock::Spinlock;

/// A single routing table entry.
#[derive(Clone, Debug)]
pub struct Route {
    pub network: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// `None` for an on-link route (destination directly reachable on `device`).
    pub gateway: Option<Ipv4Addr>,
    pub device: String,
    /// Lower metric wins when two routes match with the same prefix length.
    pub metric: u32,
}

impl Route {
    pub fn prefix_len(&self) -> u32 {
        Ipv4Addr::prefix_len(self.mask)
    }

    fn matches(&self, dst: Ipv4Addr) -> bool {
        dst.in_subnet(self.network, self.mask)
    }

    /// A default route (0.0.0.0/0) via `gateway` on `device`.
    pub fn default(gateway: Ipv4Addr, device: impl Into<String>, metric: u32) -> Self {
        Route {
            network: Ipv4Addr::ZERO,
            mask: Ipv4Addr::ZERO,
            gateway: Some(gateway),
            device: device.into(),
            metric,
        }
    }
}

/// Outcome of a successful route lookup: the next hop to ARP-resolve (or
/// the destination itself, for on-link routes) and the device to send on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub next_hop: Ipv4Addr,
    pub device: String,
}

static TABLE: Spinlock<Vec<Route>> = Spinlock::new(Vec::new());

/// Replace a route to the same network/mask/device if one exists, else add it.
pub fn add(route: Route) {
    let mut table = TABLE.lock();
    if let Some(existing) = table
        .iter_mut()
        .find(|r| r.network == route.network && r.mask == route.mask && r.device == route.device)
    {
        *existing = route;
    } else {
        table.push(route);
    }
}

/// Remove all routes through `device`. Used when an interface goes down.
pub fn remove_device_routes(device: &str) {
    TABLE.lock().retain(|r| r.device != device);
}

pub fn clear() {
    TABLE.lock().clear();
}

pub fn len() -> usize {
    TABLE.lock().len()
}

/// Find the best route to `dst`: the longest matching prefix, and among
/// ties, the lowest metric. Returns the resolved next hop and egress
/// device, or `None` if no route (including no default route) matches.
pub fn lookup(dst: Ipv4Addr) -> Option<Resolved> {
    let table = TABLE.lock();
    let best = table
        .iter()
        .filter(|r| r.matches(dst))
        .max_by_key(|r| (r.prefix_len(), core::cmp::Reverse(r.metric)))?;

    let next_hop = best.gateway.unwrap_or(dst);
    Some(Resolved { next_hop, device: best.device.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset() {
        clear();
    }

    #[test]
    #[serial]
    fn longest_prefix_wins_over_default() {
        reset();
        add(Route::default(Ipv4Addr::new(10, 0, 0, 1), "eth0", 0));
        add(Route {
            network: Ipv4Addr::new(10, 0, 0, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            device: "eth0".into(),
            metric: 0,
        });

        let r = lookup(Ipv4Addr::new(10, 0, 0, 42)).unwrap();
        assert_eq!(r.next_hop, Ipv4Addr::new(10, 0, 0, 42));

        let r = lookup(Ipv4Addr::new(8, 8, 8, 8)).unwrap();
        assert_eq!(r.next_hop, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    #[serial]
    fn lower_metric_wins_on_tie() {
        reset();
        add(Route {
            network: Ipv4Addr::new(192, 168, 1, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            device: "eth0".into(),
            metric: 10,
        });
        add(Route {
            network: Ipv4Addr::new(192, 168, 1, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 254)),
            device: "eth1".into(),
            metric: 1,
        });

        let r = lookup(Ipv4Addr::new(192, 168, 1, 5)).unwrap();
        assert_eq!(r.device, "eth1");
    }

    #[test]
    #[serial]
    fn no_route_returns_none() {
        reset();
        assert!(lookup(Ipv4Addr::new(1, 1, 1, 1)).is_none());
    }
}
