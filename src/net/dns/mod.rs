//! Recursive DNS resolution: cache-first lookup, query encode/decode, and
//! retry across a configured list of servers.
//!
//! This resolver is synchronous — `resolve()` blocks the calling thread
//! (same suspension model as the rest of socket I/O; see
//! [`crate::net::udp::recv_timeout`]) rather than driving a callback-based
//! pending-query table. A single in-flight query is sufficient for this
//! stack's single-resolver-thread use.

pub mod wire;
pub mod cache;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use super::types::Ipv4Addr;
use crate::sync::spinlock::Spinlock;
use wire::{build_query, parse_response, first_a_record, DNS_PORT};

/// Per-query timeout (RFC default is server-dependent; 5s is the common
/// stub-resolver default).
const QUERY_TIMEOUT_TICKS: u32 = 500;
/// Retries per server before giving up on it.
const RETRIES_PER_SERVER: u32 = 3;
/// Source port used for outgoing queries. Fixed rather than drawn from the
/// ephemeral pool since only one resolver query is ever in flight.
const RESOLVER_SRC_PORT: u16 = 53000;

static SERVERS: Spinlock<Vec<Ipv4Addr>> = Spinlock::new(Vec::new());
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Count of [`resolve`] calls answered from [`cache`] without a query.
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
/// Count of queries actually sent on the wire (one per send, including retries).
static QUERIES_SENT: AtomicU64 = AtomicU64::new(0);

pub fn cache_hits() -> u64 {
    CACHE_HITS.load(Ordering::Relaxed)
}

pub fn queries_sent() -> u64 {
    QUERIES_SENT.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    NoServerConfigured,
    Timeout,
    Refused,
    Malformed,
}

/// Replace the configured resolver list (e.g. from DHCP option 6, or a
/// static interface config). The first server is tried first on each query.
pub fn configure_servers(servers: &[Ipv4Addr]) {
    let mut list = SERVERS.lock();
    list.clear();
    list.extend_from_slice(servers);
}

fn server_list() -> Vec<Ipv4Addr> {
    let configured = SERVERS.lock();
    if !configured.is_empty() {
        return configured.clone();
    }
    let cfg = super::config();
    if cfg.dns != Ipv4Addr::ZERO {
        alloc::vec![cfg.dns]
    } else {
        Vec::new()
    }
}

/// A transaction ID that varies call-to-call without requiring an RNG:
/// ticks (never monotonic between repeated resolves in practice) folded
/// with a wrapping counter.
fn next_transaction_id() -> u16 {
    let ticks = crate::arch::hal::timer_current_ticks();
    let counter = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    (ticks.wrapping_mul(2654435761).wrapping_add(counter) & 0xFFFF) as u16
}

/// Resolve a hostname to an IPv4 address, checking the cache first and
/// falling back to a recursive query against the configured server list,
/// retrying [`RETRIES_PER_SERVER`] times per server before moving to the
/// next one.
pub fn resolve(hostname: &str) -> Result<Ipv4Addr, DnsError> {
    let now = crate::arch::hal::timer_current_ticks();
    if let Some(addr) = cache::lookup(hostname, now) {
        CACHE_HITS.fetch_add(1, Ordering::Relaxed);
        return Ok(addr);
    }

    let servers = server_list();
    if servers.is_empty() {
        return Err(DnsError::NoServerConfigured);
    }

    super::udp::bind(RESOLVER_SRC_PORT);
    let result = query_servers(hostname, &servers);
    super::udp::unbind(RESOLVER_SRC_PORT);
    result
}

fn query_servers(hostname: &str, servers: &[Ipv4Addr]) -> Result<Ipv4Addr, DnsError> {
    for &server in servers {
        for _ in 0..RETRIES_PER_SERVER {
            let id = next_transaction_id();
            let query = build_query(id, hostname);
            super::udp::send(server, RESOLVER_SRC_PORT, DNS_PORT, &query);
            QUERIES_SENT.fetch_add(1, Ordering::Relaxed);

            match super::udp::recv_timeout(RESOLVER_SRC_PORT, QUERY_TIMEOUT_TICKS) {
                Some(dgram) => match parse_response(&dgram.data, id, hostname) {
                    Ok(resp) => {
                        if let Some(addr) = first_a_record(&resp) {
                            if let Some(answer) = resp.answers.iter().find(|a| a.rtype == 1) {
                                let now = crate::arch::hal::timer_current_ticks();
                                cache::insert(hostname, answer.ttl, addr, now);
                            }
                            return Ok(addr);
                        }
                        return Err(DnsError::Malformed);
                    }
                    Err(wire::DnsWireError::ServerFailure(_)) => return Err(DnsError::Refused),
                    Err(_) => continue, // malformed/mismatched reply, retry
                },
                None => continue, // timed out, retry
            }
        }
    }
    Err(DnsError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset() {
        cache::clear();
        SERVERS.lock().clear();
        CACHE_HITS.store(0, Ordering::Relaxed);
        QUERIES_SENT.store(0, Ordering::Relaxed);
    }

    #[test]
    #[serial]
    fn cache_hit_resolves_without_sending_a_query() {
        reset();
        cache::insert("cached.test", 3600, Ipv4Addr::new(10, 0, 0, 5), 0);

        let result = resolve("cached.test");
        assert_eq!(result, Ok(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(cache_hits(), 1);
        assert_eq!(queries_sent(), 0);
    }

    #[test]
    #[serial]
    fn miss_with_no_server_configured_fails_without_sending() {
        reset();
        let result = resolve("uncached.test");
        assert_eq!(result, Err(DnsError::NoServerConfigured));
        assert_eq!(cache_hits(), 0);
        assert_eq!(queries_sent(), 0);
    }

    #[test]
    #[serial]
    fn second_lookup_of_a_freshly_cached_name_is_a_pure_cache_hit() {
        reset();
        let now = 0;
        cache::insert("example.test", 60, Ipv4Addr::new(93, 184, 216, 34), now);

        assert_eq!(resolve("example.test"), Ok(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(resolve("example.test"), Ok(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(cache_hits(), 2);
        assert_eq!(queries_sent(), 0);
    }
}
