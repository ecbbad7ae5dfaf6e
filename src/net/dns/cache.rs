//! DNS resolution cache: bounded, TTL-evicted, keyed by (name, type, class).

use alloc::string::String;
use alloc::vec::Vec;
use crate::net::types::Ipv4Addr;
use crate::sync::spinlock::Spinlock;

const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;
const MAX_ENTRIES: usize = 128;

struct Entry {
    name: String,
    qtype: u16,
    qclass: u16,
    ttl_ticks: u32,
    inserted_tick: u32,
    addr: Ipv4Addr,
}

impl Entry {
    fn expired(&self, now: u32) -> bool {
        now.wrapping_sub(self.inserted_tick) > self.ttl_ticks
    }
}

static CACHE: Spinlock<Vec<Entry>> = Spinlock::new(Vec::new());

/// Ticks-per-second used to convert a DNS TTL (seconds) to tick units. The
/// stack runs a 100 Hz tick clock elsewhere (see [`crate::arch::hal`]).
const TICKS_PER_SECOND: u32 = 100;

/// Look up a cached A record, evicting it first if expired.
pub fn lookup(name: &str, now: u32) -> Option<Ipv4Addr> {
    let mut cache = CACHE.lock();
    let needle = name.to_ascii_lowercase();
    if let Some(idx) = cache.iter().position(|e| e.name == needle && e.qtype == QTYPE_A && e.qclass == QCLASS_IN) {
        if cache[idx].expired(now) {
            cache.remove(idx);
            return None;
        }
        return Some(cache[idx].addr);
    }
    None
}

/// Insert (or refresh) an A record. TTL is in seconds, per the wire format.
/// Evicts the oldest entry by insertion time when the cache is full.
pub fn insert(name: &str, ttl_secs: u32, addr: Ipv4Addr, now: u32) {
    let mut cache = CACHE.lock();
    let needle = name.to_ascii_lowercase();
    let ttl_ticks = ttl_secs.saturating_mul(TICKS_PER_SECOND);

    if let Some(idx) = cache.iter().position(|e| e.name == needle && e.qtype == QTYPE_A && e.qclass == QCLASS_IN) {
        cache[idx].ttl_ticks = ttl_ticks;
        cache[idx].inserted_tick = now;
        cache[idx].addr = addr;
        return;
    }

    if cache.len() >= MAX_ENTRIES {
        if let Some((oldest, _)) = cache.iter().enumerate()
            .min_by_key(|(_, e)| e.inserted_tick)
        {
            cache.remove(oldest);
        }
    }

    cache.push(Entry { name: needle, qtype: QTYPE_A, qclass: QCLASS_IN, ttl_ticks, inserted_tick: now, addr });
}

pub fn len() -> usize {
    CACHE.lock().len()
}

pub fn clear() {
    CACHE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn insert_then_lookup_is_case_insensitive() {
        clear();
        insert("Example.com", 60, Ipv4Addr::new(1, 2, 3, 4), 0);
        assert_eq!(lookup("example.COM", 0), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    #[serial]
    fn expired_entry_is_evicted_on_lookup() {
        clear();
        insert("stale.test", 1, Ipv4Addr::new(9, 9, 9, 9), 0);
        assert!(lookup("stale.test", 1 * TICKS_PER_SECOND + 1).is_none());
        assert_eq!(len(), 0);
    }

    #[test]
    #[serial]
    fn overflow_evicts_oldest_insertion() {
        clear();
        for i in 0..MAX_ENTRIES {
            insert(&alloc::format!("host{}.test", i), 3600, Ipv4Addr::new(10, 0, 0, i as u8), i as u32);
        }
        assert_eq!(len(), MAX_ENTRIES);
        insert("newest.test", 3600, Ipv4Addr::new(10, 1, 1, 1), MAX_ENTRIES as u32);
        assert_eq!(len(), MAX_ENTRIES);
        assert!(lookup("host0.test", MAX_ENTRIES as u32).is_none());
        assert!(lookup("newest.test", MAX_ENTRIES as u32).is_some());
    }
}
