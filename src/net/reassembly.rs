//! IPv4 fragment reassembly.
//!
//! Incoming fragments are keyed by (src, dst, protocol, identification) and
//! buffered until every gap is filled or [`FRAGMENT_TIMEOUT_TICKS`] elapses,
//! at which point the partial datagram is discarded — mirroring how the
//! transport layer above already discards half-finished state on timeout
//! (see [`super::tcp::timer`]).

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use super::types::Ipv4Addr;
use crate::sync::spinlock::Spinlock;

/// 30 seconds at the stack's 100Hz tick rate (RFC 791 suggests 15s-2min; the
/// low end of that range bounds memory held by a dead reassembly attempt).
pub const FRAGMENT_TIMEOUT_TICKS: u32 = 3000;

const MAX_REASSEMBLIES: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct FragKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
}

struct HoleFreeRange {
    offset: u16,
    len: u16,
}

struct Reassembly {
    key: FragKey,
    /// Bytes received so far, sparse: only [`ranges`] are actually filled.
    data: Vec<u8>,
    ranges: Vec<HoleFreeRange>,
    total_len: Option<u16>,
    created_tick: u32,
    ttl: u8,
}

impl Reassembly {
    fn new(key: FragKey, tick: u32, ttl: u8) -> Self {
        Reassembly { key, data: Vec::new(), ranges: Vec::new(), total_len: None, created_tick: tick, ttl }
    }

    /// Insert one fragment's bytes at `offset`. Returns `false` without
    /// modifying any state if the fragment overlaps bytes already held —
    /// the caller is expected to discard the whole reassembly rather than
    /// accept a fragment that contradicts data already received.
    fn insert(&mut self, offset: u16, fragment: &[u8], more_fragments: bool) -> bool {
        let new_range = HoleFreeRange { offset, len: fragment.len() as u16 };
        let new_end = new_range.offset as u32 + new_range.len as u32;

        for r in &self.ranges {
            let r_end = r.offset as u32 + r.len as u32;
            if (new_range.offset as u32) < r_end && (r.offset as u32) < new_end {
                return false;
            }
        }

        let end = offset as usize + fragment.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(fragment);

        if !more_fragments {
            self.total_len = Some(end as u16);
        }

        // Merge the new range into the sorted, non-overlapping range list.
        // Ranges that only touch (no gap, no overlap) are coalesced; actual
        // overlap was already rejected above.
        let mut new_range = new_range;
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;
        for r in self.ranges.drain(..) {
            if inserted {
                merged.push(r);
                continue;
            }
            let new_end = new_range.offset as u32 + new_range.len as u32;
            let r_end = r.offset as u32 + r.len as u32;
            if new_end < r.offset as u32 {
                merged.push(HoleFreeRange { offset: new_range.offset, len: new_range.len });
                merged.push(r);
                inserted = true;
            } else if r_end < new_range.offset as u32 {
                merged.push(r);
            } else {
                // touching exactly, no shared bytes: merge the two ranges
                let start = new_range.offset.min(r.offset);
                let end = new_end.max(r_end as u32) as u16;
                new_range = HoleFreeRange { offset: start, len: end - start };
            }
        }
        if !inserted {
            merged.push(new_range);
        }
        self.ranges = merged;
        true
    }

    fn is_complete(&self) -> bool {
        match self.total_len {
            None => false,
            Some(total) => {
                self.ranges.len() == 1 && self.ranges[0].offset == 0 && self.ranges[0].len == total
            }
        }
    }
}

static TABLE: Spinlock<Vec<Reassembly>> = Spinlock::new(Vec::new());

/// Count of reassemblies abandoned: overlapping fragments rejected, or the
/// datagram never completed before [`FRAGMENT_TIMEOUT_TICKS`] elapsed.
static FRAGMENTS_FAILED: AtomicU64 = AtomicU64::new(0);

pub fn fragments_failed() -> u64 {
    FRAGMENTS_FAILED.load(Ordering::Relaxed)
}

/// Outcome of feeding one fragment into the reassembler.
pub enum FragmentResult {
    /// More fragments still needed.
    Pending,
    /// The datagram is complete; here is the full reassembled payload and the TTL to report.
    Complete(Vec<u8>, u8),
    /// Reassembly table is full and this fragment's datagram isn't already tracked.
    TableFull,
    /// The fragment overlapped bytes already held for this datagram; the
    /// whole reassembly was discarded (classic overlapping-fragment attack).
    Overlap,
}

/// Feed one fragment (as decoded from the IPv4 header: byte offset already
/// multiplied out from the 8-byte fragment-offset field) into the
/// reassembler.
pub fn insert_fragment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
    ttl: u8,
    offset: u16,
    more_fragments: bool,
    fragment: &[u8],
    now_tick: u32,
) -> FragmentResult {
    let key = FragKey { src, dst, protocol, id };
    let mut table = TABLE.lock();

    expire_old(&mut table, now_tick);

    let idx = match table.iter().position(|r| r.key == key) {
        Some(i) => i,
        None => {
            if table.len() >= MAX_REASSEMBLIES {
                return FragmentResult::TableFull;
            }
            table.push(Reassembly::new(key, now_tick, ttl));
            table.len() - 1
        }
    };

    if !table[idx].insert(offset, fragment, more_fragments) {
        log::debug!("reassembly: overlapping fragment for id={}, discarding datagram", id);
        table.remove(idx);
        FRAGMENTS_FAILED.fetch_add(1, Ordering::Relaxed);
        return FragmentResult::Overlap;
    }

    if table[idx].is_complete() {
        let done = table.remove(idx);
        FragmentResult::Complete(done.data, done.ttl)
    } else {
        FragmentResult::Pending
    }
}

fn expire_old(table: &mut Vec<Reassembly>, now_tick: u32) {
    let before = table.len();
    table.retain(|r| now_tick.wrapping_sub(r.created_tick) < FRAGMENT_TIMEOUT_TICKS);
    let expired = before - table.len();
    if expired > 0 {
        FRAGMENTS_FAILED.fetch_add(expired as u64, Ordering::Relaxed);
    }
}

/// Periodic sweep to drop reassemblies that timed out even without new
/// fragments arriving to trigger the check inline.
pub fn check_timeouts(now_tick: u32) {
    let mut table = TABLE.lock();
    expire_old(&mut table, now_tick);
}

pub fn pending_count() -> usize {
    TABLE.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset() {
        TABLE.lock().clear();
    }

    #[test]
    #[serial]
    fn two_fragments_reassemble_in_order() {
        reset();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let first = insert_fragment(src, dst, 17, 42, 64, 0, true, b"hello, ", 0);
        assert!(matches!(first, FragmentResult::Pending));
        let second = insert_fragment(src, dst, 17, 42, 64, 7, false, b"world!", 0);
        match second {
            FragmentResult::Complete(data, ttl) => {
                assert_eq!(data, b"hello, world!");
                assert_eq!(ttl, 64);
            }
            _ => panic!("expected complete reassembly"),
        }
    }

    #[test]
    #[serial]
    fn out_of_order_fragments_reassemble() {
        reset();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let first = insert_fragment(src, dst, 17, 7, 64, 4, false, b"WXYZ", 0);
        assert!(matches!(first, FragmentResult::Pending));
        let second = insert_fragment(src, dst, 17, 7, 64, 0, true, b"ABCD", 0);
        match second {
            FragmentResult::Complete(data, _) => assert_eq!(data, b"ABCDWXYZ"),
            _ => panic!("expected complete reassembly"),
        }
    }

    #[test]
    #[serial]
    fn stale_reassembly_expires() {
        reset();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        insert_fragment(src, dst, 17, 9, 64, 0, true, b"part", 0);
        assert_eq!(pending_count(), 1);
        let before = fragments_failed();
        check_timeouts(FRAGMENT_TIMEOUT_TICKS + 1);
        assert_eq!(pending_count(), 0);
        assert_eq!(fragments_failed(), before + 1);
    }

    #[test]
    #[serial]
    fn overlapping_fragment_is_rejected_and_datagram_discarded() {
        crate::logging::init_for_test();
        reset();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let before = fragments_failed();

        let first = insert_fragment(src, dst, 17, 99, 64, 0, true, b"AAAA", 0);
        assert!(matches!(first, FragmentResult::Pending));
        assert_eq!(pending_count(), 1);

        // Overlaps bytes [2, 6) against the already-held [0, 4).
        let second = insert_fragment(src, dst, 17, 99, 64, 2, false, b"BBBB", 0);
        assert!(matches!(second, FragmentResult::Overlap));
        assert_eq!(pending_count(), 0, "the whole datagram should be discarded on overlap");
        assert_eq!(fragments_failed(), before + 1);
    }

    #[test]
    #[serial]
    fn touching_fragments_are_not_treated_as_overlap() {
        reset();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let first = insert_fragment(src, dst, 17, 100, 64, 0, true, b"AAAA", 0);
        assert!(matches!(first, FragmentResult::Pending));
        let second = insert_fragment(src, dst, 17, 100, 64, 4, false, b"BBBB", 0);
        assert!(matches!(second, FragmentResult::Complete(_, _)));
    }
}
