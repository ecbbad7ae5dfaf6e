//! Fixed-capacity pool of network buffers ("netbufs").
//!
//! Every packet that passes through the stack — from the moment a frame is
//! lifted off the device RX ring to the moment its last header is stripped
//! in front of a socket's receive queue — lives in one of these buffers.
//! A netbuf has head/tail room on both ends so that encapsulation (pushing
//! a header on transmit) and decapsulation (pulling a header off receive)
//! never need to copy the payload, only move two cursors.
//!
//! The pool is a fixed-size array behind a spinlock, the same shape the
//! rest of the stack uses for its tables (see [`super::tcp::TCP_CONNECTIONS`]).
//! A [`NetbufHandle`] owns its slot exclusively and returns it to the pool
//! on drop, so a netbuf can never be aliased by two owners at once.

use core::sync::atomic::{AtomicU64, Ordering};
use crate::sync::spinlock::Spinlock;

/// Number of netbufs in the pool.
pub const POOL_CAPACITY: usize = 256;

/// Bytes of storage per netbuf: large enough for a full Ethernet frame
/// plus headroom for Ethernet+IP+TCP headers and options.
const BUF_SIZE: usize = 2048;

/// Headroom reserved at allocation time for headers a lower layer will
/// push in front of the payload (Ethernet + IPv4 + TCP/UDP worst case).
const DEFAULT_HEADROOM: usize = 14 + 60 + 60;

struct Slot {
    data: [u8; BUF_SIZE],
    head: usize,
    tail: usize,
    in_use: bool,
}

impl Slot {
    const fn empty() -> Self {
        Slot { data: [0u8; BUF_SIZE], head: 0, tail: 0, in_use: false }
    }
}

struct Pool {
    slots: [Slot; POOL_CAPACITY],
}

static POOL: Spinlock<Pool> = Spinlock::new(Pool {
    slots: [const { Slot::empty() }; POOL_CAPACITY],
});

/// Count of allocations that found the pool exhausted, across all of
/// [`alloc`], [`alloc_with_headroom`], and [`alloc_from`].
static ALLOC_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Number of free slots remaining in the pool.
pub fn available() -> usize {
    let pool = POOL.lock();
    pool.slots.iter().filter(|s| !s.in_use).count()
}

/// Number of allocations that have failed because the pool was exhausted.
pub fn alloc_failures() -> u64 {
    ALLOC_FAILURES.load(Ordering::Relaxed)
}

/// Allocate a netbuf with the default header headroom. Returns `None` if
/// the pool is exhausted.
pub fn alloc() -> Option<NetbufHandle> {
    alloc_with_headroom(DEFAULT_HEADROOM)
}

/// Allocate a netbuf reserving `headroom` bytes in front of the data
/// window, for protocols that need more (or less) than the default stack.
pub fn alloc_with_headroom(headroom: usize) -> Option<NetbufHandle> {
    let mut pool = POOL.lock();
    let idx = match pool.slots.iter().position(|s| !s.in_use) {
        Some(idx) => idx,
        None => {
            drop(pool);
            ALLOC_FAILURES.fetch_add(1, Ordering::Relaxed);
            log::debug!("netbuf: pool exhausted ({} slots in use)", POOL_CAPACITY);
            return None;
        }
    };
    let slot = &mut pool.slots[idx];
    slot.in_use = true;
    slot.head = headroom.min(BUF_SIZE);
    slot.tail = slot.head;
    Some(NetbufHandle { index: idx })
}

/// Wrap caller-supplied bytes (e.g. a frame lifted from a device RX ring)
/// into a netbuf with no headroom, ready to be parsed and pulled from.
pub fn alloc_from(bytes: &[u8]) -> Option<NetbufHandle> {
    let mut handle = alloc_with_headroom(0)?;
    handle.put(bytes.len())?.copy_from_slice(bytes);
    Some(handle)
}

/// An owned, exclusive handle to a pool-backed netbuf.
///
/// Dropping the handle returns the slot to the pool. The data window is
/// `[head, tail)` inside the slot's fixed backing array; [`push`](Self::push)
/// grows the window backward (prepend a header), [`put`](Self::put) grows it
/// forward (append payload), and [`pull`](Self::pull) shrinks it from the
/// front (strip a header already consumed by parsing).
pub struct NetbufHandle {
    index: usize,
}

impl NetbufHandle {
    /// Length of the current data window.
    pub fn len(&self) -> usize {
        let pool = POOL.lock();
        let slot = &pool.slots[self.index];
        slot.tail - slot.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of headroom still available in front of the window.
    pub fn headroom(&self) -> usize {
        let pool = POOL.lock();
        pool.slots[self.index].head
    }

    /// Bytes of tailroom still available behind the window.
    pub fn tailroom(&self) -> usize {
        let pool = POOL.lock();
        let slot = &pool.slots[self.index];
        BUF_SIZE - slot.tail
    }

    /// Copy the data window out into an owned `Vec`. Used at call sites
    /// that still need a contiguous, pool-independent buffer (e.g. handing
    /// a frame to a device driver's `transmit`).
    pub fn to_vec(&self) -> alloc::vec::Vec<u8> {
        let pool = POOL.lock();
        let slot = &pool.slots[self.index];
        slot.data[slot.head..slot.tail].to_vec()
    }

    /// Run `f` with a read-only view of the data window.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let pool = POOL.lock();
        let slot = &pool.slots[self.index];
        f(&slot.data[slot.head..slot.tail])
    }

    /// Grow the window forward by `n` bytes and return the newly exposed
    /// slice for the caller to fill in. Returns `None` if there isn't
    /// enough tailroom.
    pub fn put(&mut self, n: usize) -> Option<PutGuard<'_>> {
        let mut pool = POOL.lock();
        let start;
        let end;
        {
            let slot = &mut pool.slots[self.index];
            if slot.tail + n > BUF_SIZE {
                return None;
            }
            start = slot.tail;
            slot.tail += n;
            end = slot.tail;
        }
        Some(PutGuard { pool, index: self.index, start, end })
    }

    /// Remove `n` bytes from the front of the window (a header this layer
    /// has already parsed) and return them. Returns `None` if the window
    /// is shorter than `n`.
    pub fn pull(&mut self, n: usize) -> Option<alloc::vec::Vec<u8>> {
        let mut pool = POOL.lock();
        let slot = &mut pool.slots[self.index];
        if slot.tail - slot.head < n {
            return None;
        }
        let taken = slot.data[slot.head..slot.head + n].to_vec();
        slot.head += n;
        Some(taken)
    }

    /// Grow the window backward by `n` bytes (reserving space for a header
    /// a lower layer is about to prepend) and return the newly exposed
    /// slice. Returns `None` if there isn't enough headroom.
    pub fn push(&mut self, n: usize) -> Option<PushGuard<'_>> {
        let mut pool = POOL.lock();
        let start;
        let end;
        {
            let slot = &mut pool.slots[self.index];
            if n > slot.head {
                return None;
            }
            slot.head -= n;
            start = slot.head;
            end = start + n;
        }
        Some(PushGuard { pool, index: self.index, start, end })
    }
}

impl Drop for NetbufHandle {
    fn drop(&mut self) {
        let mut pool = POOL.lock();
        pool.slots[self.index].in_use = false;
    }
}

/// Write-through guard into the bytes just exposed by [`NetbufHandle::put`].
pub struct PutGuard<'a> {
    pool: crate::sync::spinlock::SpinlockGuard<'a, Pool>,
    index: usize,
    start: usize,
    end: usize,
}

impl<'a> core::ops::Deref for PutGuard<'a> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.pool.slots[self.index].data[self.start..self.end]
    }
}

impl<'a> core::ops::DerefMut for PutGuard<'a> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.pool.slots[self.index].data[self.start..self.end]
    }
}

/// Write-through guard into the bytes just exposed by [`NetbufHandle::push`].
pub struct PushGuard<'a> {
    pool: crate::sync::spinlock::SpinlockGuard<'a, Pool>,
    index: usize,
    start: usize,
    end: usize,
}

impl<'a> core::ops::Deref for PushGuard<'a> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.pool.slots[self.index].data[self.start..self.end]
    }
}

impl<'a> core::ops::DerefMut for PushGuard<'a> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.pool.slots[self.index].data[self.start..self.end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // The pool is process-global, so these tests run serially to avoid
    // interference from concurrently-run tests elsewhere that also allocate.
    #[test]
    #[serial]
    fn alloc_and_drop_returns_slot() {
        let before = available();
        {
            let _h = alloc().unwrap();
            assert_eq!(available(), before - 1);
        }
        assert_eq!(available(), before);
    }

    #[test]
    #[serial]
    fn pool_exhaustion_returns_none() {
        crate::logging::init_for_test();
        let before = alloc_failures();
        let mut handles = alloc::vec::Vec::new();
        while let Some(h) = alloc() {
            handles.push(h);
        }
        assert_eq!(handles.len(), POOL_CAPACITY);
        assert!(alloc().is_none());
        assert_eq!(alloc_failures(), before + 1);
    }

    #[test]
    #[serial]
    fn put_pull_push_roundtrip() {
        let mut h = alloc().unwrap();
        {
            let mut s = h.put(4).unwrap();
            s.copy_from_slice(b"data");
        }
        assert_eq!(h.len(), 4);
        {
            let mut hdr = h.push(2).unwrap();
            hdr.copy_from_slice(b"HD");
        }
        assert_eq!(h.len(), 6);
        let pulled = h.pull(2).unwrap();
        assert_eq!(&pulled, b"HD");
        assert_eq!(h.len(), 4);
        h.with_bytes(|b| assert_eq!(b, b"data"));
    }
}
