//! Unified error taxonomy for the networking stack.
//!
//! Every fallible operation in `net::` returns `Result<_, NetError>` rather
//! than a raw `bool`/sentinel as the original per-module code did. Socket
//! syscalls map these down to BSD-style errno values at the boundary in
//! [`super::socket`].

use strum::FromRepr;

/// Error codes returned by networking operations.
#[derive(FromRepr, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum NetError {
    /// No network device registered, or the named device does not exist.
    NoDevice = 1,
    /// Device exists but its link is down.
    LinkDown = 2,
    /// Netbuf pool exhausted.
    OutOfBuffers = 3,
    /// A packet failed structural validation (short, bad checksum, bad length field).
    Malformed = 4,
    /// No route to the destination address.
    NoRoute = 5,
    /// ARP resolution for the next hop did not complete in time.
    AddressUnresolved = 6,
    /// Requested port is already bound.
    AddressInUse = 7,
    /// No ephemeral port available.
    PortsExhausted = 8,
    /// Operation attempted on a socket in the wrong state (e.g. `send` before `connect`).
    NotConnected = 9,
    /// Peer reset the connection.
    ConnectionReset = 10,
    /// Peer or local side closed the connection.
    ConnectionClosed = 11,
    /// Connection attempt timed out.
    TimedOut = 12,
    /// Would block and the socket is in non-blocking mode.
    WouldBlock = 13,
    /// Listen backlog is full.
    BacklogFull = 14,
    /// Invalid argument (zero-length buffer, bad address family, etc).
    InvalidArgument = 15,
    /// File-descriptor table exhausted or fd out of range.
    TooManyOpenSockets = 16,
    /// DNS query was refused, timed out, or no server answered.
    NameResolutionFailed = 17,
    /// Fragment reassembly buffer is full or the datagram never completed within its timeout.
    ReassemblyFailed = 18,
}

pub type NetResult<T> = Result<T, NetError>;
