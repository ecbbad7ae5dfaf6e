//! BSD-style socket layer: a process-wide file descriptor table mapping
//! small integers to socket control blocks, dispatching each operation to
//! the TCP or UDP module underneath.
//!
//! Blocking semantics follow the wrapped protocol: `recv` on an empty
//! queue blocks until data arrives or the per-socket receive timeout
//! (`SO_RCVTIMEO`) expires; `accept` blocks until a connection is
//! pending. Non-blocking mode, set via `setsockopt(fd, SO_NONBLOCK, 1)`,
//! returns [`NetError::WouldBlock`] immediately instead of waiting.

use alloc::vec::Vec;
use core::fmt;
use super::error::{NetError, NetResult};
use super::types::Ipv4Addr;
use crate::sync::spinlock::Spinlock;

/// Upper bound on live sockets. Generous relative to [`super::tcp::tcb`]'s
/// connection table since one UDP port binding is far cheaper than a TCB.
const MAX_SOCKETS: usize = 128;

// ── Address family / socket type constants (match the BSD values) ───

pub const AF_INET: u32 = 2;
pub const SOCK_STREAM: u32 = 1;
pub const SOCK_DGRAM: u32 = 2;

// ── shutdown() `how` values ──────────────────────────────────────────

pub const SHUT_RD: u32 = 0;
pub const SHUT_WR: u32 = 1;
pub const SHUT_RDWR: u32 = 2;

// ── Socket option constants ───────────────────────────────────────────

pub const SO_BROADCAST: u32 = super::udp::SO_BROADCAST;
pub const SO_RCVTIMEO: u32 = super::udp::SO_RCVTIMEO;
/// Non-blocking mode. Not a real `setsockopt` level option on BSD (that's
/// `fcntl(O_NONBLOCK)`), but folded in here since this stack has no `fcntl`.
pub const SO_NONBLOCK: u32 = 3;
/// Pending asynchronous error, cleared on read (`getsockopt` only).
pub const SO_ERROR: u32 = 4;

/// A `(ip, port)` pair in `ip:port` text form.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SockAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl SockAddr {
    pub const UNSPECIFIED: SockAddr = SockAddr { ip: Ipv4Addr::ZERO, port: 0 };

    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        SockAddr { ip, port }
    }

    /// Parse "a.b.c.d:port". Returns `None` on any malformed input.
    pub fn parse(s: &str) -> Option<SockAddr> {
        let (ip_part, port_part) = s.rsplit_once(':')?;
        let ip = Ipv4Addr::parse(ip_part)?;
        let port: u16 = port_part.parse().ok()?;
        Some(SockAddr { ip, port })
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Which protocol a socket is bound to and its current connection state.
/// TCP sockets created by `socket()` start `Unbound`; the underlying TCB
/// only comes into existence once `listen()` or `connect()` runs, so this
/// enum tracks the pre-TCB state the wrapped `tcp` module has no slot for.
enum Kind {
    Tcp(TcpKind),
    Udp(UdpKind),
}

enum TcpKind {
    /// `socket()` called, neither `bind()`, `connect()`, nor `listen()` yet.
    /// `pending_port` holds a port requested via `bind()`, used by a later
    /// `listen()` (the wrapped TCP module has no separate bind step).
    Unbound { pending_port: Option<u16> },
    Connected { conn_id: u32 },
    Listening { conn_id: u32 },
}

struct UdpKind {
    port: Option<u16>,
    /// Destination recorded by `connect()`; used by `send()`/`recv()` so
    /// they don't need an address argument.
    peer: Option<SockAddr>,
}

struct Socket {
    kind: Kind,
    nonblocking: bool,
    recv_timeout_ticks: u32,
    /// Sticky error surfaced once via `getsockopt(SO_ERROR)` (e.g. an RST
    /// seen while nobody was blocked in `recv`).
    so_error: Option<NetError>,
}

impl Socket {
    fn new_tcp() -> Self {
        Socket {
            kind: Kind::Tcp(TcpKind::Unbound { pending_port: None }),
            nonblocking: false,
            recv_timeout_ticks: u32::MAX,
            so_error: None,
        }
    }

    fn new_udp() -> Self {
        Socket {
            kind: Kind::Udp(UdpKind { port: None, peer: None }),
            nonblocking: false,
            recv_timeout_ticks: u32::MAX,
            so_error: None,
        }
    }
}

static SOCKETS: Spinlock<Option<Vec<Option<Socket>>>> = Spinlock::new(None);

/// Initialize the socket descriptor table. Must run before any other call
/// in this module; `net::init()` is the right place.
pub fn init() {
    let mut table = SOCKETS.lock();
    let mut slots = Vec::with_capacity(MAX_SOCKETS);
    for _ in 0..MAX_SOCKETS {
        slots.push(None);
    }
    *table = Some(slots);
}

fn alloc_fd(sock: Socket) -> NetResult<u32> {
    let mut table = SOCKETS.lock();
    let slots = table.as_mut().ok_or(NetError::NoDevice)?;
    for (i, slot) in slots.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(sock);
            return Ok(i as u32);
        }
    }
    Err(NetError::TooManyOpenSockets)
}

fn with_socket<R>(fd: u32, f: impl FnOnce(&mut Socket) -> NetResult<R>) -> NetResult<R> {
    let id = fd as usize;
    let mut table = SOCKETS.lock();
    let slots = table.as_mut().ok_or(NetError::NoDevice)?;
    let sock = slots.get_mut(id).and_then(|s| s.as_mut()).ok_or(NetError::InvalidArgument)?;
    f(sock)
}

/// Create a new socket. `domain` must be `AF_INET`; `ty` one of
/// `SOCK_STREAM`/`SOCK_DGRAM`.
pub fn socket(domain: u32, ty: u32) -> NetResult<u32> {
    if domain != AF_INET {
        return Err(NetError::InvalidArgument);
    }
    match ty {
        SOCK_STREAM => alloc_fd(Socket::new_tcp()),
        SOCK_DGRAM => alloc_fd(Socket::new_udp()),
        _ => Err(NetError::InvalidArgument),
    }
}

/// Bind a socket to a local address. For UDP this opens the receive queue
/// immediately (port 0 draws an ephemeral port); for TCP the port is only
/// recorded, to be claimed by a subsequent `listen()`.
pub fn bind(fd: u32, addr: SockAddr) -> NetResult<()> {
    with_socket(fd, |sock| match &mut sock.kind {
        Kind::Tcp(TcpKind::Unbound { pending_port }) => {
            *pending_port = Some(addr.port);
            Ok(())
        }
        Kind::Tcp(_) => Err(NetError::InvalidArgument),
        Kind::Udp(udp) => {
            if udp.port.is_some() {
                return Err(NetError::InvalidArgument);
            }
            let port = if addr.port == 0 { alloc_udp_ephemeral_port() } else { addr.port };
            if !super::udp::bind(port) {
                return Err(NetError::AddressInUse);
            }
            udp.port = Some(port);
            Ok(())
        }
    })
}

/// Passive open: mark a TCP socket as a listener on its bound (or given)
/// port, or begin accepting on a UDP socket — UDP has no listen concept,
/// so this always fails for `SOCK_DGRAM`.
pub fn listen(fd: u32, backlog: u16) -> NetResult<()> {
    with_socket(fd, |sock| match &mut sock.kind {
        Kind::Tcp(TcpKind::Unbound { pending_port }) => {
            let port = pending_port.ok_or(NetError::InvalidArgument)?;
            let conn_id = super::tcp::listen(port, backlog);
            if conn_id == u32::MAX {
                return Err(NetError::AddressInUse);
            }
            sock.kind = Kind::Tcp(TcpKind::Listening { conn_id });
            Ok(())
        }
        Kind::Tcp(_) => Err(NetError::InvalidArgument),
        Kind::Udp(_) => Err(NetError::InvalidArgument),
    })
}

/// Accept a pending connection on a listening TCP socket, returning a new
/// fd for it and the peer's address.
pub fn accept(fd: u32) -> NetResult<(u32, SockAddr)> {
    let (listener_conn_id, timeout, nonblocking) = with_socket(fd, |sock| match &sock.kind {
        Kind::Tcp(TcpKind::Listening { conn_id }) => Ok((*conn_id, sock.recv_timeout_ticks, sock.nonblocking)),
        _ => Err(NetError::InvalidArgument),
    })?;

    let wait_ticks = if nonblocking { 0 } else { timeout };
    let (conn_id, peer_ip, peer_port) = super::tcp::accept(listener_conn_id, wait_ticks);
    if conn_id == u32::MAX {
        return Err(if nonblocking { NetError::WouldBlock } else { NetError::TimedOut });
    }

    let new_fd = alloc_fd(Socket {
        kind: Kind::Tcp(TcpKind::Connected { conn_id }),
        nonblocking: false,
        recv_timeout_ticks: u32::MAX,
        so_error: None,
    })?;
    Ok((new_fd, SockAddr::new(peer_ip, peer_port)))
}

/// Active open (TCP) or set the default destination (UDP).
///
/// For TCP this calls the blocking `tcp::connect`, which sleeps the
/// calling thread until the handshake completes or times out — done
/// outside the fd-table lock so other sockets stay usable meanwhile.
pub fn connect(fd: u32, addr: SockAddr) -> NetResult<()> {
    enum Plan {
        TcpConnect(u32),
        UdpConnect { needs_bind: bool },
    }

    let plan = with_socket(fd, |sock| match &sock.kind {
        Kind::Tcp(TcpKind::Unbound { .. }) => Ok(Plan::TcpConnect(sock.recv_timeout_ticks)),
        Kind::Tcp(_) => Err(NetError::NotConnected),
        Kind::Udp(udp) => Ok(if udp.port.is_none() {
            Plan::UdpConnect { needs_bind: true }
        } else {
            Plan::UdpConnect { needs_bind: false }
        }),
    })?;

    match plan {
        Plan::TcpConnect(timeout) => {
            let conn_id = super::tcp::connect(addr.ip, addr.port, timeout);
            if conn_id == u32::MAX {
                return Err(NetError::TimedOut);
            }
            with_socket(fd, |sock| {
                sock.kind = Kind::Tcp(TcpKind::Connected { conn_id });
                Ok(())
            })
        }
        Plan::UdpConnect { needs_bind } => {
            let port = if needs_bind {
                let port = alloc_udp_ephemeral_port();
                if !super::udp::bind(port) {
                    return Err(NetError::AddressInUse);
                }
                Some(port)
            } else {
                None
            };
            with_socket(fd, |sock| {
                if let Kind::Udp(udp) = &mut sock.kind {
                    if let Some(p) = port {
                        udp.port = Some(p);
                    }
                    udp.peer = Some(addr);
                }
                Ok(())
            })
        }
    }
}

/// Send on a connected socket (TCP peer, or UDP's `connect()`-recorded peer).
pub fn send(fd: u32, data: &[u8]) -> NetResult<usize> {
    sendto_inner(fd, data, None)
}

/// Send to an explicit destination (UDP only — TCP is stream-oriented and
/// has a single fixed peer once connected).
pub fn sendto(fd: u32, data: &[u8], addr: SockAddr) -> NetResult<usize> {
    sendto_inner(fd, data, Some(addr))
}

fn sendto_inner(fd: u32, data: &[u8], addr: Option<SockAddr>) -> NetResult<usize> {
    let (conn_id, udp_port, udp_dst, nonblocking, timeout) = with_socket(fd, |sock| match &sock.kind {
        Kind::Tcp(TcpKind::Connected { conn_id }) => {
            if addr.is_some() {
                return Err(NetError::InvalidArgument);
            }
            Ok((Some(*conn_id), None, None, sock.nonblocking, sock.recv_timeout_ticks))
        }
        Kind::Tcp(_) => Err(NetError::NotConnected),
        Kind::Udp(udp) => {
            let port = udp.port.ok_or(NetError::NotConnected)?;
            let dst = addr.or(udp.peer).ok_or(NetError::InvalidArgument)?;
            Ok((None, Some(port), Some(dst), sock.nonblocking, sock.recv_timeout_ticks))
        }
    })?;

    if let Some(conn_id) = conn_id {
        let wait_ticks = if nonblocking { 0 } else { timeout };
        let n = super::tcp::send(conn_id, data, wait_ticks);
        if n == u32::MAX {
            let _ = with_socket(fd, |sock| { sock.so_error = Some(NetError::ConnectionReset); Ok(()) });
            return Err(NetError::ConnectionReset);
        }
        return Ok(n as usize);
    }

    let (port, dst) = (udp_port.unwrap(), udp_dst.unwrap());
    if !super::udp::send(dst.ip, port, dst.port, data) {
        return Err(NetError::NoRoute);
    }
    Ok(data.len())
}

/// Receive on a connected socket. Returns 0 at end-of-stream (TCP FIN).
pub fn recv(fd: u32, buf: &mut [u8]) -> NetResult<usize> {
    recvfrom_inner(fd, buf).map(|(n, _)| n)
}

/// Receive and report the sender's address (meaningful for UDP; for a
/// connected TCP socket this just echoes the peer).
pub fn recvfrom(fd: u32, buf: &mut [u8]) -> NetResult<(usize, SockAddr)> {
    recvfrom_inner(fd, buf)
}

fn recvfrom_inner(fd: u32, buf: &mut [u8]) -> NetResult<(usize, SockAddr)> {
    let (conn_id, udp_port, nonblocking, timeout) = with_socket(fd, |sock| match &sock.kind {
        Kind::Tcp(TcpKind::Connected { conn_id }) => Ok((Some(*conn_id), None, sock.nonblocking, sock.recv_timeout_ticks)),
        Kind::Tcp(_) => Err(NetError::NotConnected),
        Kind::Udp(udp) => {
            let port = udp.port.ok_or(NetError::NotConnected)?;
            Ok((None, Some(port), sock.nonblocking, sock.recv_timeout_ticks))
        }
    })?;

    if let Some(conn_id) = conn_id {
        if nonblocking && super::tcp::recv_available(conn_id) == 0 {
            return Err(NetError::WouldBlock);
        }
        let wait_ticks = if nonblocking { 0 } else { timeout };
        let n = super::tcp::recv(conn_id, buf, wait_ticks);
        if n == u32::MAX {
            let _ = with_socket(fd, |sock| { sock.so_error = Some(NetError::ConnectionReset); Ok(()) });
            return Err(NetError::ConnectionReset);
        }
        let peer = with_socket(fd, |sock| match &sock.kind {
            Kind::Tcp(TcpKind::Connected { conn_id }) => Ok(tcp_peer_addr(*conn_id)),
            _ => Ok(SockAddr::UNSPECIFIED),
        })?;
        return Ok((n as usize, peer));
    }

    let port = udp_port.unwrap();
    let wait_ticks = if nonblocking { 0 } else { timeout };
    let dgram = if nonblocking {
        super::udp::recv(port)
    } else {
        super::udp::recv_timeout(port, wait_ticks)
    };
    let dgram = dgram.ok_or(NetError::WouldBlock)?;
    let n = dgram.data.len().min(buf.len());
    buf[..n].copy_from_slice(&dgram.data[..n]);
    Ok((n, SockAddr::new(dgram.src_ip, dgram.src_port)))
}

fn tcp_peer_addr(conn_id: u32) -> SockAddr {
    let id = conn_id as usize;
    let conns = super::tcp::TCP_CONNECTIONS.lock();
    conns.as_ref()
        .and_then(|table| table.get(id))
        .and_then(|slot| slot.as_ref())
        .map(|tcb| SockAddr::new(tcb.remote_ip, tcb.remote_port))
        .unwrap_or(SockAddr::UNSPECIFIED)
}

fn tcp_local_port(conn_id: u32) -> u16 {
    let id = conn_id as usize;
    let conns = super::tcp::TCP_CONNECTIONS.lock();
    conns.as_ref()
        .and_then(|table| table.get(id))
        .and_then(|slot| slot.as_ref())
        .map(|tcb| tcb.local_port)
        .unwrap_or(0)
}

/// Close a socket, releasing its fd and tearing down the underlying
/// connection or port binding.
pub fn close(fd: u32) -> NetResult<()> {
    let id = fd as usize;
    let mut table = SOCKETS.lock();
    let slots = table.as_mut().ok_or(NetError::NoDevice)?;
    let sock = slots.get_mut(id).and_then(|s| s.take()).ok_or(NetError::InvalidArgument)?;
    drop(table);

    match sock.kind {
        Kind::Tcp(TcpKind::Connected { conn_id }) => { super::tcp::close(conn_id); }
        Kind::Tcp(TcpKind::Listening { conn_id }) => { super::tcp::close_listener(conn_id); }
        Kind::Tcp(TcpKind::Unbound { .. }) => {}
        Kind::Udp(udp) => {
            if let Some(port) = udp.port {
                super::udp::unbind(port);
            }
        }
    }
    Ok(())
}

/// Half- or fully-close a connected TCP socket. UDP has no shutdown
/// concept beyond `close()`.
pub fn shutdown(fd: u32, how: u32) -> NetResult<()> {
    with_socket(fd, |sock| match &sock.kind {
        Kind::Tcp(TcpKind::Connected { conn_id }) => {
            match how {
                SHUT_WR | SHUT_RDWR => {
                    if super::tcp::shutdown_write(*conn_id) == u32::MAX {
                        return Err(NetError::NotConnected);
                    }
                    Ok(())
                }
                SHUT_RD => Ok(()), // inbound data still drains from recv_buf; no separate flag to flip
                _ => Err(NetError::InvalidArgument),
            }
        }
        _ => Err(NetError::InvalidArgument),
    })
}

/// Set a socket option. `SO_NONBLOCK` and `SO_RCVTIMEO` are handled purely
/// at this layer; `SO_BROADCAST` forwards to the UDP port config.
pub fn setsockopt(fd: u32, opt: u32, val: u32) -> NetResult<()> {
    with_socket(fd, |sock| match opt {
        SO_NONBLOCK => { sock.nonblocking = val != 0; Ok(()) }
        SO_RCVTIMEO => { sock.recv_timeout_ticks = if val == 0 { u32::MAX } else { val }; Ok(()) }
        SO_BROADCAST => match &sock.kind {
            Kind::Udp(udp) => {
                let port = udp.port.ok_or(NetError::NotConnected)?;
                if !super::udp::set_opt(port, SO_BROADCAST, val) {
                    return Err(NetError::InvalidArgument);
                }
                Ok(())
            }
            Kind::Tcp(_) => Err(NetError::InvalidArgument),
        },
        _ => Err(NetError::InvalidArgument),
    })
}

/// Get a socket option. `SO_ERROR` consumes (clears) the sticky error.
pub fn getsockopt(fd: u32, opt: u32) -> NetResult<u32> {
    with_socket(fd, |sock| match opt {
        SO_NONBLOCK => Ok(sock.nonblocking as u32),
        SO_RCVTIMEO => Ok(sock.recv_timeout_ticks),
        SO_ERROR => Ok(sock.so_error.take().map(|e| e as i32 as u32).unwrap_or(0)),
        _ => Err(NetError::InvalidArgument),
    })
}

/// The socket's own bound address.
pub fn getsockname(fd: u32) -> NetResult<SockAddr> {
    with_socket(fd, |sock| {
        let cfg = super::config();
        match &sock.kind {
            Kind::Tcp(TcpKind::Unbound { pending_port }) => Ok(SockAddr::new(cfg.ip, pending_port.unwrap_or(0))),
            Kind::Tcp(TcpKind::Connected { conn_id }) | Kind::Tcp(TcpKind::Listening { conn_id }) => {
                Ok(SockAddr::new(cfg.ip, tcp_local_port(*conn_id)))
            }
            Kind::Udp(udp) => Ok(SockAddr::new(cfg.ip, udp.port.unwrap_or(0))),
        }
    })
}

/// The socket's connected peer address.
pub fn getpeername(fd: u32) -> NetResult<SockAddr> {
    with_socket(fd, |sock| match &sock.kind {
        Kind::Tcp(TcpKind::Connected { conn_id }) => Ok(tcp_peer_addr(*conn_id)),
        Kind::Udp(udp) => udp.peer.ok_or(NetError::NotConnected),
        _ => Err(NetError::NotConnected),
    })
}

/// Shared ephemeral port source with TCP, so the two protocols don't hand
/// out the same port independently.
fn alloc_udp_ephemeral_port() -> u16 {
    super::tcp::util::alloc_ephemeral_port()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset() {
        init();
        super::super::udp::init();
    }

    #[test]
    fn sockaddr_round_trips_through_text() {
        let addr = SockAddr::new(Ipv4Addr::new(192, 168, 1, 7), 8080);
        let text = alloc::format!("{}", addr);
        assert_eq!(SockAddr::parse(&text), Some(addr));
    }

    #[test]
    #[serial]
    fn udp_socket_binds_and_closes() {
        reset();
        let fd = socket(AF_INET, SOCK_DGRAM).unwrap();
        bind(fd, SockAddr::new(Ipv4Addr::ZERO, 9000)).unwrap();
        assert_eq!(getsockname(fd).unwrap().port, 9000);
        close(fd).unwrap();
    }

    #[test]
    #[serial]
    fn double_bind_same_port_fails() {
        reset();
        let fd1 = socket(AF_INET, SOCK_DGRAM).unwrap();
        let fd2 = socket(AF_INET, SOCK_DGRAM).unwrap();
        bind(fd1, SockAddr::new(Ipv4Addr::ZERO, 9001)).unwrap();
        assert_eq!(bind(fd2, SockAddr::new(Ipv4Addr::ZERO, 9001)), Err(NetError::AddressInUse));
        close(fd1).unwrap();
        close(fd2).unwrap();
    }

    #[test]
    #[serial]
    fn nonblocking_recv_on_empty_udp_socket_would_block() {
        reset();
        let fd = socket(AF_INET, SOCK_DGRAM).unwrap();
        bind(fd, SockAddr::new(Ipv4Addr::ZERO, 9002)).unwrap();
        setsockopt(fd, SO_NONBLOCK, 1).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(recv(fd, &mut buf), Err(NetError::WouldBlock));
        close(fd).unwrap();
    }

    #[test]
    fn wrong_domain_is_rejected() {
        assert_eq!(socket(23, SOCK_STREAM), Err(NetError::InvalidArgument));
    }
}
