//! The socket seam. The engine never constructs sockets except through this
//! module; everything above it sees only [`Transport`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::time::Duration;

/// Non-blocking datagram I/O over one bound socket.
pub trait Transport {
    /// Send one datagram. Failures other than `WouldBlock` are fatal for the
    /// owning host.
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Receive one datagram if immediately available.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Block until a datagram is readable or `timeout` elapses. Returns
    /// whether data became readable. Implementations without a blocking
    /// primitive may return early.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Local address, where meaningful.
    fn local_addr(&self) -> Option<SocketAddr>;
}

// ─── UDP ────────────────────────────────────────────────────────────────────

/// [`Transport`] over one non-blocking `std::net::UdpSocket`.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to the given local address.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(UdpTransport { socket })
    }

    /// Bind to an ephemeral port, for outbound-only hosts.
    pub fn unbound() -> io::Result<Self> {
        Self::bind((Ipv4Addr::UNSPECIFIED, 0))
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket.send_to(data, addr) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram; the protocol treats it
            // as loss, not failure.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // Some platforms surface ICMP port-unreachable here; treat it as
            // silence and let the inactivity timeout handle a dead peer.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if timeout.is_zero() {
            return Ok(false);
        }
        self.socket.set_nonblocking(false)?;
        // set_read_timeout rejects Duration::ZERO, guarded above.
        self.socket.set_read_timeout(Some(timeout))?;
        let mut probe = [0u8; 1];
        let result = match self.socket.peek_from(&mut probe) {
            Ok(_) => Ok(true),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(false),
            Err(e) => Err(e),
        };
        self.socket.set_nonblocking(true)?;
        result
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

// ─── In-Memory Pair ─────────────────────────────────────────────────────────

/// Impairments applied to one direction of a [`MemoryTransport`] link.
#[derive(Debug, Default)]
pub struct Conditioner {
    /// Drop this many of the next outbound datagrams.
    pub drop_next: usize,
    /// Duplicate this many of the next outbound datagrams.
    pub duplicate_next: usize,
    /// Hold outbound datagrams and release them in reverse order on the next
    /// send after the hold is cleared.
    pub hold_for_reorder: bool,
}

struct Mailbox {
    queue: VecDeque<(Vec<u8>, SocketAddr)>,
}

/// Deterministic in-memory [`Transport`] for tests and simulation. Created in
/// connected pairs; each endpoint can script loss, duplication and
/// reordering on its own outbound direction.
pub struct MemoryTransport {
    addr: SocketAddr,
    peer_addr: SocketAddr,
    inbox: Rc<RefCell<Mailbox>>,
    outbox: Rc<RefCell<Mailbox>>,
    /// Outbound impairment script.
    pub conditioner: Conditioner,
    held: Vec<(Vec<u8>, SocketAddr)>,
}

impl MemoryTransport {
    /// Create two connected endpoints with the given pretend addresses.
    pub fn pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (Self, Self) {
        let box_a = Rc::new(RefCell::new(Mailbox {
            queue: VecDeque::new(),
        }));
        let box_b = Rc::new(RefCell::new(Mailbox {
            queue: VecDeque::new(),
        }));
        let a = MemoryTransport {
            addr: addr_a,
            peer_addr: addr_b,
            inbox: Rc::clone(&box_a),
            outbox: Rc::clone(&box_b),
            conditioner: Conditioner::default(),
            held: Vec::new(),
        };
        let b = MemoryTransport {
            addr: addr_b,
            peer_addr: addr_a,
            inbox: box_b,
            outbox: box_a,
            conditioner: Conditioner::default(),
            held: Vec::new(),
        };
        (a, b)
    }

    /// Release datagrams held for reordering, newest first.
    pub fn release_held(&mut self) {
        let mut outbox = self.outbox.borrow_mut();
        while let Some(held) = self.held.pop() {
            outbox.queue.push_back(held);
        }
    }

    /// Datagrams queued toward this endpoint.
    pub fn pending(&self) -> usize {
        self.inbox.borrow().queue.len()
    }
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, data: &[u8], _addr: SocketAddr) -> io::Result<()> {
        if self.conditioner.drop_next > 0 {
            self.conditioner.drop_next -= 1;
            return Ok(());
        }
        if self.conditioner.hold_for_reorder {
            self.held.push((data.to_vec(), self.addr));
            return Ok(());
        }
        let mut outbox = self.outbox.borrow_mut();
        outbox.queue.push_back((data.to_vec(), self.addr));
        if self.conditioner.duplicate_next > 0 {
            self.conditioner.duplicate_next -= 1;
            outbox.queue.push_back((data.to_vec(), self.addr));
        }
        Ok(())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inbox = self.inbox.borrow_mut();
        match inbox.queue.pop_front() {
            Some((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(Some((len, from)))
            }
            None => Ok(None),
        }
    }

    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        // Both endpoints live on one thread; blocking would deadlock.
        Ok(self.pending() > 0)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("addr", &self.addr)
            .field("peer_addr", &self.peer_addr)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "10.0.0.1:5000".parse().unwrap(),
            "10.0.0.2:6000".parse().unwrap(),
        )
    }

    #[test]
    fn memory_pair_delivers_both_ways() {
        let (a, b) = addrs();
        let (mut ta, mut tb) = MemoryTransport::pair(a, b);

        ta.send_to(b"ping", b).unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = tb.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a);

        tb.send_to(b"pong", a).unwrap();
        let (len, from) = ta.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from, b);
    }

    #[test]
    fn conditioner_drops_and_duplicates() {
        let (a, b) = addrs();
        let (mut ta, mut tb) = MemoryTransport::pair(a, b);

        ta.conditioner.drop_next = 1;
        ta.send_to(b"lost", b).unwrap();
        assert_eq!(tb.pending(), 0);

        ta.conditioner.duplicate_next = 1;
        ta.send_to(b"twice", b).unwrap();
        assert_eq!(tb.pending(), 2);
    }

    #[test]
    fn hold_releases_in_reverse() {
        let (a, b) = addrs();
        let (mut ta, mut tb) = MemoryTransport::pair(a, b);

        ta.conditioner.hold_for_reorder = true;
        ta.send_to(b"first", b).unwrap();
        ta.send_to(b"second", b).unwrap();
        assert_eq!(tb.pending(), 0);

        ta.conditioner.hold_for_reorder = false;
        ta.release_held();
        let mut buf = [0u8; 16];
        let (len, _) = tb.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"second");
        let (len, _) = tb.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"first");
    }
}
