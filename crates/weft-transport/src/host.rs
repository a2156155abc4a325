//! # Host
//!
//! A [`Host`] multiplexes every peer connection over one transport
//! endpoint. The application drives it with a pull loop:
//!
//! ```no_run
//! # use std::time::Duration;
//! # use weft_transport::{Event, Host, HostConfig};
//! let mut host = Host::bind("0.0.0.0:5000", HostConfig::default())?;
//! loop {
//!     if let Some(event) = host.service(Duration::from_millis(50))? {
//!         match event {
//!             Event::Connect { peer, .. } => println!("{peer:?} connected"),
//!             Event::Receive { packet, .. } => println!("{} bytes", packet.len()),
//!             Event::Disconnect { peer, .. } => break,
//!         }
//!     }
//! }
//! # Ok::<(), weft_transport::Error>(())
//! ```
//!
//! Everything is single-threaded; the only blocking point is inside
//! [`Host::service`], and only when no event is already queued.

use bytes::{Bytes, BytesMut};
use quanta::{Clock, Instant};
use rand::Rng;
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::{Context, HostConfig};
use crate::congestion::Throttle;
use crate::packet::{DisconnectReason, Packet, SendMode};
use crate::peer::{Peer, PeerState, Signal};
use crate::stats::HostStats;
use crate::transport::{Transport, UdpTransport};
use crate::wire::{self, Command, Datagram, DatagramHeader};
use crate::{Error, MAX_MTU, PEER_ID_NONE};

/// Handle to a peer slot. Valid from the call that created it until the
/// `Disconnect` event for that peer has been returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub(crate) u16);

/// What `service()` hands back, one at a time, in order of occurrence.
#[derive(Debug)]
pub enum Event {
    /// Mutual connection confirmation. `data` is the 32-bit value the
    /// initiator attached to its connect request.
    Connect { peer: PeerId, data: u32 },
    /// The connection ended. Exactly one per peer that was visible to the
    /// application, plus one for each failed outbound connect.
    Disconnect {
        peer: PeerId,
        data: u32,
        reason: DisconnectReason,
    },
    /// A packet arrived. Reliable packets surface in per-channel order.
    Receive {
        peer: PeerId,
        channel: u8,
        packet: Packet,
    },
}

pub struct Host<T: Transport = UdpTransport> {
    transport: T,
    config: HostConfig,
    context: Context,
    clock: Clock,
    peers: Slab<Peer>,
    /// Routes handshake-phase datagrams, which carry no peer id yet.
    by_addr: HashMap<SocketAddr, usize>,
    events: VecDeque<Event>,
    incoming_throttle: Throttle,
    outgoing_throttle: Throttle,
    recv_buf: Vec<u8>,
    stats: HostStats,
}

impl Host<UdpTransport> {
    /// Bind a UDP socket and serve connections on it.
    pub fn bind<A: ToSocketAddrs>(addr: A, config: HostConfig) -> Result<Self, Error> {
        Host::with_transport(UdpTransport::bind(addr)?, config, Context::new())
    }

    /// An outbound-only host on an ephemeral port.
    pub fn client(config: HostConfig) -> Result<Self, Error> {
        Host::with_transport(UdpTransport::unbound()?, config, Context::new())
    }
}

impl<T: Transport> Host<T> {
    /// Build a host over any transport. The `Context` supplies process-wide
    /// collaborators such as the compressor.
    pub fn with_transport(transport: T, config: HostConfig, context: Context) -> Result<Self, Error> {
        Host::with_clock(transport, config, context, Clock::new())
    }

    /// Like [`Host::with_transport`] with an explicit clock. Tests pass
    /// `quanta::Clock::mock()` to step time deterministically.
    pub fn with_clock(
        transport: T,
        config: HostConfig,
        context: Context,
        clock: Clock,
    ) -> Result<Self, Error> {
        let config = config.validate()?;
        let now = clock.now();
        Ok(Host {
            transport,
            incoming_throttle: Throttle::new(config.incoming_bandwidth, now),
            outgoing_throttle: Throttle::new(config.outgoing_bandwidth, now),
            peers: Slab::with_capacity(config.max_peers),
            by_addr: HashMap::with_capacity(config.max_peers),
            events: VecDeque::new(),
            recv_buf: vec![0; MAX_MTU],
            stats: HostStats::default(),
            config,
            context,
            clock,
        })
    }

    // ─── Connection API ─────────────────────────────────────────────────

    /// Begin connecting to `addr`. Returns immediately; the outcome arrives
    /// later as a `Connect` event, or a `Disconnect` with reason
    /// `ConnectFailed` if every retry goes unanswered.
    pub fn connect(&mut self, addr: SocketAddr, user_data: u32) -> Result<PeerId, Error> {
        if self.peers.len() >= self.config.max_peers {
            return Err(Error::PeerTableFull {
                capacity: self.config.max_peers,
            });
        }
        let now = self.clock.now();
        let session = self.fresh_session();
        let entry = self.peers.vacant_entry();
        let slot = entry.key();
        entry.insert(Peer::outgoing(
            addr,
            slot as u16,
            session,
            user_data,
            &self.config,
            now,
        ));
        self.by_addr.insert(addr, slot);
        debug!(%addr, slot, "connecting");
        Ok(PeerId(slot as u16))
    }

    /// Queue a packet to a connected peer. It reaches the wire on the next
    /// `service()` or `flush()`.
    pub fn send(
        &mut self,
        peer: PeerId,
        channel: u8,
        packet: Packet,
        mode: SendMode,
    ) -> Result<(), Error> {
        self.peer_mut(peer)?.enqueue(channel, packet, mode)
    }

    /// Graceful disconnect; queued outbound data is abandoned.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) -> Result<(), Error> {
        let now = self.clock.now();
        self.peer_mut(peer)?.disconnect(data, now);
        Ok(())
    }

    /// Graceful disconnect after all queued reliable data is delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) -> Result<(), Error> {
        self.peer_mut(peer)?.disconnect_later(data);
        Ok(())
    }

    /// Immediate teardown with one best-effort notification datagram.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) -> Result<(), Error> {
        let now = self.clock.now();
        let p = self.peer_mut(peer)?;
        let farewell = p.disconnect_now(data, now);
        let addr = p.address();
        if let Some(dgram) = farewell {
            self.transmit(dgram, addr)?;
        }
        self.events.push_back(Event::Disconnect {
            peer,
            data,
            reason: DisconnectReason::Graceful,
        });
        Ok(())
    }

    /// Immediate teardown, no datagram at all. The remote finds out from
    /// its own timeout.
    pub fn reset(&mut self, peer: PeerId) -> Result<(), Error> {
        self.peer_mut(peer)?.reset();
        self.events.push_back(Event::Disconnect {
            peer,
            data: 0,
            reason: DisconnectReason::Graceful,
        });
        Ok(())
    }

    // ─── Service Loop ───────────────────────────────────────────────────

    /// One service quantum: run timers, flush outbound traffic, drain the
    /// socket, and return the oldest pending event. With no event queued,
    /// blocks on transport readiness until `timeout` elapses.
    pub fn service(&mut self, timeout: Duration) -> Result<Option<Event>, Error> {
        let start = self.clock.now();
        loop {
            self.pump()?;
            if let Some(event) = self.pop_event() {
                return Ok(Some(event));
            }
            let elapsed = self.clock.now().duration_since(start);
            if elapsed >= timeout {
                return Ok(None);
            }
            self.transport.wait_readable(timeout - elapsed)?;
        }
    }

    /// Timers, outbound flush and inbound drain without blocking or
    /// returning an event. Events accumulate for later `service()` calls.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.pump()
    }

    fn pump(&mut self) -> Result<(), Error> {
        let now = self.clock.now();
        let slots: Vec<usize> = self.peers.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            let signals = match self.peers.get_mut(slot) {
                Some(peer) => peer.tick(now),
                None => continue,
            };
            for signal in signals {
                self.apply_signal(slot, signal);
            }
        }
        self.flush_outbound(now)?;
        self.drain_inbound(now)?;
        // Acks and handshake replies generated while draining go out in the
        // same quantum, before any slot can be reclaimed.
        self.flush_outbound(now)?;
        Ok(())
    }

    fn pop_event(&mut self) -> Option<Event> {
        let event = self.events.pop_front()?;
        match &event {
            Event::Connect { peer, .. } => {
                if let Some(p) = self.peers.get_mut(peer.0 as usize) {
                    p.mark_connected();
                }
            }
            Event::Disconnect { peer, .. } => self.remove_peer(peer.0 as usize),
            Event::Receive { .. } => {}
        }
        Some(event)
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    fn flush_outbound(&mut self, now: Instant) -> Result<(), Error> {
        let mtu = self.config.mtu;
        let slots: Vec<usize> = self.peers.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            loop {
                // Peek with a worst-case datagram before building one, so a
                // denied send leaves the peer's queues untouched.
                if !self.outgoing_throttle.check(mtu, now) {
                    self.stats.throttle_deferrals += 1;
                    return Ok(());
                }
                let Some(peer) = self.peers.get_mut(slot) else { break };
                let Some(dgram) = peer.build_datagram(now) else { break };
                let addr = peer.address();
                let len = dgram.len();
                self.transmit(dgram, addr)?;
                self.outgoing_throttle.try_take(len, now);
            }
        }
        Ok(())
    }

    fn transmit(&mut self, mut datagram: BytesMut, addr: SocketAddr) -> Result<(), Error> {
        if let Some(header_len) = wire::header_len(&datagram) {
            if let Some(packed) = self.context.compressor().compress(&datagram[header_len..]) {
                if packed.len() < datagram.len() - header_len {
                    datagram.truncate(header_len);
                    datagram.extend_from_slice(&packed);
                    wire::mark_compressed(&mut datagram);
                }
            }
        }
        self.transport.send_to(&datagram, addr)?;
        self.stats.datagrams_sent += 1;
        Ok(())
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    fn drain_inbound(&mut self, now: Instant) -> Result<(), Error> {
        loop {
            let Some((len, addr)) = self.transport.recv_from(&mut self.recv_buf)? else {
                return Ok(());
            };
            self.stats.datagrams_received += 1;
            let raw = Bytes::copy_from_slice(&self.recv_buf[..len]);
            self.handle_datagram(raw, addr, now);
            // Spend the incoming budget after the fact; when it runs dry the
            // rest of the backlog waits for the next quantum.
            if !self.incoming_throttle.try_take(len, now) {
                return Ok(());
            }
        }
    }

    fn handle_datagram(&mut self, raw: Bytes, addr: SocketAddr, now: Instant) {
        let size = raw.len();
        let Some(Datagram { header, commands }) = self.decode_datagram(raw) else {
            trace!(%addr, "malformed datagram dropped");
            self.stats.datagrams_dropped += 1;
            return;
        };
        let Some((slot, authenticated)) = self.route(&header, &commands, addr, now) else {
            self.stats.datagrams_dropped += 1;
            return;
        };

        let mut signals = Vec::new();
        if let Some(peer) = self.peers.get_mut(slot) {
            peer.stats.bytes_received += size as u64;
            if let Some(signal) = peer.on_datagram(authenticated, now) {
                signals.push(signal);
            }
            if let Some(ack) = &header.ack {
                peer.process_ack(ack, now);
            }
            for command in commands {
                signals.extend(peer.handle_command(command, now));
            }
        }
        for signal in signals {
            self.apply_signal(slot, signal);
        }
    }

    /// Header, then optional decompression, then the command run. Any
    /// malformed piece rejects the whole datagram.
    fn decode_datagram(&self, mut raw: Bytes) -> Option<Datagram> {
        let header = DatagramHeader::decode(&mut raw)?;
        let mut region = raw;
        if header.compressed {
            let inflated = self.context.compressor().decompress(&region, MAX_MTU)?;
            region = Bytes::from(inflated);
        }
        let mut commands = Vec::new();
        while !region.is_empty() {
            commands.push(Command::decode(&mut region)?);
        }
        Some(Datagram { header, commands })
    }

    /// Map a datagram to a peer slot. Addressed datagrams authenticate by
    /// slot + session; unaddressed ones route by source address, and an
    /// unknown source is admitted only when it opens with `Connect`.
    fn route(
        &mut self,
        header: &DatagramHeader,
        commands: &[Command],
        addr: SocketAddr,
        now: Instant,
    ) -> Option<(usize, bool)> {
        if header.peer_id != PEER_ID_NONE {
            let slot = header.peer_id as usize;
            return match self.peers.get(slot) {
                Some(peer) if peer.local_session() == header.session_id => Some((slot, true)),
                _ => {
                    trace!(%addr, peer = header.peer_id, "stale or unknown session");
                    None
                }
            };
        }
        if let Some(&slot) = self.by_addr.get(&addr) {
            return Some((slot, false));
        }
        let Some(Command::Connect {
            peer_id,
            session_id,
            channel_count,
            mtu,
            user_data,
        }) = commands.first()
        else {
            trace!(%addr, "unaddressed datagram from unknown source");
            return None;
        };
        if self.peers.len() >= self.config.max_peers {
            warn!(%addr, "connect refused, peer table full");
            self.stats.connects_refused += 1;
            return None;
        }
        let session = self.fresh_session();
        let entry = self.peers.vacant_entry();
        let slot = entry.key();
        entry.insert(Peer::incoming(
            addr,
            slot as u16,
            session,
            *peer_id,
            *session_id,
            *channel_count,
            *mtu,
            *user_data,
            &self.config,
            now,
        ));
        self.by_addr.insert(addr, slot);
        debug!(%addr, slot, "inbound connection");
        Some((slot, false))
    }

    fn apply_signal(&mut self, slot: usize, signal: Signal) {
        let peer = PeerId(slot as u16);
        match signal {
            Signal::Established => {
                let data = self.peers.get(slot).map_or(0, Peer::user_data);
                self.events.push_back(Event::Connect { peer, data });
            }
            Signal::Delivered { channel, payload } => self.events.push_back(Event::Receive {
                peer,
                channel,
                packet: Packet::new(payload),
            }),
            Signal::Disconnected { reason, data } => {
                self.events.push_back(Event::Disconnect { peer, data, reason })
            }
            Signal::Expired => self.remove_peer(slot),
        }
    }

    fn remove_peer(&mut self, slot: usize) {
        if self.peers.contains(slot) {
            let peer = self.peers.remove(slot);
            self.by_addr.remove(&peer.address());
        }
    }

    fn peer_mut(&mut self, peer: PeerId) -> Result<&mut Peer, Error> {
        self.peers.get_mut(peer.0 as usize).ok_or(Error::UnknownPeer)
    }

    fn fresh_session(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            // 0 is the pre-handshake placeholder on the wire.
            let session: u32 = rng.gen();
            if session != 0 {
                return session;
            }
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    /// Borrow a live peer for its accessors (`rtt()`, `state()`, stats).
    pub fn peer(&self, peer: PeerId) -> Option<&Peer> {
        self.peers.get(peer.0 as usize)
    }

    /// State of a peer slot; `Disconnected` for ids no longer live.
    pub fn peer_state(&self, peer: PeerId) -> PeerState {
        self.peer(peer).map_or(PeerState::Disconnected, Peer::state)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The underlying transport, for test conditioning.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
