//! # Peer State Machine
//!
//! A [`Peer`] tracks one remote endpoint across its whole lifetime: the
//! three-way connect handshake, established data exchange, and teardown.
//! The host drives every transition by feeding decoded commands and clock
//! ticks; the peer replies with [`Signal`]s for anything the application
//! must see and queues wire commands for the next flush.
//!
//! Connection handshake, both sides:
//!
//! ```text
//! initiator: Connecting ──VerifyConnect──▶ ConnectionSucceeded ──▶ Connected
//! responder: AcknowledgingConnect ──any authenticated datagram──▶
//!            ConnectionPending ──▶ Connected
//! ```
//!
//! Neither side surfaces a Connect event before its confirmation arrives,
//! so an application never holds a half-open peer.

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelItem};
use crate::config::{ConnectionConfig, HostConfig};
use crate::congestion::AimdController;
use crate::fragment::{self, Assembler};
use crate::packet::{DisconnectReason, Packet, SendMode};
use crate::stats::PeerStats;
use crate::wire::{AckRecord, Command, DatagramHeader, VarInt};
use crate::{Error, CONTROL_CHANNEL, MAX_FRAGMENT_COUNT, MIN_MTU, PEER_ID_NONE};

/// Worst-case datagram header: fixed fields plus a full inline ack block.
const HEADER_OVERHEAD: usize = DatagramHeader::BASE_SIZE + 1 + 8 + 8;
/// Worst-case `SendReliable` framing: tag, channel, 8-byte seq, length.
const RELIABLE_OVERHEAD: usize = 1 + 1 + 8 + 2;
/// Worst-case `SendFragment` framing: tag, channel, flags, 8-byte group,
/// index, count, 8-byte seq, length.
const FRAGMENT_OVERHEAD: usize = 1 + 1 + 1 + 8 + 2 + 2 + 8 + 2;

/// Connection lifecycle. Transitions happen only inside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No live connection. Slot states never persist here; the accessor
    /// reports it for unknown ids.
    Disconnected,
    /// Initiator sent `Connect`, awaiting `VerifyConnect`.
    Connecting,
    /// Responder sent `VerifyConnect`, awaiting any authenticated datagram.
    AcknowledgingConnect,
    /// Responder confirmed; Connect event queued but not yet handed out.
    ConnectionPending,
    /// Initiator confirmed; Connect event queued but not yet handed out.
    ConnectionSucceeded,
    /// Fully established.
    Connected,
    /// Draining queued reliable data before a graceful disconnect.
    DisconnectLater,
    /// Sent `Disconnect`, awaiting `DisconnectAck`.
    Disconnecting,
    /// Received `Disconnect`, replying with an ack before teardown.
    AcknowledgingDisconnect,
    /// Torn down; the slot is reclaimed once the event is handed out.
    Zombie,
}

/// Application-visible consequence of peer processing. The host maps these
/// onto its event queue.
#[derive(Debug)]
pub(crate) enum Signal {
    /// Mutual confirmation reached; queue a Connect event.
    Established,
    /// A complete packet is deliverable.
    Delivered { channel: u8, payload: Bytes },
    /// The connection ended; queue a Disconnect event.
    Disconnected { reason: DisconnectReason, data: u32 },
    /// Responder handshake expired before confirmation. Free the slot with
    /// no event; the application never saw this peer.
    Expired,
}

// ─── RTT Estimation ─────────────────────────────────────────────────────────

/// RFC 6298 smoothed RTT and variance.
#[derive(Debug, Default)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl RttEstimator {
    pub fn on_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if srtt > sample { srtt - sample } else { sample - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Retransmission timeout, clamped to the configured bounds.
    pub fn rto(&self, min: Duration, max: Duration) -> Duration {
        match self.srtt {
            None => min.max(Duration::from_millis(200)).min(max),
            Some(srtt) => (srtt + 4 * self.rttvar).clamp(min, max),
        }
    }
}

// ─── Control Command Resend ─────────────────────────────────────────────────

/// Handshake and teardown commands are retransmitted on their own
/// exponential backoff, outside any channel's sequence space.
struct ControlResend {
    command: Command,
    next_at: Instant,
    attempts: u8,
    limit: u8,
    interval: Duration,
}

impl ControlResend {
    fn new(command: Command, limit: u8, interval: Duration, now: Instant) -> Self {
        ControlResend {
            command,
            next_at: now,
            attempts: 0,
            limit,
            interval,
        }
    }

    /// `Some(command)` when a (re)send is due, `None` otherwise. Exhaustion
    /// is reported through `is_exhausted` after the call.
    fn poll(&mut self, now: Instant) -> Option<Command> {
        if now < self.next_at || self.attempts > self.limit {
            return None;
        }
        self.attempts += 1;
        if self.attempts > self.limit {
            return None;
        }
        let backoff = self
            .interval
            .checked_mul(1u32 << (self.attempts - 1).min(16))
            .unwrap_or(Duration::from_secs(30));
        self.next_at = now + backoff;
        Some(self.command.clone())
    }

    fn is_exhausted(&self) -> bool {
        self.attempts > self.limit
    }
}

// ─── Peer ───────────────────────────────────────────────────────────────────

pub struct Peer {
    addr: SocketAddr,
    state: PeerState,
    /// Our slab slot, sent to the remote so its datagrams address us.
    local_id: u16,
    /// The remote's slot, stamped on every datagram we send.
    remote_id: u16,
    local_session: u32,
    remote_session: u32,
    user_data: u32,
    /// Negotiated (pairwise minimum) values once the handshake completes.
    channel_count: u8,
    mtu: usize,
    channels: Vec<Channel>,
    /// Sequence space for pings; never carries payloads.
    control: Channel,
    assembler: Assembler,
    rtt: RttEstimator,
    congestion: AimdController,
    config: ConnectionConfig,
    /// Pending handshake or teardown command with its backoff state.
    control_resend: Option<ControlResend>,
    /// Fire-and-forget commands (acks for teardown, immediate replies).
    outgoing: VecDeque<Command>,
    /// Reliable commands due for retransmission this tick.
    retransmit_queue: VecDeque<Command>,
    /// Unreliable and unsequenced commands awaiting a flush slot.
    unreliable_unsent: VecDeque<Command>,
    flush_cursor: usize,
    last_receive: Instant,
    last_ping: Instant,
    /// Disconnect payload to report when teardown completes.
    disconnect_data: u32,
    pub(crate) stats: PeerStats,
}

impl Peer {
    /// Initiator side: created by `connect()`. The first `Connect` goes out
    /// on the next flush.
    pub(crate) fn outgoing(
        addr: SocketAddr,
        local_id: u16,
        session_id: u32,
        user_data: u32,
        host: &HostConfig,
        now: Instant,
    ) -> Self {
        let mut peer = Peer::raw(addr, local_id, session_id, user_data, host, now);
        peer.state = PeerState::Connecting;
        peer.control_resend = Some(ControlResend::new(
            Command::Connect {
                peer_id: local_id,
                session_id,
                channel_count: host.channel_count,
                mtu: host.mtu as u16,
                user_data,
            },
            host.connection.connect_retry_limit,
            host.connection.connect_interval,
            now,
        ));
        peer
    }

    /// Responder side: created from an inbound `Connect`. Negotiates the
    /// pairwise-minimum channel count and MTU and schedules `VerifyConnect`.
    pub(crate) fn incoming(
        addr: SocketAddr,
        local_id: u16,
        session_id: u32,
        remote_id: u16,
        remote_session: u32,
        remote_channels: u8,
        remote_mtu: u16,
        user_data: u32,
        host: &HostConfig,
        now: Instant,
    ) -> Self {
        let mut peer = Peer::raw(addr, local_id, session_id, user_data, host, now);
        peer.state = PeerState::AcknowledgingConnect;
        peer.remote_id = remote_id;
        peer.remote_session = remote_session;
        peer.negotiate(remote_channels, remote_mtu);
        peer.control_resend = Some(ControlResend::new(
            Command::VerifyConnect {
                peer_id: local_id,
                session_id,
                channel_count: peer.channel_count,
                mtu: peer.mtu as u16,
            },
            host.connection.connect_retry_limit,
            host.connection.connect_interval,
            now,
        ));
        peer
    }

    fn raw(
        addr: SocketAddr,
        local_id: u16,
        session_id: u32,
        user_data: u32,
        host: &HostConfig,
        now: Instant,
    ) -> Self {
        let config = host.connection.clone();
        let channels = (0..host.channel_count)
            .map(|id| Channel::new(id, config.reorder_capacity))
            .collect();
        Peer {
            addr,
            state: PeerState::Disconnected,
            local_id,
            remote_id: PEER_ID_NONE,
            local_session: session_id,
            remote_session: 0,
            user_data,
            channel_count: host.channel_count,
            mtu: host.mtu,
            channels,
            control: Channel::new(CONTROL_CHANNEL, config.reorder_capacity),
            assembler: Assembler::new(config.assembly_capacity, config.fragment_timeout),
            rtt: RttEstimator::default(),
            congestion: AimdController::new(&config),
            config,
            control_resend: None,
            outgoing: VecDeque::new(),
            retransmit_queue: VecDeque::new(),
            unreliable_unsent: VecDeque::new(),
            flush_cursor: 0,
            last_receive: now,
            last_ping: now,
            disconnect_data: 0,
            stats: PeerStats::default(),
        }
    }

    fn negotiate(&mut self, remote_channels: u8, remote_mtu: u16) {
        self.channel_count = self.channel_count.min(remote_channels).max(1);
        self.mtu = self.mtu.min(remote_mtu as usize).max(MIN_MTU);
        self.channels.truncate(self.channel_count as usize);
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn user_data(&self) -> u32 {
        self.user_data
    }

    /// Smoothed round-trip time; zero before the first sample.
    pub fn rtt(&self) -> Duration {
        self.rtt.srtt().unwrap_or(Duration::ZERO)
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub(crate) fn local_session(&self) -> u32 {
        self.local_session
    }

    pub(crate) fn is_zombie(&self) -> bool {
        self.state == PeerState::Zombie
    }

    fn is_established(&self) -> bool {
        matches!(
            self.state,
            PeerState::ConnectionPending
                | PeerState::ConnectionSucceeded
                | PeerState::Connected
                | PeerState::DisconnectLater
        )
    }

    /// Connect event handed to the caller; the connection is now fully
    /// observable on both sides of the API.
    pub(crate) fn mark_connected(&mut self) {
        if matches!(
            self.state,
            PeerState::ConnectionPending | PeerState::ConnectionSucceeded
        ) {
            self.state = PeerState::Connected;
        }
    }

    // ─── Send API ───────────────────────────────────────────────────────

    /// Queue a packet. Oversized payloads fragment here; everything waits
    /// for the next flush to reach the wire.
    pub(crate) fn enqueue(
        &mut self,
        channel: u8,
        packet: Packet,
        mode: SendMode,
    ) -> Result<(), Error> {
        if !matches!(self.state, PeerState::Connected) {
            return Err(Error::NotConnected);
        }
        if channel >= self.channel_count {
            return Err(Error::InvalidChannel {
                channel,
                count: self.channel_count,
            });
        }
        let payload = packet.into_bytes();
        let single_max = self.mtu - HEADER_OVERHEAD - RELIABLE_OVERHEAD;
        let fragment_max = self.mtu - HEADER_OVERHEAD - FRAGMENT_OVERHEAD;
        if payload.len() > fragment_max * MAX_FRAGMENT_COUNT {
            return Err(Error::PacketTooLarge {
                size: payload.len(),
                max: fragment_max * MAX_FRAGMENT_COUNT,
            });
        }
        self.stats.packets_sent += 1;

        if payload.len() <= single_max {
            match mode {
                SendMode::Reliable => {
                    let ch = &mut self.channels[channel as usize];
                    let seq = ch.assign_seq();
                    ch.unsent.push_back(Command::SendReliable {
                        channel,
                        seq,
                        payload,
                    });
                }
                SendMode::Unreliable => self.unreliable_unsent.push_back(Command::SendUnreliable {
                    channel,
                    payload,
                }),
                SendMode::Unsequenced => self
                    .unreliable_unsent
                    .push_back(Command::SendUnsequenced { channel, payload }),
            }
            return Ok(());
        }

        // Fragment. Unsequenced degrades to unreliable fragments; without a
        // group ordering there is nothing unsequenced left to preserve.
        let chunks = fragment::split(&payload, fragment_max);
        let count = chunks.len() as u16;
        let ch = &mut self.channels[channel as usize];
        let group = ch.assign_group();
        trace!(channel, group = group.value(), count, "fragmenting packet");
        for (index, chunk) in chunks.into_iter().enumerate() {
            let seq = matches!(mode, SendMode::Reliable).then(|| ch.assign_seq());
            let cmd = Command::SendFragment {
                channel,
                seq,
                group,
                index: index as u16,
                count,
                payload: chunk,
            };
            match mode {
                SendMode::Reliable => ch.unsent.push_back(cmd),
                _ => self.unreliable_unsent.push_back(cmd),
            }
        }
        Ok(())
    }

    // ─── Teardown API ───────────────────────────────────────────────────

    /// Begin a graceful disconnect. Queued reliable data is abandoned; use
    /// [`Peer::disconnect_later`] to drain first.
    pub(crate) fn disconnect(&mut self, data: u32, now: Instant) {
        if !self.is_established() && self.state != PeerState::Connecting {
            return;
        }
        self.begin_disconnect(data, now);
    }

    /// Disconnect once every queued and unacknowledged reliable command has
    /// been delivered.
    pub(crate) fn disconnect_later(&mut self, data: u32) {
        if self.is_established() {
            self.disconnect_data = data;
            self.state = PeerState::DisconnectLater;
        }
    }

    /// One best-effort `Disconnect` datagram then immediate teardown. The
    /// caller sends the returned datagram; nothing is retransmitted.
    pub(crate) fn disconnect_now(&mut self, data: u32, now: Instant) -> Option<BytesMut> {
        self.disconnect_data = data;
        let farewell = if self.is_established() {
            self.outgoing.push_back(Command::Disconnect { data });
            self.build_datagram(now)
        } else {
            None
        };
        self.state = PeerState::Zombie;
        farewell
    }

    /// Immediate teardown with no notification datagram.
    pub(crate) fn reset(&mut self) {
        self.state = PeerState::Zombie;
        self.congestion.clear_in_flight();
    }

    fn begin_disconnect(&mut self, data: u32, now: Instant) {
        debug!(peer = self.local_id, "disconnecting");
        self.disconnect_data = data;
        self.state = PeerState::Disconnecting;
        self.control_resend = Some(ControlResend::new(
            Command::Disconnect { data },
            self.config.retry_limit,
            self.rtt.rto(self.config.rto_min, self.config.rto_max),
            now,
        ));
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    /// Called for every datagram routed to this peer, before its commands.
    /// `authenticated` means the header carried our id and session.
    pub(crate) fn on_datagram(&mut self, authenticated: bool, now: Instant) -> Option<Signal> {
        self.last_receive = now;
        self.stats.datagrams_received += 1;
        if authenticated && self.state == PeerState::AcknowledgingConnect {
            // The remote can only address us correctly after VerifyConnect
            // arrived, so this datagram is the handshake confirmation.
            debug!(peer = self.local_id, "handshake confirmed");
            self.control_resend = None;
            self.state = PeerState::ConnectionPending;
            return Some(Signal::Established);
        }
        None
    }

    /// Apply one ack record against the addressed channel.
    pub(crate) fn process_ack(&mut self, record: &AckRecord, now: Instant) {
        let outcome = match self.channel_mut(record.channel) {
            Some(ch) => ch.process_ack(record, now),
            None => return,
        };
        if outcome.acked_count == 0 {
            return;
        }
        self.congestion.on_ack(outcome.acked_bytes);
        if let Some(sample) = outcome.rtt_sample {
            self.rtt.on_sample(sample);
            self.stats.srtt_us = self.rtt.srtt().unwrap_or(Duration::ZERO).as_micros() as u64;
        }
    }

    /// Dispatch one decoded command. Returns signals for the host's event
    /// queue.
    pub(crate) fn handle_command(&mut self, command: Command, now: Instant) -> Vec<Signal> {
        if self.state == PeerState::Zombie {
            return Vec::new();
        }
        match command {
            Command::Connect { .. } => {
                // Duplicate of the Connect that created this slot; the
                // scheduled VerifyConnect resend answers it.
                Vec::new()
            }
            Command::VerifyConnect {
                peer_id,
                session_id,
                channel_count,
                mtu,
            } => self.on_verify_connect(peer_id, session_id, channel_count, mtu, now),
            Command::Disconnect { data } => self.on_remote_disconnect(data),
            Command::DisconnectAck => self.on_disconnect_ack(),
            Command::Ping { seq } => {
                if self.is_established() {
                    self.control.receive(seq, ChannelItem::Ping);
                }
                Vec::new()
            }
            Command::Ack(record) => {
                self.process_ack(&record, now);
                Vec::new()
            }
            Command::SendReliable {
                channel,
                seq,
                payload,
            } => self.on_sequenced(channel, seq, ChannelItem::Packet(payload), now),
            Command::SendUnreliable { channel, payload } => self.on_unsequenced(channel, payload),
            Command::SendUnsequenced { channel, payload } => self.on_unsequenced(channel, payload),
            Command::SendFragment {
                channel,
                seq,
                group,
                index,
                count,
                payload,
            } => match seq {
                Some(seq) => self.on_sequenced(
                    channel,
                    seq,
                    ChannelItem::Fragment {
                        group: group.value(),
                        index,
                        count,
                        payload,
                    },
                    now,
                ),
                None => {
                    if !(self.is_established() && channel < self.channel_count) {
                        return Vec::new();
                    }
                    self.assembler
                        .insert(channel, group.value(), index, count, false, payload, now)
                        .map(|whole| self.deliver(channel, whole))
                        .into_iter()
                        .collect()
                }
            },
        }
    }

    fn on_verify_connect(
        &mut self,
        peer_id: u16,
        session_id: u32,
        channel_count: u8,
        mtu: u16,
        now: Instant,
    ) -> Vec<Signal> {
        if self.state != PeerState::Connecting {
            return Vec::new();
        }
        debug!(peer = self.local_id, remote = peer_id, "connection verified");
        self.remote_id = peer_id;
        self.remote_session = session_id;
        self.negotiate(channel_count, mtu);
        self.control_resend = None;
        self.state = PeerState::ConnectionSucceeded;
        // An immediate ping gives the responder the authenticated datagram
        // it is waiting on, and seeds the RTT estimate.
        self.queue_ping(now);
        vec![Signal::Established]
    }

    fn on_remote_disconnect(&mut self, data: u32) -> Vec<Signal> {
        if !self.is_established() && self.state != PeerState::Disconnecting {
            return Vec::new();
        }
        debug!(peer = self.local_id, "remote disconnected");
        // A simultaneous close still completes our own disconnect.
        let reason = if self.state == PeerState::Disconnecting {
            DisconnectReason::Graceful
        } else {
            DisconnectReason::Remote
        };
        self.outgoing.push_back(Command::DisconnectAck);
        self.control_resend = None;
        self.state = PeerState::AcknowledgingDisconnect;
        vec![Signal::Disconnected { reason, data }]
    }

    fn on_disconnect_ack(&mut self) -> Vec<Signal> {
        if self.state != PeerState::Disconnecting {
            return Vec::new();
        }
        self.control_resend = None;
        self.state = PeerState::Zombie;
        vec![Signal::Disconnected {
            reason: DisconnectReason::Graceful,
            data: self.disconnect_data,
        }]
    }

    fn on_sequenced(
        &mut self,
        channel: u8,
        seq: VarInt,
        item: ChannelItem,
        now: Instant,
    ) -> Vec<Signal> {
        if !self.is_established() || channel >= self.channel_count {
            return Vec::new();
        }
        let ch = &mut self.channels[channel as usize];
        if ch.is_duplicate(seq) {
            self.stats.duplicates += 1;
        }
        let run = ch.receive(seq, item);
        let mut signals = Vec::new();
        for item in run {
            match item {
                ChannelItem::Packet(payload) => signals.push(self.deliver(channel, payload)),
                ChannelItem::Fragment {
                    group,
                    index,
                    count,
                    payload,
                } => {
                    if let Some(whole) =
                        self.assembler.insert(channel, group, index, count, true, payload, now)
                    {
                        signals.push(self.deliver(channel, whole));
                    }
                }
                ChannelItem::Ping => {}
            }
        }
        signals
    }

    fn on_unsequenced(&mut self, channel: u8, payload: Bytes) -> Vec<Signal> {
        if !self.is_established() || channel >= self.channel_count {
            return Vec::new();
        }
        vec![self.deliver(channel, payload)]
    }

    fn deliver(&mut self, channel: u8, payload: Bytes) -> Signal {
        self.stats.packets_received += 1;
        Signal::Delivered { channel, payload }
    }

    fn channel_mut(&mut self, id: u8) -> Option<&mut Channel> {
        if id == CONTROL_CHANNEL {
            Some(&mut self.control)
        } else {
            self.channels.get_mut(id as usize)
        }
    }

    // ─── Clock Tick ─────────────────────────────────────────────────────

    /// Advance timers: handshake and teardown resends, reliable
    /// retransmission scans, keepalive pings, fragment expiry, inactivity.
    pub(crate) fn tick(&mut self, now: Instant) -> Vec<Signal> {
        if self.state == PeerState::Zombie {
            return Vec::new();
        }
        let mut signals = Vec::new();

        // Inactivity cuts every live state except Connecting, whose own
        // retry budget governs it.
        if self.state != PeerState::Connecting
            && now.duration_since(self.last_receive) >= self.config.inactivity_timeout
        {
            // A half-open responder was never surfaced to the application,
            // so its slot is reclaimed without a disconnect event.
            if self.state == PeerState::AcknowledgingConnect {
                debug!(peer = self.local_id, "half-open peer expired");
                self.state = PeerState::Zombie;
                return vec![Signal::Expired];
            }
            warn!(peer = self.local_id, "peer inactive, forcing disconnect");
            self.state = PeerState::Zombie;
            return vec![Signal::Disconnected {
                reason: DisconnectReason::TimedOut,
                data: 0,
            }];
        }

        if let Some(resend) = &mut self.control_resend {
            if let Some(command) = resend.poll(now) {
                self.outgoing.push_back(command);
            } else if resend.is_exhausted() {
                self.control_resend = None;
                return vec![self.control_exhausted()];
            }
        }

        if self.is_established() || self.state == PeerState::Disconnecting {
            signals.extend(self.scan_retransmits(now));
            self.tick_ping(now);
            self.stats.fragments_abandoned += self.assembler.expire(now) as u64;
        }

        // DisconnectLater completes once no data channel has anything queued
        // or in flight. Keepalive pings on the control channel do not count.
        if self.state == PeerState::DisconnectLater
            && self.unreliable_unsent.is_empty()
            && self.channels.iter().all(Channel::is_idle)
        {
            let data = self.disconnect_data;
            self.begin_disconnect(data, now);
        }

        signals
    }

    fn control_exhausted(&mut self) -> Signal {
        match self.state {
            PeerState::Connecting => {
                debug!(peer = self.local_id, "connect retries exhausted");
                self.state = PeerState::Zombie;
                Signal::Disconnected {
                    reason: DisconnectReason::ConnectFailed,
                    data: 0,
                }
            }
            PeerState::AcknowledgingConnect => {
                debug!(peer = self.local_id, "handshake never confirmed");
                self.state = PeerState::Zombie;
                Signal::Expired
            }
            _ => {
                // Disconnect resends ran out; finish the teardown anyway.
                self.state = PeerState::Zombie;
                Signal::Disconnected {
                    reason: DisconnectReason::TimedOut,
                    data: self.disconnect_data,
                }
            }
        }
    }

    fn scan_retransmits(&mut self, now: Instant) -> Vec<Signal> {
        let rto = self.rtt.rto(self.config.rto_min, self.config.rto_max);
        let retry_limit = self.config.retry_limit as u32;
        let mut lost = false;
        for ch in self.channels.iter_mut().chain(std::iter::once(&mut self.control)) {
            let scan = ch.due_retransmits(now, rto, self.config.rto_max, retry_limit);
            if scan.exhausted {
                warn!(peer = self.local_id, channel = ch.id(), "retransmission exhausted");
                self.state = PeerState::Zombie;
                return vec![Signal::Disconnected {
                    reason: DisconnectReason::TimedOut,
                    data: 0,
                }];
            }
            if !scan.commands.is_empty() {
                lost = true;
                self.stats.retransmits += scan.commands.len() as u64;
                self.retransmit_queue.extend(scan.commands);
            }
        }
        if lost {
            let rtt = self.rtt.srtt().unwrap_or(rto);
            self.congestion.on_loss(now, rtt);
        }
        Vec::new()
    }

    fn tick_ping(&mut self, now: Instant) {
        if !self.is_established() {
            return;
        }
        if now.duration_since(self.last_ping) >= self.config.ping_interval {
            self.queue_ping(now);
        }
    }

    fn queue_ping(&mut self, now: Instant) {
        self.last_ping = now;
        let seq = self.control.assign_seq();
        self.control.unsent.push_back(Command::Ping { seq });
    }

    // ─── Outbound ───────────────────────────────────────────────────────

    /// Build the next datagram for this peer, or `None` when nothing is
    /// pending. Reliable data respects the congestion window; channels are
    /// drained round-robin so one backlogged channel cannot starve the rest.
    pub(crate) fn build_datagram(&mut self, now: Instant) -> Option<BytesMut> {
        let mut acks = self.collect_acks();
        let header = DatagramHeader {
            peer_id: self.remote_id,
            session_id: self.remote_session,
            ack: acks.pop(),
            compressed: false,
        };
        let mut budget = self.mtu - header.encoded_len();
        let mut commands: Vec<Command> = Vec::new();

        for record in acks {
            let cmd = Command::Ack(record);
            let size = cmd.encoded_len();
            if size > budget {
                // No room left; the channel will emit a fresh record in the
                // next datagram instead.
                if let Some(ch) = self.channel_mut(record.channel) {
                    ch.rearm_ack();
                }
                continue;
            }
            budget -= size;
            commands.push(cmd);
        }

        Self::drain_queue(&mut self.retransmit_queue, &mut commands, &mut budget);
        Self::drain_queue(&mut self.outgoing, &mut commands, &mut budget);

        // Round-robin over data channels plus the control channel's pings.
        if self.is_established() || self.state == PeerState::Disconnecting {
            let rto = self.rtt.rto(self.config.rto_min, self.config.rto_max);
            let lanes = self.channels.len() + 1;
            for offset in 0..lanes {
                let lane = (self.flush_cursor + offset) % lanes;
                let (congestion, ch) = if lane == self.channels.len() {
                    (&mut self.congestion, &mut self.control)
                } else {
                    (&mut self.congestion, &mut self.channels[lane])
                };
                loop {
                    let Some(front) = ch.unsent.front() else { break };
                    let size = front.encoded_len();
                    let bytes = payload_len(front);
                    if size > budget || !congestion.can_send(bytes) {
                        break;
                    }
                    let Some(cmd) = ch.unsent.pop_front() else { break };
                    if let Some(seq) = reliable_seq(&cmd) {
                        ch.on_sent(seq, cmd.clone(), bytes, now, rto);
                        congestion.on_transmit(bytes);
                    }
                    budget -= size;
                    commands.push(cmd);
                }
            }
            self.flush_cursor = (self.flush_cursor + 1) % lanes;

            Self::drain_queue(&mut self.unreliable_unsent, &mut commands, &mut budget);
        }

        if commands.is_empty() && header.ack.is_none() {
            return None;
        }
        let mut buf = BytesMut::with_capacity(self.mtu);
        header.encode(&mut buf);
        for cmd in &commands {
            cmd.encode(&mut buf);
        }
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        Some(buf)
    }

    fn drain_queue(queue: &mut VecDeque<Command>, commands: &mut Vec<Command>, budget: &mut usize) {
        while let Some(front) = queue.front() {
            let size = front.encoded_len();
            if size > *budget {
                break;
            }
            *budget -= size;
            if let Some(cmd) = queue.pop_front() {
                commands.push(cmd);
            }
        }
    }

    fn collect_acks(&mut self) -> Vec<AckRecord> {
        let mut acks = Vec::new();
        if let Some(record) = self.control.take_ack() {
            acks.push(record);
        }
        for ch in &mut self.channels {
            if let Some(record) = ch.take_ack() {
                acks.push(record);
            }
        }
        acks
    }
}

/// Payload bytes a command charges against the congestion window.
fn payload_len(cmd: &Command) -> usize {
    match cmd {
        Command::SendReliable { payload, .. }
        | Command::SendUnreliable { payload, .. }
        | Command::SendUnsequenced { payload, .. }
        | Command::SendFragment { payload, .. } => payload.len(),
        _ => 0,
    }
}

/// Sequence slot a command occupies in its channel's resend ledger, if any.
fn reliable_seq(cmd: &Command) -> Option<VarInt> {
    match cmd {
        Command::SendReliable { seq, .. } => Some(*seq),
        Command::SendFragment { seq, .. } => *seq,
        Command::Ping { seq } => Some(*seq),
        _ => None,
    }
}
