//! # Wire Format
//!
//! One UDP datagram carries a fixed header followed by a compound run of
//! commands, packed up to the MTU.
//!
//! ## Datagram Header (7 bytes + optional 10-18 byte ack block)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=1|A|Z| rsvd  |           Peer Id (16)        |  Session Id   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Session Id (cont., 32 total)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  [A] Channel  |  [A] Cumulative Seq (VarInt)  |  [A] Bitmap.. |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `A` marks an inline ack block for the most recently active channel; `Z`
//! marks a compressed command region. Commands follow, each self-describing
//! its type and length. A decoder that hits anything malformed drops the
//! whole datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::PROTOCOL_VERSION;

// ─── VarInt (QUIC-style, RFC 9000 §16) ──────────────────────────────────────

/// A 62-bit variable-length integer encoded in 1, 2, 4, or 8 bytes by a
/// two-bit length prefix. Used for sequence numbers and fragment group ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    /// Maximum representable value: 2^62 - 1.
    pub const MAX: u64 = (1 << 62) - 1;

    /// Create a VarInt, returning `None` if the value exceeds 62 bits.
    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        (val <= Self::MAX).then_some(VarInt(val))
    }

    /// Create a VarInt from a u64, panicking if out of range. Sequence
    /// counters in this crate never reach 2^62.
    #[inline]
    pub fn from_u64(val: u64) -> Self {
        Self::new(val).expect("VarInt value exceeds 62-bit limit")
    }

    /// The underlying value.
    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to.
    #[inline]
    pub fn encoded_len(self) -> usize {
        match self.0 {
            0..=0x3F => 1,
            0x40..=0x3FFF => 2,
            0x4000..=0x3FFF_FFFF => 4,
            _ => 8,
        }
    }

    /// Encode into a buffer.
    pub fn encode(self, buf: &mut impl BufMut) {
        match self.encoded_len() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(0x4000 | self.0 as u16),
            4 => buf.put_u32(0x8000_0000 | self.0 as u32),
            _ => buf.put_u64(0xC000_0000_0000_0000 | self.0),
        }
    }

    /// Decode from a buffer. `None` if the buffer is too short.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);
        if buf.remaining() < len {
            return None;
        }
        let val = match len {
            1 => {
                buf.advance(1);
                (first & 0x3F) as u64
            }
            2 => (buf.get_u16() & 0x3FFF) as u64,
            4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
            _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
        };
        Some(VarInt(val))
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─── Ack Record ─────────────────────────────────────────────────────────────

/// Compacted acknowledgment for one channel: cumulative sequence plus a
/// 64-bit selective bitmap. Bit `i` acknowledges `cumulative + 1 + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRecord {
    /// Channel id, or [`CONTROL_CHANNEL`](crate::CONTROL_CHANNEL) for pings.
    pub channel: u8,
    /// Highest contiguously received sequence on the channel.
    pub cumulative: VarInt,
    /// Bitmap of received sequences beyond `cumulative`.
    pub bitmap: u64,
}

impl AckRecord {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.channel);
        self.cumulative.encode(buf);
        buf.put_u64(self.bitmap);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let channel = buf.get_u8();
        let cumulative = VarInt::decode(buf)?;
        if buf.remaining() < 8 {
            return None;
        }
        Some(AckRecord {
            channel,
            cumulative,
            bitmap: buf.get_u64(),
        })
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.cumulative.encoded_len() + 8
    }

    /// Iterate the sequences acknowledged by the selective bitmap.
    pub fn selective_sequences(&self) -> impl Iterator<Item = u64> + '_ {
        let base = self.cumulative.value();
        (0..64u64).filter_map(move |i| (self.bitmap & (1 << i) != 0).then_some(base + 1 + i))
    }

    /// Whether `seq` is acknowledged by this record.
    pub fn covers(&self, seq: u64) -> bool {
        let cum = self.cumulative.value();
        if seq <= cum {
            return true;
        }
        let offset = seq - cum - 1;
        offset < 64 && self.bitmap & (1 << offset) != 0
    }
}

// ─── Datagram Header ────────────────────────────────────────────────────────

const FLAG_ACK: u8 = 0b0010_0000;
const FLAG_COMPRESSED: u8 = 0b0001_0000;

/// Decoded datagram header, present on every weft datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Receiver's peer-table slot, or [`PEER_ID_NONE`](crate::PEER_ID_NONE)
    /// before the handshake has assigned one.
    pub peer_id: u16,
    /// Receiver's session id, or 0 before assignment. Mismatches against the
    /// live peer table cause the datagram to be dropped.
    pub session_id: u32,
    /// Inline ack for the most recently active channel, if any.
    pub ack: Option<AckRecord>,
    /// Whether the command region is compressed.
    pub compressed: bool,
}

impl DatagramHeader {
    /// Fixed portion: flags + peer id + session id.
    pub const BASE_SIZE: usize = 1 + 2 + 4;

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = (PROTOCOL_VERSION & 0x03) << 6;
        if self.ack.is_some() {
            flags |= FLAG_ACK;
        }
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        buf.put_u8(flags);
        buf.put_u16(self.peer_id);
        buf.put_u32(self.session_id);
        if let Some(ack) = &self.ack {
            ack.encode(buf);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::BASE_SIZE {
            return None;
        }
        let flags = buf.get_u8();
        if (flags >> 6) & 0x03 != PROTOCOL_VERSION {
            return None;
        }
        let peer_id = buf.get_u16();
        let session_id = buf.get_u32();
        let ack = if flags & FLAG_ACK != 0 {
            Some(AckRecord::decode(buf)?)
        } else {
            None
        };
        Some(DatagramHeader {
            peer_id,
            session_id,
            ack,
            compressed: flags & FLAG_COMPRESSED != 0,
        })
    }

    pub fn encoded_len(&self) -> usize {
        Self::BASE_SIZE + self.ack.as_ref().map_or(0, |a| a.encoded_len())
    }
}

/// Length of the encoded header at the start of `buf`, if one parses.
pub fn header_len(buf: &[u8]) -> Option<usize> {
    let mut cursor = buf;
    let before = cursor.remaining();
    DatagramHeader::decode(&mut cursor)?;
    Some(before - cursor.remaining())
}

/// Set the compressed flag on an already-encoded datagram. Used after the
/// command region has been swapped for its compressed form.
pub fn mark_compressed(buf: &mut [u8]) {
    if let Some(flags) = buf.first_mut() {
        *flags |= FLAG_COMPRESSED;
    }
}

// ─── Command Tags ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum CommandTag {
    Connect = 0x01,
    VerifyConnect = 0x02,
    Disconnect = 0x03,
    DisconnectAck = 0x04,
    Ping = 0x05,
    Ack = 0x06,
    SendReliable = 0x07,
    SendUnreliable = 0x08,
    SendUnsequenced = 0x09,
    SendFragment = 0x0A,
}

impl CommandTag {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(CommandTag::Connect),
            0x02 => Some(CommandTag::VerifyConnect),
            0x03 => Some(CommandTag::Disconnect),
            0x04 => Some(CommandTag::DisconnectAck),
            0x05 => Some(CommandTag::Ping),
            0x06 => Some(CommandTag::Ack),
            0x07 => Some(CommandTag::SendReliable),
            0x08 => Some(CommandTag::SendUnreliable),
            0x09 => Some(CommandTag::SendUnsequenced),
            0x0A => Some(CommandTag::SendFragment),
            _ => None,
        }
    }
}

const FRAGMENT_FLAG_RELIABLE: u8 = 0b0000_0001;

// ─── Commands ───────────────────────────────────────────────────────────────

/// One wire-level command. A datagram compounds any number of these after
/// its header, up to the MTU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Handshake open. `peer_id`/`session_id` identify the *initiator's* side
    /// so the responder can address return traffic.
    Connect {
        peer_id: u16,
        session_id: u32,
        channel_count: u8,
        mtu: u16,
        user_data: u32,
    },
    /// Handshake reply. Carries the responder's ids and the negotiated
    /// (pairwise-minimum) channel count and MTU.
    VerifyConnect {
        peer_id: u16,
        session_id: u32,
        channel_count: u8,
        mtu: u16,
    },
    /// Graceful teardown request.
    Disconnect { data: u32 },
    /// Teardown acknowledgment.
    DisconnectAck,
    /// Keepalive and RTT probe; acked on the control channel's sequence space.
    Ping { seq: VarInt },
    /// Standalone ack for one channel (the header ack covers only one).
    Ack(AckRecord),
    /// Reliable payload with a per-channel sequence number.
    SendReliable {
        channel: u8,
        seq: VarInt,
        payload: Bytes,
    },
    /// Best-effort payload; never retransmitted.
    SendUnreliable { channel: u8, payload: Bytes },
    /// Best-effort payload, no sequencing or dedup at all.
    SendUnsequenced { channel: u8, payload: Bytes },
    /// One fragment of an oversized packet.
    SendFragment {
        channel: u8,
        /// Reliable sequence slot; `None` for unreliable fragments.
        seq: Option<VarInt>,
        group: VarInt,
        index: u16,
        count: u16,
        payload: Bytes,
    },
}

impl Command {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Command::Connect {
                peer_id,
                session_id,
                channel_count,
                mtu,
                user_data,
            } => {
                buf.put_u8(CommandTag::Connect as u8);
                buf.put_u16(*peer_id);
                buf.put_u32(*session_id);
                buf.put_u8(*channel_count);
                buf.put_u16(*mtu);
                buf.put_u32(*user_data);
            }
            Command::VerifyConnect {
                peer_id,
                session_id,
                channel_count,
                mtu,
            } => {
                buf.put_u8(CommandTag::VerifyConnect as u8);
                buf.put_u16(*peer_id);
                buf.put_u32(*session_id);
                buf.put_u8(*channel_count);
                buf.put_u16(*mtu);
            }
            Command::Disconnect { data } => {
                buf.put_u8(CommandTag::Disconnect as u8);
                buf.put_u32(*data);
            }
            Command::DisconnectAck => {
                buf.put_u8(CommandTag::DisconnectAck as u8);
            }
            Command::Ping { seq } => {
                buf.put_u8(CommandTag::Ping as u8);
                seq.encode(buf);
            }
            Command::Ack(record) => {
                buf.put_u8(CommandTag::Ack as u8);
                record.encode(buf);
            }
            Command::SendReliable {
                channel,
                seq,
                payload,
            } => {
                buf.put_u8(CommandTag::SendReliable as u8);
                buf.put_u8(*channel);
                seq.encode(buf);
                buf.put_u16(payload.len() as u16);
                buf.extend_from_slice(payload);
            }
            Command::SendUnreliable { channel, payload } => {
                buf.put_u8(CommandTag::SendUnreliable as u8);
                buf.put_u8(*channel);
                buf.put_u16(payload.len() as u16);
                buf.extend_from_slice(payload);
            }
            Command::SendUnsequenced { channel, payload } => {
                buf.put_u8(CommandTag::SendUnsequenced as u8);
                buf.put_u8(*channel);
                buf.put_u16(payload.len() as u16);
                buf.extend_from_slice(payload);
            }
            Command::SendFragment {
                channel,
                seq,
                group,
                index,
                count,
                payload,
            } => {
                buf.put_u8(CommandTag::SendFragment as u8);
                buf.put_u8(*channel);
                buf.put_u8(if seq.is_some() { FRAGMENT_FLAG_RELIABLE } else { 0 });
                group.encode(buf);
                buf.put_u16(*index);
                buf.put_u16(*count);
                if let Some(seq) = seq {
                    seq.encode(buf);
                }
                buf.put_u16(payload.len() as u16);
                buf.extend_from_slice(payload);
            }
        }
    }

    /// Decode one command from a `Bytes` cursor. Payload-bearing commands
    /// slice the source buffer without copying. `None` on any truncation or
    /// unknown tag; the caller drops the rest of the datagram.
    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let tag = CommandTag::from_byte(buf.get_u8())?;
        match tag {
            CommandTag::Connect => {
                if buf.remaining() < 2 + 4 + 1 + 2 + 4 {
                    return None;
                }
                Some(Command::Connect {
                    peer_id: buf.get_u16(),
                    session_id: buf.get_u32(),
                    channel_count: buf.get_u8(),
                    mtu: buf.get_u16(),
                    user_data: buf.get_u32(),
                })
            }
            CommandTag::VerifyConnect => {
                if buf.remaining() < 2 + 4 + 1 + 2 {
                    return None;
                }
                Some(Command::VerifyConnect {
                    peer_id: buf.get_u16(),
                    session_id: buf.get_u32(),
                    channel_count: buf.get_u8(),
                    mtu: buf.get_u16(),
                })
            }
            CommandTag::Disconnect => {
                if buf.remaining() < 4 {
                    return None;
                }
                Some(Command::Disconnect {
                    data: buf.get_u32(),
                })
            }
            CommandTag::DisconnectAck => Some(Command::DisconnectAck),
            CommandTag::Ping => Some(Command::Ping {
                seq: VarInt::decode(buf)?,
            }),
            CommandTag::Ack => Some(Command::Ack(AckRecord::decode(buf)?)),
            CommandTag::SendReliable => {
                if !buf.has_remaining() {
                    return None;
                }
                let channel = buf.get_u8();
                let seq = VarInt::decode(buf)?;
                let payload = take_payload(buf)?;
                Some(Command::SendReliable {
                    channel,
                    seq,
                    payload,
                })
            }
            CommandTag::SendUnreliable => {
                if !buf.has_remaining() {
                    return None;
                }
                let channel = buf.get_u8();
                let payload = take_payload(buf)?;
                Some(Command::SendUnreliable { channel, payload })
            }
            CommandTag::SendUnsequenced => {
                if !buf.has_remaining() {
                    return None;
                }
                let channel = buf.get_u8();
                let payload = take_payload(buf)?;
                Some(Command::SendUnsequenced { channel, payload })
            }
            CommandTag::SendFragment => {
                if buf.remaining() < 2 {
                    return None;
                }
                let channel = buf.get_u8();
                let flags = buf.get_u8();
                let group = VarInt::decode(buf)?;
                if buf.remaining() < 4 {
                    return None;
                }
                let index = buf.get_u16();
                let count = buf.get_u16();
                let seq = if flags & FRAGMENT_FLAG_RELIABLE != 0 {
                    Some(VarInt::decode(buf)?)
                } else {
                    None
                };
                let payload = take_payload(buf)?;
                Some(Command::SendFragment {
                    channel,
                    seq,
                    group,
                    index,
                    count,
                    payload,
                })
            }
        }
    }

    /// Encoded size, for packing commands against the MTU.
    pub fn encoded_len(&self) -> usize {
        match self {
            Command::Connect { .. } => 1 + 2 + 4 + 1 + 2 + 4,
            Command::VerifyConnect { .. } => 1 + 2 + 4 + 1 + 2,
            Command::Disconnect { .. } => 1 + 4,
            Command::DisconnectAck => 1,
            Command::Ping { seq } => 1 + seq.encoded_len(),
            Command::Ack(record) => 1 + record.encoded_len(),
            Command::SendReliable { seq, payload, .. } => {
                1 + 1 + seq.encoded_len() + 2 + payload.len()
            }
            Command::SendUnreliable { payload, .. } | Command::SendUnsequenced { payload, .. } => {
                1 + 1 + 2 + payload.len()
            }
            Command::SendFragment {
                seq,
                group,
                payload,
                ..
            } => {
                1 + 1
                    + 1
                    + group.encoded_len()
                    + 4
                    + seq.map_or(0, |s| s.encoded_len())
                    + 2
                    + payload.len()
            }
        }
    }

    /// Channel the command addresses, if it addresses one.
    pub fn channel(&self) -> Option<u8> {
        match self {
            Command::SendReliable { channel, .. }
            | Command::SendUnreliable { channel, .. }
            | Command::SendUnsequenced { channel, .. }
            | Command::SendFragment { channel, .. } => Some(*channel),
            Command::Ack(record) => Some(record.channel),
            _ => None,
        }
    }
}

/// Read a u16-length-prefixed payload as a zero-copy slice of the source.
/// The length is validated against the remaining buffer before any
/// allocation; a lying length drops the datagram.
fn take_payload(buf: &mut Bytes) -> Option<Bytes> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len))
}

// ─── Datagram ───────────────────────────────────────────────────────────────

/// A decoded compound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub header: DatagramHeader,
    pub commands: Vec<Command>,
}

impl Datagram {
    /// Serialize header and commands into one buffer.
    pub fn encode(&self) -> BytesMut {
        let size = self.header.encoded_len()
            + self.commands.iter().map(|c| c.encoded_len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(size);
        self.header.encode(&mut buf);
        for cmd in &self.commands {
            cmd.encode(&mut buf);
        }
        buf
    }

    /// Decode a complete datagram. `None` if the header is malformed or any
    /// command is truncated; the whole datagram is rejected in that case.
    /// An empty command run is valid (pure-ack datagram).
    pub fn decode(mut raw: Bytes) -> Option<Self> {
        let header = DatagramHeader::decode(&mut raw)?;
        let mut commands = Vec::new();
        while raw.has_remaining() {
            commands.push(Command::decode(&mut raw)?);
        }
        Some(Datagram { header, commands })
    }
}
