//! Application-facing packet type and delivery modes.

use bytes::Bytes;

/// How a packet should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Delivered exactly once, in send order relative to other reliable
    /// packets on the same channel. Retransmitted until acknowledged.
    Reliable,
    /// Delivered at most once. Never retransmitted; sequenced only in the
    /// sense that it carries its channel id.
    Unreliable,
    /// Delivered as received, no sequence number at all. Network-level
    /// duplicates are passed through.
    Unsequenced,
}

/// An application payload handed to [`Host::send`](crate::Host::send) or
/// received via [`Event::Receive`](crate::Event::Receive).
///
/// Backed by [`Bytes`]: cloning is a refcount bump, and ownership moves into
/// the engine on send and back out to the caller on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
}

impl Packet {
    /// Wrap a payload. Size limits are connection-specific (they depend on
    /// the negotiated MTU) and enforced at send time.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Packet { data: data.into() }
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl From<Bytes> for Packet {
    fn from(data: Bytes) -> Self {
        Packet { data }
    }
}

impl From<&[u8]> for Packet {
    fn from(data: &[u8]) -> Self {
        Packet {
            data: Bytes::copy_from_slice(data),
        }
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Packet { data: data.into() }
    }
}

/// Why a peer reached `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local graceful disconnect completed (acknowledged or forced).
    Graceful,
    /// The remote side requested the disconnect.
    Remote,
    /// Retry budget or inactivity timeout exhausted.
    TimedOut,
    /// The connection handshake never completed.
    ConnectFailed,
}
