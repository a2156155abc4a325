//! Error types surfaced by the engine's public API.

use std::io;

/// Errors returned by [`Host`](crate::Host) operations.
///
/// Transport-level I/O failures are fatal for the host; everything else is a
/// recoverable API error that leaves engine state untouched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying socket failed on send or receive.
    #[error("transport I/O failure: {0}")]
    Io(#[from] io::Error),

    /// An invalid configuration value was supplied at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The peer table is at capacity; no outbound connection was started.
    #[error("peer table full ({capacity} slots)")]
    PeerTableFull {
        /// Configured table capacity.
        capacity: usize,
    },

    /// The peer id does not name a live peer.
    #[error("unknown peer")]
    UnknownPeer,

    /// The operation requires a connected peer.
    #[error("peer is not connected")]
    NotConnected,

    /// The channel id is outside the connection's negotiated channel count.
    #[error("channel {channel} out of range (peer has {count} channels)")]
    InvalidChannel {
        /// Requested channel id.
        channel: u8,
        /// Channels negotiated for the connection.
        count: u8,
    },

    /// The packet exceeds the largest fragmentable size for this connection.
    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge {
        /// Offending payload size.
        size: usize,
        /// Largest payload the connection can carry.
        max: usize,
    },
}
