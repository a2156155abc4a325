//! Engine configuration: the shared [`Context`], host-level limits, and the
//! per-connection tunables the protocol leaves as implementation parameters.

use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::{DEFAULT_MTU, MAX_CHANNEL_COUNT, MAX_MTU, MIN_MTU, PEER_ID_NONE};

// ─── Compression Strategy ───────────────────────────────────────────────────

/// Injectable payload compression, applied to a datagram's command region.
///
/// The engine is agnostic to the algorithm. `compress` may decline (return
/// `None`) whenever compression would not help; `decompress` must never
/// produce more than `max_len` bytes. The cap bounds what a hostile
/// compressed datagram can make the receiver allocate.
pub trait Compressor {
    /// Compress `data`, or `None` to send it uncompressed.
    fn compress(&self, data: &[u8]) -> Option<Vec<u8>>;
    /// Decompress `data`, or `None` if it is invalid or exceeds `max_len`.
    fn decompress(&self, data: &[u8], max_len: usize) -> Option<Vec<u8>>;
}

/// Default strategy: never compress. Datagrams flagged as compressed are
/// dropped, since there is nothing to decompress them with.
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn decompress(&self, _data: &[u8], _max_len: usize) -> Option<Vec<u8>> {
        None
    }
}

// ─── Context ────────────────────────────────────────────────────────────────

/// Process-level collaborators, constructed once and shared by every
/// [`Host`](crate::Host). Replaces ambient global state: lifecycle is the
/// caller's, not the library's.
#[derive(Clone)]
pub struct Context {
    compressor: Rc<dyn Compressor>,
}

impl Context {
    /// Context with no compression.
    pub fn new() -> Self {
        Context {
            compressor: Rc::new(NoCompression),
        }
    }

    /// Context with an injected compression strategy.
    pub fn with_compressor(compressor: Rc<dyn Compressor>) -> Self {
        Context { compressor }
    }

    pub(crate) fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_ref()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Bandwidth ──────────────────────────────────────────────────────────────

/// A byte-rate ceiling for one direction of a host's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    /// No ceiling; the throttle never defers.
    Unlimited,
    /// Hard ceiling in bytes per second.
    BytesPerSec(u32),
}

// ─── Connection Config ──────────────────────────────────────────────────────

/// Per-connection protocol tunables. The backoff curves and retry ceilings
/// are deliberately configuration, not constants; the defaults below are what
/// ships.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// First handshake resend interval; doubles per attempt.
    pub connect_interval: Duration,
    /// Handshake (and teardown-ack) resend attempts before giving up.
    pub connect_retry_limit: u8,
    /// Retransmission attempts for a single reliable entry before the peer
    /// is forced into a timeout disconnect.
    pub retry_limit: u8,
    /// Lower clamp on the RTO derived from SRTT + 4×RTTVAR.
    pub rto_min: Duration,
    /// Upper clamp on the RTO.
    pub rto_max: Duration,
    /// Keepalive ping interval for idle connections.
    pub ping_interval: Duration,
    /// Forced disconnect after this long with no observed activity.
    pub inactivity_timeout: Duration,
    /// An unreliable fragment group with no progress for this long is
    /// discarded. Reliable groups complete under retransmission and are
    /// not subject to this timer.
    pub fragment_timeout: Duration,
    /// Out-of-order reliable packets buffered per channel. Wider than the
    /// 64-entry selective-ack bitmap: arrivals held further ahead are not
    /// selectively acknowledged, so the sender retransmits them until the
    /// cumulative point advances.
    pub reorder_capacity: usize,
    /// Concurrent fragment groups tracked per channel.
    pub assembly_capacity: usize,
    /// Initial congestion window, bytes.
    pub window_initial: u32,
    /// Floor the window never halves below.
    pub window_min: u32,
    /// Cap the window never grows beyond.
    pub window_max: u32,
    /// Additive increment applied per window's-worth of acknowledged bytes.
    pub window_increment: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_interval: Duration::from_millis(500),
            connect_retry_limit: 8,
            retry_limit: 12,
            rto_min: Duration::from_millis(100),
            rto_max: Duration::from_secs(30),
            ping_interval: Duration::from_millis(500),
            inactivity_timeout: Duration::from_secs(10),
            fragment_timeout: Duration::from_secs(3),
            reorder_capacity: 256,
            assembly_capacity: 64,
            window_initial: 16 * 1024,
            window_min: 4 * 1024,
            window_max: 1024 * 1024,
            window_increment: 1400,
        }
    }
}

// ─── Host Config ────────────────────────────────────────────────────────────

/// Configuration for one [`Host`](crate::Host).
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Peer table capacity. Inbound connects beyond it are ignored at the
    /// handshake; the initiator observes a connect timeout.
    pub max_peers: usize,
    /// Channels offered per connection; the handshake negotiates the
    /// pairwise minimum.
    pub channel_count: u8,
    /// Largest datagram this host will emit. Also negotiated down.
    pub mtu: usize,
    /// Ceiling on aggregate inbound traffic.
    pub incoming_bandwidth: Bandwidth,
    /// Ceiling on aggregate outbound traffic.
    pub outgoing_bandwidth: Bandwidth,
    /// Protocol tunables applied to every connection of this host.
    pub connection: ConnectionConfig,
}

impl HostConfig {
    /// Validate the configuration, returning it on success.
    pub fn validate(self) -> Result<Self, Error> {
        if self.max_peers == 0 || self.max_peers >= PEER_ID_NONE as usize {
            return Err(Error::InvalidConfig("max_peers out of range"));
        }
        if self.channel_count == 0 || self.channel_count as usize > MAX_CHANNEL_COUNT {
            return Err(Error::InvalidConfig("channel_count out of range"));
        }
        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(Error::InvalidConfig("mtu out of range"));
        }
        if self.connection.retry_limit == 0 || self.connection.connect_retry_limit == 0 {
            return Err(Error::InvalidConfig("retry limits must be nonzero"));
        }
        Ok(self)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            max_peers: 32,
            channel_count: 8,
            mtu: DEFAULT_MTU,
            incoming_bandwidth: Bandwidth::Unlimited,
            outgoing_bandwidth: Bandwidth::Unlimited,
            connection: ConnectionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(HostConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_channels_rejected() {
        let config = HostConfig {
            channel_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn oversized_mtu_rejected() {
        let config = HostConfig {
            mtu: MAX_MTU + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn no_compression_declines_both_ways() {
        let ctx = Context::new();
        assert!(ctx.compressor().compress(b"abc").is_none());
        assert!(ctx.compressor().decompress(b"abc", 100).is_none());
    }
}
