//! # weft-transport
//!
//! Reliable-UDP transport engine. Multiplexes ordered/unordered,
//! reliable/unreliable delivery of application packets between a bounded set
//! of remote endpoints over a single UDP socket, with multiple independent
//! logical channels per connection. TCP-like guarantees where requested,
//! without TCP's global ordering or head-of-line blocking.
//!
//! ## Crate structure
//!
//! - [`wire`]: datagram header and command serialization, VarInt
//! - [`channel`]: per-channel sequencing, retransmission, reordering
//! - [`fragment`]: fragmentation and reassembly
//! - [`peer`]: connection state machine, RTT estimation
//! - [`congestion`]: AIMD congestion window, host bandwidth throttle
//! - [`host`]: service loop, peer table, event queue
//! - [`transport`]: UDP socket seam (trait + implementations)
//! - [`config`]: context, host and connection configuration
//! - [`packet`]: application packet, send modes, disconnect reasons
//! - [`stats`]: per-peer and per-host counters
//!
//! ## Quick start
//!
//! ```no_run
//! use weft_transport::{Host, HostConfig, Event, SendMode};
//!
//! let config = HostConfig { max_peers: 32, ..Default::default() };
//! let mut server = Host::bind("127.0.0.1:5000", config).unwrap();
//!
//! loop {
//!     match server.service(std::time::Duration::from_millis(10)).unwrap() {
//!         Some(Event::Connect { peer, .. }) => println!("peer {peer:?} connected"),
//!         Some(Event::Receive { peer, channel, packet }) => {
//!             // echo back on the same channel
//!             server.send(peer, channel, packet, SendMode::Reliable).unwrap();
//!         }
//!         Some(Event::Disconnect { peer, .. }) => println!("peer {peer:?} left"),
//!         None => {}
//!     }
//! }
//! ```

pub mod channel;
pub mod config;
pub mod congestion;
pub mod error;
pub mod fragment;
pub mod host;
pub mod packet;
pub mod peer;
pub mod stats;
pub mod transport;
pub mod wire;

pub use config::{Bandwidth, Compressor, ConnectionConfig, Context, HostConfig};
pub use error::Error;
pub use host::{Event, Host, PeerId};
pub use packet::{DisconnectReason, Packet, SendMode};
pub use peer::{Peer, PeerState};
pub use transport::{Transport, UdpTransport};

/// Protocol version carried in the two high bits of every datagram.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum datagram payload before fragmentation.
pub const DEFAULT_MTU: usize = 1400;

/// Smallest MTU a peer may negotiate.
pub const MIN_MTU: usize = 576;

/// Largest MTU a peer may negotiate.
pub const MAX_MTU: usize = 4096;

/// Protocol-wide ceiling on channels per connection.
pub const MAX_CHANNEL_COUNT: usize = 64;

/// Reserved channel id used by pings and their acks.
pub const CONTROL_CHANNEL: u8 = 0xFF;

/// Wire peer id used before the remote has assigned us a slot.
pub const PEER_ID_NONE: u16 = 0xFFFF;

/// Maximum fragments one packet may split into. Bounds both the largest
/// sendable packet and the memory any reassembly can hold.
pub const MAX_FRAGMENT_COUNT: usize = 1024;
