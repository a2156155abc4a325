//! Shared harness: two hosts joined by an in-memory link, stepped on a
//! mock clock so every timer is deterministic.

use quanta::{Clock, Mock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use weft_transport::transport::MemoryTransport;
use weft_transport::{Context, Event, Host, HostConfig, PeerId};

pub struct Pair {
    pub client: Host<MemoryTransport>,
    pub server: Host<MemoryTransport>,
    pub server_addr: SocketAddr,
    mock: Arc<Mock>,
}

pub fn pair(config: HostConfig) -> Pair {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let (clock, mock) = Clock::mock();
    let client_addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
    let server_addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();
    let (client_end, server_end) = MemoryTransport::pair(client_addr, server_addr);
    let client =
        Host::with_clock(client_end, config.clone(), Context::new(), clock.clone()).unwrap();
    let server = Host::with_clock(server_end, config, Context::new(), clock).unwrap();
    Pair {
        client,
        server,
        server_addr,
        mock,
    }
}

impl Pair {
    pub fn advance(&mut self, by: Duration) {
        self.mock.increment(by);
    }

    /// One service quantum on each host, collecting whatever events fall
    /// out. Client first, then server.
    pub fn step(&mut self) -> (Vec<Event>, Vec<Event>) {
        (drain(&mut self.client), drain(&mut self.server))
    }

    /// Step both hosts until the handshake completes, returning the ids
    /// each side uses for the other.
    pub fn establish(&mut self, user_data: u32) -> (PeerId, PeerId) {
        let client_peer = self.client.connect(self.server_addr, user_data).unwrap();
        let mut server_peer = None;
        let mut client_connected = false;
        for _ in 0..10 {
            let (client_events, server_events) = self.step();
            for event in server_events {
                if let Event::Connect { peer, .. } = event {
                    server_peer = Some(peer);
                }
            }
            client_connected |= client_events
                .iter()
                .any(|e| matches!(e, Event::Connect { .. }));
            if client_connected && server_peer.is_some() {
                break;
            }
        }
        assert!(client_connected, "client never saw the Connect event");
        (client_peer, server_peer.expect("handshake did not complete"))
    }
}

pub fn drain(host: &mut Host<MemoryTransport>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = host.service(Duration::ZERO).unwrap() {
        events.push(event);
    }
    events
}

/// Collect `Receive` payloads for one channel out of an event batch.
pub fn payloads(events: &[Event], channel: u8) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Receive {
                channel: ch,
                packet,
                ..
            } if *ch == channel => Some(packet.data().to_vec()),
            _ => None,
        })
        .collect()
}
