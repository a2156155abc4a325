//! Handshake, teardown and timeout behavior over the in-memory link.

mod common;

use common::{drain, pair};
use std::time::Duration;
use weft_transport::{
    ConnectionConfig, DisconnectReason, Error, Event, Host, HostConfig, Packet, PeerState,
    SendMode,
};

#[test]
fn handshake_completes_on_both_sides() {
    let mut net = pair(HostConfig::default());
    let client_peer = net.client.connect(net.server_addr, 0xBEEF).unwrap();
    assert_eq!(net.client.peer_state(client_peer), PeerState::Connecting);

    let mut client_connects = 0;
    let mut server_connects = 0;
    for _ in 0..10 {
        let (client_events, server_events) = net.step();
        for event in &client_events {
            if matches!(event, Event::Connect { .. }) {
                client_connects += 1;
            }
        }
        for event in &server_events {
            if let Event::Connect { data, .. } = event {
                server_connects += 1;
                assert_eq!(*data, 0xBEEF, "initiator's user data travels in the handshake");
            }
        }
    }
    assert_eq!(client_connects, 1);
    assert_eq!(server_connects, 1);
    assert_eq!(net.client.peer_state(client_peer), PeerState::Connected);
    assert_eq!(net.server.peer_count(), 1);
}

#[test]
fn no_connect_event_before_mutual_confirmation() {
    let mut net = pair(HostConfig::default());
    net.client.connect(net.server_addr, 0).unwrap();
    // Client sends Connect; server builds its peer and queues VerifyConnect,
    // but nothing may surface yet on either side.
    let (client_events, server_events) = net.step();
    assert!(client_events.is_empty());
    assert!(server_events.is_empty());
}

#[test]
fn connect_to_silent_peer_fails_with_one_event() {
    let mut net = pair(HostConfig::default());
    let peer = net.client.connect(net.server_addr, 0).unwrap();
    // Swallow everything the client transmits.
    net.client.transport_mut().conditioner.drop_next = usize::MAX / 2;

    let mut failures = Vec::new();
    for _ in 0..40 {
        net.advance(Duration::from_secs(30));
        failures.extend(drain(&mut net.client));
    }
    assert!(
        matches!(
            failures.as_slice(),
            [Event::Disconnect { reason: DisconnectReason::ConnectFailed, .. }]
        ),
        "expected exactly one ConnectFailed, got {failures:?}"
    );
    assert_eq!(net.client.peer_state(peer), PeerState::Disconnected);
    assert_eq!(net.client.peer_count(), 0);
}

#[test]
fn half_open_inbound_connect_expires_without_event() {
    let mut net = pair(HostConfig::default());
    net.client.connect(net.server_addr, 0).unwrap();
    // The Connect reaches the server, then the initiator goes dark before
    // ever confirming the handshake.
    drain(&mut net.client);
    net.client.transport_mut().conditioner.drop_next = usize::MAX / 2;

    let mut server_events = Vec::new();
    for _ in 0..10 {
        net.advance(Duration::from_secs(2));
        server_events.extend(drain(&mut net.server));
    }
    assert!(
        server_events.is_empty(),
        "a never-confirmed peer must vanish silently, got {server_events:?}"
    );
    assert_eq!(net.server.peer_count(), 0, "the half-open slot was reclaimed");
}

#[test]
fn graceful_disconnect_notifies_both_sides() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    net.client.disconnect(client_peer, 33).unwrap();
    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    for _ in 0..6 {
        let (c, s) = net.step();
        client_events.extend(c);
        server_events.extend(s);
    }
    assert!(matches!(
        client_events.as_slice(),
        [Event::Disconnect { reason: DisconnectReason::Graceful, data: 33, .. }]
    ));
    assert!(matches!(
        server_events.as_slice(),
        [Event::Disconnect { reason: DisconnectReason::Remote, data: 33, .. }]
    ));
    assert_eq!(net.client.peer_count(), 0);
    assert_eq!(net.server.peer_count(), 0);
}

#[test]
fn disconnect_later_delivers_queued_data_first() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    for i in 0..5u8 {
        net.client
            .send(client_peer, 0, Packet::new(vec![i; 64]), SendMode::Reliable)
            .unwrap();
    }
    net.client.disconnect_later(client_peer, 0).unwrap();

    let mut received = 0;
    let mut server_disconnected_after_all_data = false;
    for _ in 0..10 {
        net.advance(Duration::from_millis(50));
        let (_, server_events) = net.step();
        for event in server_events {
            match event {
                Event::Receive { .. } => received += 1,
                Event::Disconnect { .. } => {
                    server_disconnected_after_all_data = received == 5;
                }
                Event::Connect { .. } => {}
            }
        }
    }
    assert_eq!(received, 5);
    assert!(server_disconnected_after_all_data);
}

#[test]
fn inactivity_forces_exactly_one_timeout() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    // The server goes dark; only the client keeps servicing.
    let mut events = Vec::new();
    for _ in 0..8 {
        net.advance(Duration::from_secs(2));
        events.extend(drain(&mut net.client));
    }
    assert!(matches!(
        events.as_slice(),
        [Event::Disconnect { reason: DisconnectReason::TimedOut, .. }]
    ));
    assert_eq!(net.client.peer_state(client_peer), PeerState::Disconnected);
}

#[test]
fn disconnect_now_tears_down_immediately() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    net.client.disconnect_now(client_peer, 9).unwrap();
    let events = drain(&mut net.client);
    assert!(matches!(
        events.as_slice(),
        [Event::Disconnect { reason: DisconnectReason::Graceful, data: 9, .. }]
    ));
    assert_eq!(net.client.peer_count(), 0);
    // The one farewell datagram reaches the server.
    let mut server_events = Vec::new();
    for _ in 0..4 {
        server_events.extend(drain(&mut net.server));
    }
    assert!(server_events
        .iter()
        .any(|e| matches!(e, Event::Disconnect { reason: DisconnectReason::Remote, data: 9, .. })));
}

#[test]
fn connect_respects_peer_capacity() {
    let config = HostConfig {
        max_peers: 1,
        ..Default::default()
    };
    let mut net = pair(config);
    net.client.connect(net.server_addr, 0).unwrap();
    let err = net.client.connect("10.0.0.9:1".parse().unwrap(), 0);
    assert!(matches!(err, Err(Error::PeerTableFull { capacity: 1 })));
}

#[test]
fn send_on_unknown_peer_is_rejected() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);
    net.client.disconnect_now(client_peer, 0).unwrap();
    drain(&mut net.client);
    let err = net
        .client
        .send(client_peer, 0, Packet::from(&b"late"[..]), SendMode::Reliable);
    assert!(matches!(err, Err(Error::UnknownPeer)));
}

#[test]
fn retry_exhaustion_forces_disconnect() {
    let config = HostConfig {
        connection: ConnectionConfig {
            retry_limit: 3,
            rto_max: Duration::from_millis(400),
            // Keep the inactivity cutoff out of the way so the retry budget
            // is what trips.
            inactivity_timeout: Duration::from_secs(3600),
            ping_interval: Duration::from_secs(3600),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut net = pair(config);
    let (client_peer, _) = net.establish(0);

    net.client
        .send(client_peer, 0, Packet::from(&b"void"[..]), SendMode::Reliable)
        .unwrap();
    // Server stops answering; every retransmission goes unacknowledged.
    net.client.transport_mut().conditioner.drop_next = usize::MAX / 2;
    let mut events = Vec::new();
    for _ in 0..12 {
        net.advance(Duration::from_millis(500));
        events.extend(drain(&mut net.client));
    }
    assert!(matches!(
        events.as_slice(),
        [Event::Disconnect { reason: DisconnectReason::TimedOut, .. }]
    ));
}

// End-to-end sanity over real sockets; everything else runs on the
// deterministic in-memory link.
#[test]
fn udp_loopback_connect_and_echo() {
    let server_config = HostConfig::default();
    let mut server = Host::bind("127.0.0.1:0", server_config).unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Host::client(HostConfig::default()).unwrap();
    let peer = client.connect(server_addr, 0).unwrap();

    let step = Duration::from_millis(10);
    let mut echoed = None;
    for _ in 0..500 {
        if let Some(event) = client.service(step).unwrap() {
            match event {
                Event::Connect { .. } => {
                    client
                        .send(peer, 0, Packet::from(&b"marco"[..]), SendMode::Reliable)
                        .unwrap();
                }
                Event::Receive { packet, .. } => {
                    echoed = Some(packet.data().to_vec());
                    break;
                }
                Event::Disconnect { .. } => panic!("unexpected disconnect"),
            }
        }
        if let Some(event) = server.service(step).unwrap() {
            if let Event::Receive {
                peer: server_peer,
                channel,
                packet,
            } = event
            {
                server
                    .send(server_peer, channel, packet, SendMode::Reliable)
                    .unwrap();
            }
        }
    }
    assert_eq!(echoed.as_deref(), Some(&b"marco"[..]));
}
