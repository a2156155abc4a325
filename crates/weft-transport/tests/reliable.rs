//! Delivery guarantees under loss, reordering and duplication, plus
//! fragmentation behavior.

mod common;

use common::{pair, payloads};
use std::time::Duration;
use weft_transport::{Event, HostConfig, Packet, SendMode};

/// Run the pair for a while, collecting server-side events.
fn run(net: &mut common::Pair, steps: usize, advance: Duration) -> Vec<Event> {
    let mut events = Vec::new();
    for _ in 0..steps {
        net.advance(advance);
        let (_, server_events) = net.step();
        events.extend(server_events);
    }
    events
}

#[test]
fn hello_server_delivered_exactly_once_despite_loss() {
    // A server listening on port 5000 with room for 32 peers, a client
    // connecting to it, and one reliable message whose first transmission
    // is lost on the wire.
    let config = HostConfig {
        max_peers: 32,
        ..Default::default()
    };
    let mut net = pair(config);
    assert_eq!(net.server_addr.port(), 5000);
    let (client_peer, _) = net.establish(0);

    net.client
        .send(
            client_peer,
            0,
            Packet::from(&b"Hello, Server!"[..]),
            SendMode::Reliable,
        )
        .unwrap();
    net.client.transport_mut().conditioner.drop_next = 1;

    let events = run(&mut net, 20, Duration::from_millis(100));
    let received = payloads(&events, 0);
    assert_eq!(received, vec![b"Hello, Server!".to_vec()]);
    let stats = net.client.peer(client_peer).unwrap().stats();
    assert!(stats.retransmits >= 1, "the lost transmission was repeated");
}

#[test]
fn reliable_packets_arrive_in_send_order_after_reordering() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    // Hold each datagram as it is flushed, then release the batch in
    // reverse order.
    net.client.transport_mut().conditioner.hold_for_reorder = true;
    for label in [b"one".as_slice(), b"two", b"three"] {
        net.client
            .send(client_peer, 0, Packet::from(label), SendMode::Reliable)
            .unwrap();
        net.client.flush().unwrap();
        net.advance(Duration::from_millis(1));
    }
    net.client.transport_mut().conditioner.hold_for_reorder = false;
    net.client.transport_mut().release_held();

    let events = run(&mut net, 10, Duration::from_millis(50));
    assert_eq!(
        payloads(&events, 0),
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
}

#[test]
fn duplicated_reliable_packet_delivered_once() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    net.client.transport_mut().conditioner.duplicate_next = 1;
    net.client
        .send(client_peer, 0, Packet::from(&b"once"[..]), SendMode::Reliable)
        .unwrap();

    let events = run(&mut net, 10, Duration::from_millis(50));
    assert_eq!(payloads(&events, 0), vec![b"once".to_vec()]);
}

#[test]
fn channels_are_independently_ordered() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    net.client
        .send(client_peer, 0, Packet::from(&b"a0"[..]), SendMode::Reliable)
        .unwrap();
    net.client
        .send(client_peer, 1, Packet::from(&b"b0"[..]), SendMode::Reliable)
        .unwrap();
    net.client
        .send(client_peer, 0, Packet::from(&b"a1"[..]), SendMode::Reliable)
        .unwrap();

    let events = run(&mut net, 6, Duration::from_millis(20));
    assert_eq!(payloads(&events, 0), vec![b"a0".to_vec(), b"a1".to_vec()]);
    assert_eq!(payloads(&events, 1), vec![b"b0".to_vec()]);
}

#[test]
fn lost_unreliable_packet_is_not_retransmitted() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    net.client.transport_mut().conditioner.drop_next = 1;
    net.client
        .send(client_peer, 0, Packet::from(&b"gone"[..]), SendMode::Unreliable)
        .unwrap();

    let events = run(&mut net, 20, Duration::from_millis(100));
    assert!(payloads(&events, 0).is_empty(), "unreliable data stays lost");
}

#[test]
fn unsequenced_accepts_transport_duplicates() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    net.client.transport_mut().conditioner.duplicate_next = 1;
    net.client
        .send(
            client_peer,
            0,
            Packet::from(&b"twice"[..]),
            SendMode::Unsequenced,
        )
        .unwrap();

    let events = run(&mut net, 6, Duration::from_millis(20));
    assert_eq!(
        payloads(&events, 0),
        vec![b"twice".to_vec(), b"twice".to_vec()]
    );
}

#[test]
fn oversized_reliable_packet_roundtrips() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    // Several MTUs worth plus a remainder, so the last fragment is short.
    let payload: Vec<u8> = (0..4_321u32).map(|i| (i % 251) as u8).collect();
    net.client
        .send(client_peer, 0, Packet::new(payload.clone()), SendMode::Reliable)
        .unwrap();

    let events = run(&mut net, 10, Duration::from_millis(50));
    assert_eq!(payloads(&events, 0), vec![payload]);
}

#[test]
fn fragment_loss_recovers_by_retransmission() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    let payload = vec![0xA5u8; 3_000];
    // Lose the first fragment's datagram; the rest arrive and wait in the
    // reorder buffer until the retransmission fills the gap.
    net.client.transport_mut().conditioner.drop_next = 1;
    net.client
        .send(client_peer, 0, Packet::new(payload.clone()), SendMode::Reliable)
        .unwrap();

    let events = run(&mut net, 20, Duration::from_millis(100));
    assert_eq!(payloads(&events, 0), vec![payload]);
}

#[test]
fn reliable_fragments_survive_assembly_timeout() {
    use weft_transport::ConnectionConfig;
    let config = HostConfig {
        connection: ConnectionConfig {
            fragment_timeout: Duration::from_millis(500),
            // A one-datagram window serializes the fragments, so the first
            // is delivered and acked before the link goes dark.
            window_initial: 1_400,
            window_min: 1_400,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut net = pair(config);
    let (client_peer, _) = net.establish(0);

    let payload = vec![0x3Cu8; 3_000];
    net.client
        .send(client_peer, 0, Packet::new(payload.clone()), SendMode::Reliable)
        .unwrap();
    let mut events = run(&mut net, 1, Duration::from_millis(50));

    // The link goes dark for several fragment timeouts with the group
    // half-assembled on the server, then heals.
    net.client.transport_mut().conditioner.drop_next = usize::MAX / 2;
    events.extend(run(&mut net, 4, Duration::from_millis(500)));
    net.client.transport_mut().conditioner.drop_next = 0;
    events.extend(run(&mut net, 30, Duration::from_millis(200)));

    assert!(
        !events.iter().any(|e| matches!(e, Event::Disconnect { .. })),
        "the connection must ride out the outage"
    );
    assert_eq!(payloads(&events, 0), vec![payload]);
}

#[test]
fn incomplete_unreliable_fragments_never_deliver_partially() {
    let mut net = pair(HostConfig::default());
    let (client_peer, _) = net.establish(0);

    net.client.transport_mut().conditioner.drop_next = 1;
    net.client
        .send(
            client_peer,
            0,
            Packet::new(vec![7u8; 3_000]),
            SendMode::Unreliable,
        )
        .unwrap();

    // Run well past the fragment timeout.
    let events = run(&mut net, 10, Duration::from_secs(1));
    assert!(payloads(&events, 0).is_empty(), "no partial packet may surface");
}

#[test]
fn window_blocked_traffic_eventually_flows() {
    use weft_transport::ConnectionConfig;
    let config = HostConfig {
        connection: ConnectionConfig {
            window_initial: 4_096,
            window_min: 4_096,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut net = pair(config);
    let (client_peer, _) = net.establish(0);

    // Far more than one window's worth, in one burst.
    let count = 40u8;
    for i in 0..count {
        net.client
            .send(client_peer, 0, Packet::new(vec![i; 1_000]), SendMode::Reliable)
            .unwrap();
    }
    let events = run(&mut net, 40, Duration::from_millis(50));
    let received = payloads(&events, 0);
    assert_eq!(received.len(), count as usize, "everything drains through the window");
    for (i, payload) in received.iter().enumerate() {
        assert_eq!(payload[0], i as u8, "order preserved under window pressure");
    }
}

#[test]
fn bandwidth_throttle_defers_but_delivers() {
    use weft_transport::Bandwidth;
    let config = HostConfig {
        outgoing_bandwidth: Bandwidth::BytesPerSec(20_000),
        ..Default::default()
    };
    let mut net = pair(config);
    let (client_peer, _) = net.establish(0);

    for i in 0..20u8 {
        net.client
            .send(client_peer, 0, Packet::new(vec![i; 1_000]), SendMode::Reliable)
            .unwrap();
    }
    let events = run(&mut net, 60, Duration::from_millis(100));
    assert_eq!(payloads(&events, 0).len(), 20);
    assert!(
        net.client.stats().throttle_deferrals > 0,
        "the burst had to wait on the rate limiter"
    );
}
