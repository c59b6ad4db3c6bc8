//! End-to-end sessions between two hosts over loopback sockets.
//!
//! Loss is injected through the intercept callback so retransmission and
//! drop handling run against a real socket pair.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether::{
    Address, Event, Host, HostConfig, Intercept, Packet, PeerId, PeerState, FLAG_RELIABLE,
    FLAG_UNSEQUENCED,
};
use tether_test_support::LossGenerator;

fn loopback() -> Address {
    Address::new(u32::from(Ipv4Addr::LOCALHOST), 0)
}

fn server_host(peer_count: usize, channel_limit: usize) -> Host {
    Host::bind(
        Some(loopback()),
        HostConfig {
            peer_count,
            channel_limit,
            ..HostConfig::default()
        },
    )
    .unwrap()
}

fn client_host() -> Host {
    Host::bind(None, HostConfig::default()).unwrap()
}

/// Drive both hosts until `done` is satisfied or the deadline passes.
fn pump<F>(
    client: &mut Host,
    server: &mut Host,
    client_events: &mut Vec<Event>,
    server_events: &mut Vec<Event>,
    duration: Duration,
    mut done: F,
) -> bool
where
    F: FnMut(&[Event], &[Event]) -> bool,
{
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if let Some(event) = client.service(2).unwrap() {
            client_events.push(event);
        }
        while let Some(event) = client.check_events() {
            client_events.push(event);
        }
        if let Some(event) = server.service(2).unwrap() {
            server_events.push(event);
        }
        while let Some(event) = server.check_events() {
            server_events.push(event);
        }
        if done(client_events, server_events) {
            return true;
        }
    }
    false
}

/// Complete a handshake and return both sides' peer handles.
fn establish(
    client: &mut Host,
    server: &mut Host,
    channel_count: usize,
    data: u32,
) -> (PeerId, PeerId) {
    let server_address = server.address();
    let client_peer = client.connect(server_address, channel_count, data).unwrap();

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    let connected = pump(
        client,
        server,
        &mut client_events,
        &mut server_events,
        Duration::from_secs(5),
        |client_events, server_events| {
            client_events
                .iter()
                .any(|event| matches!(event, Event::Connect { .. }))
                && server_events
                    .iter()
                    .any(|event| matches!(event, Event::Connect { .. }))
        },
    );
    assert!(connected, "handshake did not complete");

    let server_peer = server_events
        .iter()
        .find_map(|event| match event {
            Event::Connect { peer, .. } => Some(*peer),
            _ => None,
        })
        .unwrap();
    (client_peer, server_peer)
}

fn receive_payloads(events: &[Event]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Receive { packet, .. } => Some(packet.data().to_vec()),
            _ => None,
        })
        .collect()
}

#[test]
fn handshake_carries_connect_data() {
    let mut server = server_host(8, 2);
    let mut client = client_host();
    let server_address = server.address();

    let client_peer = client.connect(server_address, 2, 42).unwrap();

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    let connected = pump(
        &mut client,
        &mut server,
        &mut client_events,
        &mut server_events,
        Duration::from_secs(5),
        |client_events, server_events| !client_events.is_empty() && !server_events.is_empty(),
    );
    assert!(connected, "no events within the deadline");

    match &client_events[0] {
        Event::Connect { peer, data } => {
            assert_eq!(*peer, client_peer);
            assert_eq!(*data, 0);
        }
        other => panic!("client expected a connect event, got {other:?}"),
    }
    match &server_events[0] {
        Event::Connect { data, .. } => assert_eq!(*data, 42),
        other => panic!("server expected a connect event, got {other:?}"),
    }

    assert_eq!(client.peer_state(client_peer), PeerState::Connected);
    assert_eq!(client.connected_peers(), 1);
    assert_eq!(server.connected_peers(), 1);
}

#[test]
fn reliable_delivery_survives_a_dropped_datagram() {
    let mut server = server_host(8, 1);
    let mut client = client_host();
    let (client_peer, _) = establish(&mut client, &mut server, 1, 0);

    // Eat the second datagram the server sees from here on; the first
    // transmission of "b" never arrives and must be retransmitted.
    let loss = Arc::new(Mutex::new(LossGenerator::once(2)));
    let interceptor = loss.clone();
    server.set_intercept(Some(Box::new(move |_, _| {
        if interceptor.lock().unwrap().should_drop() {
            Intercept::Consume
        } else {
            Intercept::Pass
        }
    })));

    for payload in [b"a", b"b", b"c"] {
        client
            .send(client_peer, 0, Packet::new(payload.as_slice(), FLAG_RELIABLE))
            .unwrap();
        client.flush();
    }

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    let delivered = pump(
        &mut client,
        &mut server,
        &mut client_events,
        &mut server_events,
        Duration::from_secs(10),
        |_, server_events| {
            server_events
                .iter()
                .filter(|event| matches!(event, Event::Receive { .. }))
                .count()
                >= 3
        },
    );
    assert!(delivered, "reliable messages did not all arrive");
    assert!(loss.lock().unwrap().dropped() > 0, "nothing was dropped");

    let payloads = receive_payloads(&server_events);
    assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn unreliable_delivery_is_ordered_and_deduplicated_under_loss() {
    let mut server = server_host(8, 1);
    let mut client = client_host();
    let (client_peer, _) = establish(&mut client, &mut server, 1, 0);

    let loss = Arc::new(Mutex::new(LossGenerator::random(0.2)));
    let interceptor = loss.clone();
    server.set_intercept(Some(Box::new(move |_, _| {
        if interceptor.lock().unwrap().should_drop() {
            Intercept::Consume
        } else {
            Intercept::Pass
        }
    })));

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();

    for index in 0u64..100 {
        let payload = index.to_be_bytes();
        client
            .send(client_peer, 0, Packet::new(&payload, 0))
            .unwrap();
        if index % 10 == 9 {
            pump(
                &mut client,
                &mut server,
                &mut client_events,
                &mut server_events,
                Duration::from_millis(30),
                |_, _| false,
            );
        }
    }
    pump(
        &mut client,
        &mut server,
        &mut client_events,
        &mut server_events,
        Duration::from_millis(500),
        |_, _| false,
    );

    let indexes: Vec<u64> = receive_payloads(&server_events)
        .iter()
        .map(|payload| u64::from_be_bytes(payload.as_slice().try_into().unwrap()))
        .collect();

    assert!(indexes.len() <= 100);
    assert!(!indexes.is_empty(), "every unreliable packet vanished");
    for pair in indexes.windows(2) {
        assert!(pair[0] < pair[1], "out of order or duplicated: {indexes:?}");
    }
}

#[test]
fn large_reliable_packet_fragments_and_reassembles() {
    let mut server = server_host(8, 1);
    let mut client = client_host();
    let (client_peer, _) = establish(&mut client, &mut server, 1, 0);

    let payload: Vec<u8> = (0..65_000u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 11) as u8)
        .collect();
    client
        .send(
            client_peer,
            0,
            Packet::from_vec(payload.clone(), FLAG_RELIABLE),
        )
        .unwrap();

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    let delivered = pump(
        &mut client,
        &mut server,
        &mut client_events,
        &mut server_events,
        Duration::from_secs(10),
        |_, server_events| {
            server_events
                .iter()
                .any(|event| matches!(event, Event::Receive { .. }))
        },
    );
    assert!(delivered, "fragmented packet never reassembled");

    let payloads = receive_payloads(&server_events);
    assert_eq!(payloads.len(), 1, "expected exactly one receive event");
    assert_eq!(payloads[0], payload);
}

#[test]
fn unsequenced_packets_arrive_without_duplicates() {
    let mut server = server_host(8, 1);
    let mut client = client_host();
    let (client_peer, _) = establish(&mut client, &mut server, 1, 0);

    for value in 0u8..5 {
        client
            .send(client_peer, 0, Packet::new(&[value], FLAG_UNSEQUENCED))
            .unwrap();
    }

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    pump(
        &mut client,
        &mut server,
        &mut client_events,
        &mut server_events,
        Duration::from_millis(500),
        |_, server_events| {
            server_events
                .iter()
                .filter(|event| matches!(event, Event::Receive { .. }))
                .count()
                >= 5
        },
    );

    let mut seen = receive_payloads(&server_events);
    let before_dedup = seen.len();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), before_dedup, "duplicate unsequenced delivery");
    assert!(before_dedup <= 5);
}

#[test]
fn graceful_disconnect_drains_queued_messages_first() {
    let mut server = server_host(8, 1);
    let mut client = client_host();
    let (client_peer, _) = establish(&mut client, &mut server, 1, 0);

    for index in 0u8..5 {
        client
            .send(client_peer, 0, Packet::new(&[index], FLAG_RELIABLE))
            .unwrap();
    }
    client.disconnect_later(client_peer, 7);

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    let finished = pump(
        &mut client,
        &mut server,
        &mut client_events,
        &mut server_events,
        Duration::from_secs(10),
        |client_events, server_events| {
            server_events
                .iter()
                .any(|event| matches!(event, Event::Disconnect { .. }))
                && client_events
                    .iter()
                    .any(|event| matches!(event, Event::Disconnect { .. }))
        },
    );
    assert!(finished, "disconnect never completed");

    let payloads = receive_payloads(&server_events);
    assert_eq!(
        payloads,
        (0u8..5).map(|index| vec![index]).collect::<Vec<_>>(),
        "messages queued before disconnect_later must arrive in order"
    );

    // The disconnect arrives strictly after the drained messages.
    let disconnect_position = server_events
        .iter()
        .position(|event| matches!(event, Event::Disconnect { .. }))
        .unwrap();
    let last_receive_position = server_events
        .iter()
        .rposition(|event| matches!(event, Event::Receive { .. }))
        .unwrap();
    assert!(disconnect_position > last_receive_position);

    match &server_events[disconnect_position] {
        Event::Disconnect { data, .. } => assert_eq!(*data, 7),
        _ => unreachable!(),
    }

    assert_eq!(client.peer_state(client_peer), PeerState::Disconnected);
}

#[test]
fn silent_peer_times_out_with_a_disconnect_event() {
    // Bound but never serviced: the connect attempt gets no replies.
    let server = server_host(8, 1);
    let mut client = client_host();

    let client_peer = client.connect(server.address(), 1, 0).unwrap();
    client.set_timeout(client_peer, 2, 400, 1000);

    let started = Instant::now();
    let deadline = started + Duration::from_secs(6);
    let mut disconnect = None;
    while Instant::now() < deadline {
        if let Some(event) = client.service(10).unwrap() {
            if matches!(event, Event::Disconnect { .. }) {
                disconnect = Some(event);
                break;
            }
        }
    }

    let Some(Event::Disconnect { peer, data }) = disconnect else {
        panic!("no disconnect event for a silent peer");
    };
    assert_eq!(peer, client_peer);
    assert_eq!(data, 0);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "timeout took longer than the configured maximum allows"
    );
    assert_eq!(client.peer_state(client_peer), PeerState::Disconnected);
}

#[test]
fn compressed_and_checksummed_session_delivers_payloads() {
    let mut server = server_host(8, 1);
    let mut client = client_host();
    server.compress_with_range_coder();
    server.checksum_crc32();
    client.compress_with_range_coder();
    client.checksum_crc32();

    let (client_peer, server_peer) = establish(&mut client, &mut server, 1, 5);

    let compressible: Vec<u8> = b"state update ".repeat(60).to_vec();
    client
        .send(
            client_peer,
            0,
            Packet::from_vec(compressible.clone(), FLAG_RELIABLE),
        )
        .unwrap();
    server
        .send(server_peer, 0, Packet::new(b"ack payload", FLAG_RELIABLE))
        .unwrap();

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    let delivered = pump(
        &mut client,
        &mut server,
        &mut client_events,
        &mut server_events,
        Duration::from_secs(5),
        |client_events, server_events| {
            client_events
                .iter()
                .any(|event| matches!(event, Event::Receive { .. }))
                && server_events
                    .iter()
                    .any(|event| matches!(event, Event::Receive { .. }))
        },
    );
    assert!(delivered, "payloads did not survive compression + checksum");

    assert_eq!(receive_payloads(&server_events), vec![compressible]);
    assert_eq!(
        receive_payloads(&client_events),
        vec![b"ack payload".to_vec()]
    );
}

#[test]
fn garbage_datagrams_do_not_disturb_a_checksummed_session() {
    let mut server = server_host(8, 1);
    let mut client = client_host();
    server.checksum_crc32();
    client.checksum_crc32();

    let (client_peer, _) = establish(&mut client, &mut server, 1, 0);
    let server_address = server.address().to_socket_addr();

    // Count datagrams reaching the server, garbage included.
    let arrivals = Arc::new(AtomicUsize::new(0));
    let seen = arrivals.clone();
    server.set_intercept(Some(Box::new(move |_, _| {
        seen.fetch_add(1, Ordering::Relaxed);
        Intercept::Pass
    })));

    // Raw noise: truncated junk, a fake peer-0 header with a bogus
    // checksum, and an overseen peer id. All must be dropped silently.
    let noise = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    noise.send_to(&[0x5A; 3], server_address).unwrap();
    noise
        .send_to(&[0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x06, 0x00, 0x00, 0x01], server_address)
        .unwrap();
    noise.send_to(&[0x0F, 0xFE, 0x00, 0x00], server_address).unwrap();

    client
        .send(client_peer, 0, Packet::new(b"intact", FLAG_RELIABLE))
        .unwrap();

    let mut client_events = Vec::new();
    let mut server_events = Vec::new();
    let delivered = pump(
        &mut client,
        &mut server,
        &mut client_events,
        &mut server_events,
        Duration::from_secs(5),
        |_, server_events| {
            server_events
                .iter()
                .any(|event| matches!(event, Event::Receive { .. }))
        },
    );
    assert!(delivered, "legitimate traffic was disturbed by garbage");
    assert!(arrivals.load(Ordering::Relaxed) > 1);
    assert_eq!(receive_payloads(&server_events), vec![b"intact".to_vec()]);
    assert_eq!(server.connected_peers(), 1);
}
