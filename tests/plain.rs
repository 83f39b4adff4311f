mod common;

use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use common::*;
use framewire::{
    ConnectionId, ConnectionState, Incoming, Role, Transport, TransportConfig, TransportError,
    protocol::encode_frame, types,
};

fn plain_server() -> framewire::ServerSocket {
    server(Transport::Plain, TransportConfig::default())
}

#[test]
fn five_hundred_packets_arrive_intact() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);

    for _ in 0..500 {
        client.write(types::LOG_MESSAGE, MESSAGE).unwrap();
    }

    let mut origin = None;
    for _ in 0..500 {
        let pkt = expect_packet(recv(|| server.try_new_packet()));
        assert_eq!(pkt.kind(), types::LOG_MESSAGE);
        assert_eq!(pkt.length(), 41);
        assert_eq!(pkt.payload(), MESSAGE);

        let from = pkt.origin().unwrap();
        assert_eq!(*origin.get_or_insert(from), from);
        server.delete_packet(pkt);
    }

    assert_quiet(|| server.try_new_packet());
    assert_eq!(server.connection_count(), 1);
    assert!(server.connection(origin.unwrap()).is_some());
}

#[test]
fn order_is_preserved() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);

    for i in 0..2000u32 {
        client.write(types::APPLICATION_BASE, &i.to_be_bytes()).unwrap();
    }
    for i in 0..2000u32 {
        let pkt = expect_packet(recv(|| server.try_new_packet()));
        assert_eq!(pkt.payload(), i.to_be_bytes());
    }
}

#[test]
fn large_and_empty_payloads() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);
    let big: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();

    client.write(9, &big).unwrap();
    client.write(10, &[]).unwrap();

    let pkt = expect_packet(recv(|| server.try_new_packet()));
    assert_eq!(pkt.kind(), 9);
    assert_eq!(pkt.payload(), &big[..]);

    let pkt = expect_packet(recv(|| server.try_new_packet()));
    assert_eq!((pkt.kind(), pkt.length()), (10, 0));
}

#[test]
fn one_close_notice_when_peer_goes_away() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);
    client.write(7, b"hello").unwrap();
    let id = expect_packet(recv(|| server.try_new_packet()))
        .origin()
        .unwrap();

    drop(client);

    assert_eq!(expect_closed(recv(|| server.try_new_packet())), id);
    assert!(wait_for(|| server.connection_count() == 0));
    assert!(server.connection(id).is_none());
    assert_quiet(|| server.try_new_packet());
}

#[test]
fn one_close_notice_on_explicit_delete() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);
    client.write(7, b"hello").unwrap();
    let id = expect_packet(recv(|| server.try_new_packet()))
        .origin()
        .unwrap();

    assert!(server.delete_connection(id));
    assert!(!server.delete_connection(id));

    assert_eq!(expect_closed(recv(|| server.try_new_packet())), id);
    assert_quiet(|| server.try_new_packet());

    // The client notices the socket closing and tears itself down.
    assert_eq!(
        expect_closed(recv(|| client.try_new_packet())),
        ConnectionId::new(0, 0)
    );
    assert!(!client.is_active());
    assert!(matches!(
        client.write(7, b"too late"),
        Err(TransportError::Closed)
    ));
}

#[test]
fn disconnect_marker_closes_without_delivery() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);

    client.write(7, b"before").unwrap();
    client.write(types::DISCONNECTED, b"payload is dropped").unwrap();

    let pkt = expect_packet(recv(|| server.try_new_packet()));
    assert_eq!(pkt.payload(), b"before");
    assert_eq!(
        expect_closed(recv(|| server.try_new_packet())),
        pkt.origin().unwrap()
    );
    assert!(matches!(
        recv(|| client.try_new_packet()),
        Incoming::Closed(_)
    ));
}

#[test]
fn oversized_declaration_drops_connection() {
    let config = TransportConfig {
        max_payload_len: 1024,
        ..Default::default()
    };
    let server = server(Transport::Plain, config);
    let client = client(&server, Transport::Plain);

    client.write(7, &[0u8; 2048]).unwrap();

    expect_closed(recv(|| server.try_new_packet()));
    assert_quiet(|| server.try_new_packet());
    assert!(wait_for(|| server.connection_count() == 0));
    drop(client);
}

#[test]
fn delete_completes_while_the_full_queue_is_drained() {
    let config = TransportConfig {
        queue_capacity: 1,
        ..Default::default()
    };
    let server = server(Transport::Plain, config);
    let client = client(&server, Transport::Plain);
    for i in 0..3u8 {
        client.write(7, &[i]).unwrap();
    }
    let id = expect_packet(recv(|| server.try_new_packet()))
        .origin()
        .unwrap();
    // Let the reader fill the queue and block on the last frame.
    std::thread::sleep(Duration::from_millis(100));

    std::thread::scope(|s| {
        let deleter = s.spawn(|| server.delete_connection(id));

        let mut delivered = 0;
        loop {
            match recv(|| server.try_new_packet()) {
                Incoming::Packet(pkt) => {
                    assert_eq!(pkt.origin(), Some(id));
                    delivered += 1;
                }
                Incoming::Closed(closed) => {
                    assert_eq!(closed, id);
                    break;
                }
            }
        }
        assert!(delivered <= 2);
        assert!(deleter.join().unwrap());
    });

    assert_quiet(|| server.try_new_packet());
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn fragmented_frames_from_raw_socket() {
    let server = plain_server();
    let mut raw = TcpStream::connect(server.local_addr()).unwrap();
    raw.set_nodelay(true).unwrap();

    let mut bytes = encode_frame(8, b"split across writes").unwrap();
    bytes.extend(encode_frame(8, b"").unwrap());
    for chunk in bytes.chunks(3) {
        raw.write_all(chunk).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    let pkt = expect_packet(recv(|| server.try_new_packet()));
    assert_eq!(pkt.payload(), b"split across writes");
    let pkt = expect_packet(recv(|| server.try_new_packet()));
    assert_eq!(pkt.length(), 0);

    // Replies use the same framing on the way out.
    server.reply(&pkt, 11, b"ack").unwrap();
    let mut reply = [0u8; 8];
    raw.set_read_timeout(Some(TIMEOUT)).unwrap();
    raw.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [11, 0, 0, 0, 3, b'a', b'b', b'c']);
}

#[test]
fn relay_and_reply() {
    let server = plain_server();
    let a = client(&server, Transport::Plain);
    let b = client(&server, Transport::Plain);
    let c = client(&server, Transport::Plain);
    assert!(wait_for(|| server.connection_count() == 3));

    b.write(12, b"from b").unwrap();
    let pkt = expect_packet(recv(|| server.try_new_packet()));
    assert!(server.write_all_except_origin(&pkt));
    server.reply(&pkt, 13, b"only b").unwrap();

    for other in [&a, &c] {
        let relayed = expect_packet(recv(|| other.try_new_packet()));
        assert_eq!((relayed.kind(), relayed.payload()), (12, &b"from b"[..]));
    }
    let reply = expect_packet(recv(|| b.try_new_packet()));
    assert_eq!((reply.kind(), reply.payload()), (13, &b"only b"[..]));

    assert_quiet(|| a.try_new_packet());
    assert_quiet(|| b.try_new_packet());

    assert!(server.write_all(&pkt));
    for each in [&a, &b, &c] {
        expect_packet(recv(|| each.try_new_packet()));
    }
}

#[test]
fn stale_origin_cannot_be_replied_to() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);
    client.write(7, b"hello").unwrap();
    let pkt = expect_packet(recv(|| server.try_new_packet()));

    assert!(server.delete_connection(pkt.origin().unwrap()));
    assert!(matches!(
        server.reply(&pkt, 7, b"gone"),
        Err(TransportError::Closed)
    ));
}

#[test]
fn prepare_only_once() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);
    let conn = client.connection();

    assert!(matches!(
        conn.prepare_as_client(),
        Err(TransportError::AlreadyPrepared(Role::Client))
    ));
    assert!(matches!(
        conn.prepare_as_server(),
        Err(TransportError::AlreadyPrepared(Role::Client))
    ));
    assert!(conn.is_active());
}

#[test]
fn activate_again_is_a_no_op() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);
    client.write(7, b"hello").unwrap();
    let id = expect_packet(recv(|| server.try_new_packet()))
        .origin()
        .unwrap();

    let accepted = server.connection(id).unwrap();
    Arc::clone(&accepted).activate().unwrap();
    Arc::clone(client.connection()).activate().unwrap();
    assert_eq!(accepted.state(), ConnectionState::Active);
    assert_eq!(client.connection().state(), ConnectionState::Active);

    // A second reader on either socket would split or reorder the stream.
    for i in 0..200u32 {
        client.write(types::APPLICATION_BASE, &i.to_be_bytes()).unwrap();
    }
    for i in 0..200u32 {
        let pkt = expect_packet(recv(|| server.try_new_packet()));
        assert_eq!(pkt.payload(), i.to_be_bytes());
    }
    assert_quiet(|| server.try_new_packet());

    assert!(server.delete_connection(id));
    assert_eq!(expect_closed(recv(|| server.try_new_packet())), id);
    assert_quiet(|| server.try_new_packet());
    assert_eq!(accepted.state(), ConnectionState::Closed);

    Arc::clone(&accepted).activate().unwrap();
    assert_eq!(accepted.state(), ConnectionState::Closed);
    assert!(matches!(
        accepted.write(7, b"nobody listens"),
        Err(TransportError::Closed)
    ));

    expect_closed(recv(|| client.try_new_packet()));
    assert!(wait_for(|| client.connection().state() == ConnectionState::Closed));
    Arc::clone(client.connection()).activate().unwrap();
    assert_eq!(client.connection().state(), ConnectionState::Closed);
    assert_quiet(|| client.try_new_packet());
}

#[test]
fn shutdown_closes_everything() {
    let server = plain_server();
    let client = client(&server, Transport::Plain);
    assert!(wait_for(|| server.connection_count() == 1));

    server.shutdown();

    assert_eq!(server.connection_count(), 0);
    assert!(server.new_packet().is_none());
    assert!(matches!(
        recv(|| client.try_new_packet()),
        Incoming::Closed(_)
    ));
    server.shutdown();
}
