#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use framewire::{
    ClientSocket, ConnectionId, Incoming, Packet, ServerSocket, Transport, TransportConfig,
};

pub const MESSAGE: &[u8] = b"This is the string that was transmitted.\0";
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn data(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

pub fn server(transport: Transport, config: TransportConfig) -> ServerSocket {
    init_logger();
    ServerSocket::new("127.0.0.1", 0, transport, config).unwrap()
}

pub fn client(server: &ServerSocket, transport: Transport) -> ClientSocket {
    ClientSocket::connect(
        "127.0.0.1",
        server.local_addr().port(),
        transport,
        TransportConfig::default(),
    )
    .unwrap()
}

/// Polls `cond` until it holds or [`TIMEOUT`] passes.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Next item from a non-blocking source, failing the test after [`TIMEOUT`].
pub fn recv(mut next: impl FnMut() -> Option<Incoming>) -> Incoming {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Some(incoming) = next() {
            return incoming;
        }
        assert!(Instant::now() < deadline, "nothing received in {TIMEOUT:?}");
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn expect_packet(incoming: Incoming) -> Packet {
    match incoming {
        Incoming::Packet(pkt) => pkt,
        Incoming::Closed(id) => panic!("expected a packet, connection {id} closed"),
    }
}

pub fn expect_closed(incoming: Incoming) -> ConnectionId {
    match incoming {
        Incoming::Closed(id) => id,
        Incoming::Packet(pkt) => panic!("expected a close notice, got {pkt}"),
    }
}

/// Asserts nothing else shows up for a little while.
pub fn assert_quiet(mut next: impl FnMut() -> Option<Incoming>) {
    thread::sleep(Duration::from_millis(200));
    if let Some(incoming) = next() {
        panic!("unexpected {incoming:?}");
    }
}
