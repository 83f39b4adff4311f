//! Connecting side: one connection and its private inbound queue.
use std::{
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
};

use log::{debug, info};

use crate::{
    config::TransportConfig,
    connection::{self, Connection, ConnectionParts, Transport},
    error::TransportError,
    packet::{ConnectionId, Incoming, Packet, PacketType},
    protocol::{BoundedQueue, CancelToken},
};

/// Client end of a connection. Dropping it deactivates the connection.
#[derive(Debug)]
pub struct ClientSocket {
    connection: Arc<dyn Connection>,
    inbound: Arc<BoundedQueue<Incoming>>,
}

impl ClientSocket {
    /// Resolves `address`, connects to the first address that accepts,
    /// prepares the connection as a client and activates it.
    pub fn connect(
        address: &str,
        port: u16,
        transport: Transport,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let addrs = (address, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(format!("{address}:{port}: {e}")))?;

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(e.into()),
            (None, None) => {
                return Err(TransportError::Resolve(format!(
                    "{address}:{port}: no addresses"
                )));
            }
        };
        info!("connected to {:?}", stream.peer_addr());

        let inbound = Arc::new(BoundedQueue::new(config.queue_capacity));
        let connection = connection::open(
            &transport,
            ConnectionParts {
                id: ConnectionId::new(0, 0),
                stream,
                host: address.to_owned(),
                inbound: Arc::clone(&inbound),
                owner: None,
                config,
                shutdown: CancelToken::new(),
            },
        )?;
        connection.prepare_as_client()?;
        Arc::clone(&connection).activate()?;

        Ok(Self {
            connection,
            inbound,
        })
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    /// Queues one frame; see [`Connection::write`].
    pub fn write(&self, kind: PacketType, payload: &[u8]) -> Result<(), TransportError> {
        self.connection.write(kind, payload)
    }

    pub fn write_packet(&self, pkt: &Packet) -> Result<(), TransportError> {
        self.write(pkt.kind(), pkt.payload())
    }

    /// Waits for the next packet, or the notice that the connection closed.
    pub fn new_packet(&self) -> Option<Incoming> {
        self.inbound.consume()
    }

    pub fn try_new_packet(&self) -> Option<Incoming> {
        self.inbound.try_consume()
    }

    pub fn delete_packet(&self, pkt: Packet) {
        drop(pkt);
    }

    /// Frames not yet handed to the socket.
    pub fn pending(&self) -> usize {
        self.connection.pending()
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.inbound.close();
        self.connection.deactivate();
        while let Ok(Some(_)) = self.inbound.drain() {}
    }
}

