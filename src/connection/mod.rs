//! Connections: one socket, one reader thread, one writer thread.
//!
//! A connection decodes frames from its socket into a shared inbound queue and
//! writes frames taken from its own outbound queue. Both variants, plain TCP
//! and TLS, share the state machine in [`lifecycle`]:
//!
//! ```text
//! Created --activate--> Active --deactivate--> Deactivating --> Closed
//! ```
//!
//! A connection terminates exactly once. Whoever gets there first (a worker
//! hitting EOF, an I/O error or the disconnect marker, the registry, or the
//! application) runs the teardown; every later attempt is a no-op. Teardown
//! queues one [`Incoming::Closed`](crate::Incoming::Closed) on the inbound
//! queue so consumers learn which connection went away.
mod lifecycle;
mod plain;
mod tls;

use std::{
    fmt,
    net::{SocketAddr, TcpStream},
    sync::{Arc, Weak},
};

use rustls::pki_types::CertificateDer;

use crate::{
    config::TransportConfig,
    error::TransportError,
    packet::{ConnectionId, Incoming, PacketType},
    protocol::{BoundedQueue, CancelToken},
    server::Registry,
    tls::TlsContexts,
};

pub use plain::PlainConnection;
pub use tls::TlsConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Active,
    Deactivating,
    Closed,
}

/// Which side of the connection this end plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Which connection variant a server or client opens.
#[derive(Debug, Clone, Default)]
pub enum Transport {
    #[default]
    Plain,
    Tls(Arc<TlsContexts>),
}

pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    /// Server-side setup. May be called once, and not after
    /// [`Connection::prepare_as_client`].
    fn prepare_as_server(&self) -> Result<(), TransportError>;

    /// Client-side setup. May be called once, and not after
    /// [`Connection::prepare_as_server`].
    fn prepare_as_client(&self) -> Result<(), TransportError>;

    /// Starts the reader and writer. A no-op unless the connection is still
    /// [`ConnectionState::Created`].
    fn activate(self: Arc<Self>) -> Result<(), TransportError>;

    /// Stops the workers, closes the socket, discards unsent frames and
    /// queues the closed notification. A no-op unless active.
    fn deactivate(&self);

    /// Queues one frame for sending. Success means queued, not delivered.
    fn write(&self, kind: PacketType, payload: &[u8]) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Frames queued but not yet taken by the writer.
    fn pending(&self) -> usize;

    /// The chain presented by the peer, for TLS connections.
    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        None
    }
}

/// Everything a connection is built from.
pub(crate) struct ConnectionParts {
    pub id: ConnectionId,
    pub stream: TcpStream,
    /// Name the peer was reached by, used as the TLS server name by clients.
    pub host: String,
    pub inbound: Arc<BoundedQueue<Incoming>>,
    pub owner: Option<Weak<Registry>>,
    pub config: TransportConfig,
    /// Aborts setup (the TLS handshake) when the owner goes away.
    pub shutdown: CancelToken,
}

pub(crate) fn open(
    transport: &Transport,
    parts: ConnectionParts,
) -> Result<Arc<dyn Connection>, TransportError> {
    Ok(match transport {
        Transport::Plain => Arc::new(PlainConnection::new(parts)?),
        Transport::Tls(contexts) => Arc::new(TlsConnection::new(parts, Arc::clone(contexts))),
    })
}
