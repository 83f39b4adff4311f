//! Tunables shared by servers, clients and their connections.
use std::{path::PathBuf, time::Duration};

/// Capacity of the inbound queue fed by network threads.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of the shared inbound packet queue.
    pub queue_capacity: usize,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_capacity: usize,
    /// Upper bound on a TLS handshake.
    pub handshake_timeout: Duration,
    /// Readiness wait per I/O retry; also how quickly workers notice cancellation.
    pub poll_interval: Duration,
    /// Largest payload a peer may declare before the connection is dropped.
    pub max_payload_len: u32,
    /// Log the live connection count at this interval.
    pub health_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_payload_len: DEFAULT_MAX_PAYLOAD,
            health_interval: None,
        }
    }
}

/// PEM certificate chain and private key presented by the server role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            certificate: PathBuf::from("./server.crt"),
            private_key: PathBuf::from("./server.key"),
        }
    }
}

/// How the client role authenticates servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTrust {
    /// Verify the server against the PEM roots in this file.
    CaFile(PathBuf),
    /// Accept any server certificate. Encrypts, but does not authenticate.
    Insecure,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub identity: Option<ServerIdentity>,
    pub trust: ClientTrust,
    /// SNI / verification name; defaults to the address passed to connect.
    pub server_name: Option<String>,
}

impl TlsSettings {
    pub fn server(identity: ServerIdentity) -> Self {
        Self {
            identity: Some(identity),
            trust: ClientTrust::Insecure,
            server_name: None,
        }
    }

    pub fn client(trust: ClientTrust) -> Self {
        Self {
            identity: None,
            trust,
            server_name: None,
        }
    }
}
