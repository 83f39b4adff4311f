use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::connection::Role;

/// Every failure the transport can report to a caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode frame header: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame header: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("payload of {0} bytes does not fit the 32-bit length field")]
    PayloadTooLarge(usize),
    #[error("peer declared a {declared} byte payload, limit is {limit}")]
    Oversized { declared: u32, limit: u32 },

    #[error("connection or queue is closed")]
    Closed,
    #[error("operation cancelled")]
    Cancelled,

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("tls handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("connection was already prepared as {0}")]
    AlreadyPrepared(Role),
    #[error("connection has no tls session, prepare it first")]
    NotPrepared,
    #[error("no server identity configured for the tls server role")]
    MissingIdentity,
    #[error("failed to load {what} from {path:?}: {reason}")]
    Credentials {
        what: &'static str,
        path: PathBuf,
        reason: String,
    },
    #[error("invalid tls server name '{0}'")]
    ServerName(String),

    #[error("could not resolve '{0}'")]
    Resolve(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(io::Error),
}

impl TransportError {
    /// True for errors that only mean "the peer went away", which are logged
    /// quietly rather than as failures.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Closed | TransportError::Cancelled => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
