use std::{
    any::Any,
    fmt,
    net::{SocketAddr, TcpStream},
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use log::debug;
use rustls::pki_types::CertificateDer;

use crate::{
    error::TransportError,
    packet::{ConnectionId, PacketType},
    protocol::CancelToken,
    tls::{TlsContexts, TlsSession, TlsStream},
};

use super::{
    Connection, ConnectionParts, ConnectionState, Role,
    lifecycle::{Lifecycle, Link},
};

impl Link for TlsSession {
    fn read(&self, buf: &mut [u8], cancel: &CancelToken) -> Result<usize, TransportError> {
        TlsSession::read(self, buf, cancel)
    }

    fn write_all(&self, frame: &[u8], cancel: &CancelToken) -> Result<(), TransportError> {
        TlsSession::write_all(self, frame, cancel)
    }

    fn shutdown(&self) {
        self.close();
    }
}

/// Connection whose bytes go through a TLS session.
///
/// The socket is held raw until [`Connection::prepare_as_server`] or
/// [`Connection::prepare_as_client`] runs the handshake; only a prepared
/// connection can be activated.
pub struct TlsConnection {
    lifecycle: Lifecycle,
    contexts: Arc<TlsContexts>,
    host: String,
    peer: Option<SocketAddr>,
    stream: Mutex<Option<TcpStream>>,
    session: OnceLock<Arc<TlsSession>>,
    shutdown: CancelToken,
}

impl TlsConnection {
    pub(crate) fn new(parts: ConnectionParts, contexts: Arc<TlsContexts>) -> Self {
        Self {
            lifecycle: Lifecycle::new(&parts),
            contexts,
            peer: parts.stream.peer_addr().ok(),
            host: parts.host,
            stream: Mutex::new(Some(parts.stream)),
            session: OnceLock::new(),
            shutdown: parts.shutdown,
        }
    }

    fn prepare(&self, role: Role) -> Result<(), TransportError> {
        self.lifecycle.claim(role)?;
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::Closed)?;

        let (tls, context) = match role {
            Role::Server => {
                let ctx = self.contexts.server()?;
                let tls = TlsStream::Server(ctx.accept()?);
                (tls, ctx as Arc<dyn Any + Send + Sync>)
            }
            Role::Client => {
                let ctx = self.contexts.client()?;
                let tls = TlsStream::Client(ctx.connect(&self.host)?);
                (tls, ctx as Arc<dyn Any + Send + Sync>)
            }
        };

        let config = self.lifecycle.config();
        let session = TlsSession::new(stream, tls, context, config.poll_interval)?;
        if let Err(e) = session.handshake(config.handshake_timeout, &self.shutdown) {
            debug!("tls handshake as {role} with {:?} failed: {e}", self.peer);
            return Err(e);
        }

        if self.session.set(Arc::new(session)).is_err() {
            return Err(TransportError::AlreadyPrepared(role));
        }
        debug!("connection {} secured as {role}", self.lifecycle.id());
        Ok(())
    }

    pub fn session(&self) -> Option<&Arc<TlsSession>> {
        self.session.get()
    }
}

impl Connection for TlsConnection {
    fn id(&self) -> ConnectionId {
        self.lifecycle.id()
    }

    fn prepare_as_server(&self) -> Result<(), TransportError> {
        self.prepare(Role::Server)
    }

    fn prepare_as_client(&self) -> Result<(), TransportError> {
        self.prepare(Role::Client)
    }

    fn activate(self: Arc<Self>) -> Result<(), TransportError> {
        let session = Arc::clone(self.session.get().ok_or(TransportError::NotPrepared)?);
        let this = Arc::downgrade(&self);
        self.lifecycle.activate(session, this)
    }

    fn deactivate(&self) {
        let session = self.session.get().map(|s| &**s as &dyn Link);
        self.lifecycle.deactivate(session);
    }

    fn write(&self, kind: PacketType, payload: &[u8]) -> Result<(), TransportError> {
        self.lifecycle.write(kind, payload)
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn pending(&self) -> usize {
        self.lifecycle.pending()
    }

    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.session.get()?.peer_certificates()
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("lifecycle", &self.lifecycle)
            .field("host", &self.host)
            .field("peer", &self.peer)
            .field("secured", &self.session.get().is_some())
            .finish()
    }
}
