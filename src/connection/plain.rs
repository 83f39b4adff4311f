use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use crate::{
    error::TransportError,
    packet::{ConnectionId, PacketType},
    protocol::{
        CancelToken,
        readiness::{self, Interest},
    },
};

use super::{
    Connection, ConnectionParts, ConnectionState, Role,
    lifecycle::{Lifecycle, Link},
};

/// Blocking TCP socket shared by both workers through `&TcpStream`.
#[derive(Debug)]
struct PlainLink {
    stream: TcpStream,
    poll_interval: Duration,
}

impl Link for PlainLink {
    fn read(&self, buf: &mut [u8], cancel: &CancelToken) -> Result<usize, TransportError> {
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if !readiness::wait(&self.stream, Interest::Readable, self.poll_interval)? {
                continue;
            }
            match (&self.stream).read(buf) {
                Ok(n) => return Ok(n),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_all(&self, frame: &[u8], cancel: &CancelToken) -> Result<(), TransportError> {
        let mut rest = frame;
        while !rest.is_empty() {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            match (&self.stream).write(rest) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Unencrypted connection. Preparation only records the role.
#[derive(Debug)]
pub struct PlainConnection {
    lifecycle: Lifecycle,
    link: Arc<PlainLink>,
}

impl PlainConnection {
    pub(crate) fn new(parts: ConnectionParts) -> Result<Self, TransportError> {
        parts.stream.set_nonblocking(false)?;
        Ok(Self {
            lifecycle: Lifecycle::new(&parts),
            link: Arc::new(PlainLink {
                poll_interval: parts.config.poll_interval,
                stream: parts.stream,
            }),
        })
    }
}

impl Connection for PlainConnection {
    fn id(&self) -> ConnectionId {
        self.lifecycle.id()
    }

    fn prepare_as_server(&self) -> Result<(), TransportError> {
        self.lifecycle.claim(Role::Server)
    }

    fn prepare_as_client(&self) -> Result<(), TransportError> {
        self.lifecycle.claim(Role::Client)
    }

    fn activate(self: Arc<Self>) -> Result<(), TransportError> {
        let this = Arc::downgrade(&self);
        self.lifecycle.activate(Arc::clone(&self.link), this)
    }

    fn deactivate(&self) {
        self.lifecycle.deactivate(Some(&*self.link));
    }

    fn write(&self, kind: PacketType, payload: &[u8]) -> Result<(), TransportError> {
        self.lifecycle.write(kind, payload)
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.stream.peer_addr().ok()
    }

    fn pending(&self) -> usize {
        self.lifecycle.pending()
    }
}
