use std::{
    any::Any,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, trace};
use rustls::{ClientConnection, IoState, Reader, ServerConnection, Writer, pki_types::CertificateDer};

use crate::{
    error::TransportError,
    protocol::{
        CancelToken,
        readiness::{self, Interest},
    },
};

/// The rustls state machine for either role.
pub(crate) enum TlsStream {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsStream {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsStream::Server(conn) => conn.read_tls(rd),
            TlsStream::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsStream::Server(conn) => conn.write_tls(wr),
            TlsStream::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<IoState, rustls::Error> {
        match self {
            TlsStream::Server(conn) => conn.process_new_packets(),
            TlsStream::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsStream::Server(conn) => conn.wants_write(),
            TlsStream::Client(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsStream::Server(conn) => conn.is_handshaking(),
            TlsStream::Client(conn) => conn.is_handshaking(),
        }
    }

    fn reader(&mut self) -> Reader<'_> {
        match self {
            TlsStream::Server(conn) => conn.reader(),
            TlsStream::Client(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> Writer<'_> {
        match self {
            TlsStream::Server(conn) => conn.writer(),
            TlsStream::Client(conn) => conn.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsStream::Server(conn) => conn.send_close_notify(),
            TlsStream::Client(conn) => conn.send_close_notify(),
        }
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match self {
            TlsStream::Server(conn) => conn.peer_certificates(),
            TlsStream::Client(conn) => conn.peer_certificates(),
        }
    }
}

/// A TLS session over a non-blocking socket, shared by one reader and one
/// writer thread.
///
/// Every call into rustls happens under the session lock. When the socket
/// would block the lock is released before waiting for readiness, so the other
/// direction can make progress in the meantime.
pub struct TlsSession {
    stream: TcpStream,
    tls: Mutex<TlsStream>,
    poll_interval: Duration,
    // Holds the role context for as long as the session lives.
    _context: Arc<dyn Any + Send + Sync>,
}

enum Flush {
    Done,
    Blocked,
}

impl TlsSession {
    pub(crate) fn new(
        stream: TcpStream,
        tls: TlsStream,
        context: Arc<dyn Any + Send + Sync>,
        poll_interval: Duration,
    ) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            tls: Mutex::new(tls),
            poll_interval,
            _context: context,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TlsStream> {
        self.tls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes queued TLS records until done or the socket would block.
    fn flush(&self, tls: &mut TlsStream) -> Result<Flush, TransportError> {
        let mut sock = &self.stream;
        while tls.wants_write() {
            match tls.write_tls(&mut sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Flush::Done)
    }

    /// Drives the handshake to completion, giving up once `timeout` elapses
    /// or `cancel` fires.
    pub fn handshake(&self, timeout: Duration, cancel: &CancelToken) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut tls = self.lock();
        let mut sock = &self.stream;

        loop {
            if let Flush::Blocked = self.flush(&mut tls)? {
                self.retry_wait(Interest::Writable, deadline, timeout, cancel)?;
                continue;
            }
            if !tls.is_handshaking() {
                debug!("tls handshake with {:?} complete", self.stream.peer_addr());
                return Ok(());
            }

            match tls.read_tls(&mut sock) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during tls handshake",
                    )
                    .into());
                }
                Ok(_) => {
                    if let Err(e) = tls.process_new_packets() {
                        // Best effort: let the peer see the alert.
                        let _ = self.flush(&mut tls);
                        return Err(e.into());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.retry_wait(Interest::Readable, deadline, timeout, cancel)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One bounded wait between handshake attempts.
    fn retry_wait(
        &self,
        interest: Interest,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::HandshakeTimeout(timeout));
        }
        readiness::wait(&self.stream, interest, remaining.min(self.poll_interval))?;
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        Ok(())
    }

    /// Reads decrypted bytes into `buf`. `Ok(0)` means the peer closed the
    /// session cleanly.
    pub fn read(&self, buf: &mut [u8], cancel: &CancelToken) -> Result<usize, TransportError> {
        let mut sock = &self.stream;
        let mut eof = false;

        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            {
                let mut tls = self.lock();
                match tls.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
                if eof {
                    return Ok(0);
                }

                match tls.read_tls(&mut sock) {
                    Ok(n) => {
                        eof = n == 0;
                        tls.process_new_packets()?;
                        // Key updates and alerts may need an answer.
                        self.flush(&mut tls)?;
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            readiness::wait(&self.stream, Interest::Readable, self.poll_interval)?;
        }
    }

    /// Encrypts and sends all of `data`.
    pub fn write_all(&self, data: &[u8], cancel: &CancelToken) -> Result<(), TransportError> {
        let mut rest = data;

        loop {
            {
                let mut tls = self.lock();
                if !rest.is_empty() {
                    let n = tls.writer().write(rest)?;
                    rest = &rest[n..];
                }
                match self.flush(&mut tls)? {
                    Flush::Done if rest.is_empty() => return Ok(()),
                    Flush::Done => continue,
                    Flush::Blocked => {}
                }
            }

            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            trace!("tls write blocked, {} bytes pending", rest.len());
            readiness::wait(&self.stream, Interest::Writable, self.poll_interval)?;
        }
    }

    /// Certificates the peer presented during the handshake.
    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.lock().peer_certificates().map(<[_]>::to_vec)
    }

    /// Sends close_notify if the socket takes it right away, then shuts the
    /// socket down in both directions.
    pub fn close(&self) {
        {
            let mut tls = self.lock();
            tls.send_close_notify();
            let _ = self.flush(&mut tls);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}
