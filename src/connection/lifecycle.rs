use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use log::{debug, trace, warn};

use crate::{
    config::TransportConfig,
    error::TransportError,
    packet::{ConnectionId, Incoming, Packet, PacketType},
    protocol::{BoundedQueue, CancelToken, Decoded, FrameDecoder, PushError, Worker, encode_frame},
    server::Registry,
};

use super::{Connection, ConnectionParts, ConnectionState, Role};

/// Byte-level I/O of one connection variant, shared by its two workers.
pub(crate) trait Link: Send + Sync + 'static {
    /// Reads into `buf`, waiting for data. `Ok(0)` means the peer closed.
    fn read(&self, buf: &mut [u8], cancel: &CancelToken) -> Result<usize, TransportError>;

    /// Writes every byte of `frame`.
    fn write_all(&self, frame: &[u8], cancel: &CancelToken) -> Result<(), TransportError>;

    /// Closes the socket so blocked workers wake up.
    fn shutdown(&self);
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    role: Option<Role>,
    workers: Vec<Worker>,
}

/// State machine and queues common to every connection variant.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    id: ConnectionId,
    inner: Mutex<Inner>,
    outbound: Arc<BoundedQueue<Vec<u8>>>,
    inbound: Arc<BoundedQueue<Incoming>>,
    owner: Option<Weak<Registry>>,
    cancel: CancelToken,
    config: TransportConfig,
}

impl Lifecycle {
    /// Built from everything in `parts` except the socket.
    pub fn new(parts: &ConnectionParts) -> Self {
        Self {
            id: parts.id,
            inner: Mutex::new(Inner {
                state: ConnectionState::Created,
                role: None,
                workers: Vec::with_capacity(2),
            }),
            outbound: Arc::new(BoundedQueue::new(parts.config.outbound_capacity)),
            inbound: Arc::clone(&parts.inbound),
            owner: parts.owner.clone(),
            cancel: CancelToken::new(),
            config: parts.config.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Records the role; a connection is prepared at most once.
    pub fn claim(&self, role: Role) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if let Some(prepared) = inner.role {
            return Err(TransportError::AlreadyPrepared(prepared));
        }
        inner.role = Some(role);
        debug!("connection {} prepared as {role}", self.id);
        Ok(())
    }

    pub fn write(&self, kind: PacketType, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(kind, payload)?;
        self.outbound
            .produce(frame)
            .map_err(|_| TransportError::Closed)
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    pub fn activate<L: Link>(
        &self,
        link: Arc<L>,
        this: Weak<dyn Connection>,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Created => {}
            ConnectionState::Active => return Ok(()),
            state => {
                debug!("connection {} is {state:?}, not activating", self.id);
                return Ok(());
            }
        }

        let terminator = Terminator {
            id: self.id,
            owner: self.owner.clone(),
            this,
        };

        let reader = {
            let ctx = ReaderContext {
                id: self.id,
                link: Arc::clone(&link),
                inbound: Arc::clone(&self.inbound),
                cancel: self.cancel.clone(),
                config: self.config.clone(),
                terminator: terminator.clone(),
            };
            Worker::spawn(format!("conn-{}-reader", self.id), move || ctx.run())?
        };

        let writer = {
            let link = Arc::clone(&link);
            let outbound = Arc::clone(&self.outbound);
            let cancel = self.cancel.clone();
            Worker::spawn(format!("conn-{}-writer", self.id), move || {
                write_loop(&*link, &outbound, &cancel, &terminator)
            })
        };

        match writer {
            Ok(writer) => {
                inner.workers = vec![reader, writer];
                inner.state = ConnectionState::Active;
                debug!("connection {} active", self.id);
                Ok(())
            }
            Err(e) => {
                self.cancel.cancel();
                self.outbound.close();
                link.shutdown();
                inner.state = ConnectionState::Closed;
                drop(inner);
                reader.stop();
                Err(e)
            }
        }
    }

    /// Runs the teardown described on [`Connection::deactivate`].
    pub fn deactivate(&self, link: Option<&dyn Link>) {
        let workers = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Active {
                return;
            }
            inner.state = ConnectionState::Deactivating;
            mem::take(&mut inner.workers)
        };
        debug!("deactivating connection {}", self.id);

        self.cancel.cancel();
        self.outbound.close();
        if let Some(link) = link {
            link.shutdown();
        }
        for worker in workers {
            worker.stop();
        }

        let mut discarded = 0;
        while let Ok(Some(_)) = self.outbound.drain() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("connection {} discarded {discarded} unsent frames", self.id);
        }

        if self.inbound.produce(Incoming::Closed(self.id)).is_err() {
            debug!("inbound queue closed, dropping close notice for {}", self.id);
        }

        self.lock().state = ConnectionState::Closed;
        debug!("connection {} closed", self.id);
    }
}

/// How a worker reports that its connection is finished.
#[derive(Clone)]
struct Terminator {
    id: ConnectionId,
    owner: Option<Weak<Registry>>,
    this: Weak<dyn Connection>,
}

impl Terminator {
    /// Owned connections are removed through their registry, the rest
    /// deactivate themselves.
    fn terminate(&self) {
        if let Some(registry) = self.owner.as_ref().and_then(Weak::upgrade) {
            if registry.delete_connection(self.id) {
                return;
            }
        }
        if let Some(conn) = self.this.upgrade() {
            conn.deactivate();
        }
    }
}

struct ReaderContext<L> {
    id: ConnectionId,
    link: Arc<L>,
    inbound: Arc<BoundedQueue<Incoming>>,
    cancel: CancelToken,
    config: TransportConfig,
    terminator: Terminator,
}

impl<L: Link> ReaderContext<L> {
    fn run(self) {
        let outcome = self.read_frames();
        match &outcome {
            Ok(()) => debug!("connection {} closed by peer", self.id),
            Err(e) if e.is_disconnect() => debug!("connection {} reader stopped: {e}", self.id),
            Err(e) => warn!("connection {} read failed: {e}", self.id),
        }

        if !self.cancel.is_cancelled() {
            self.terminator.terminate();
        }
    }

    /// Returns `Ok` on a clean end of stream or the disconnect marker.
    fn read_frames(&self) -> Result<(), TransportError> {
        let mut decoder = FrameDecoder::new(self.config.max_payload_len);

        loop {
            let n = self.link.read(decoder.demand(), &self.cancel)?;
            if n == 0 {
                if !decoder.is_idle() {
                    debug!("connection {} closed mid-frame", self.id);
                }
                return Ok(());
            }

            match decoder.advance(n)? {
                None => {}
                Some(Decoded::Disconnect) => {
                    debug!("connection {} received disconnect marker", self.id);
                    return Ok(());
                }
                Some(Decoded::Frame { kind, payload }) => {
                    let packet = Packet::received(self.id, kind, payload);
                    trace!("{packet}\n{}", packet.hexdump());

                    self.inbound
                        .produce_cancellable(
                            Incoming::Packet(packet),
                            &self.cancel,
                            self.config.poll_interval,
                        )
                        .map_err(|e| match e {
                            PushError::Cancelled(_) => TransportError::Cancelled,
                            PushError::Closed(_) => TransportError::Closed,
                        })?;
                }
            }
        }
    }
}

fn write_loop<L: Link>(
    link: &L,
    outbound: &BoundedQueue<Vec<u8>>,
    cancel: &CancelToken,
    terminator: &Terminator,
) {
    while let Some(frame) = outbound.consume() {
        if let Err(e) = link.write_all(&frame, cancel) {
            if e.is_disconnect() {
                debug!("connection {} writer stopped: {e}", terminator.id);
            } else {
                warn!("connection {} write failed: {e}", terminator.id);
            }
            if !cancel.is_cancelled() {
                terminator.terminate();
            }
            return;
        }
    }
}
