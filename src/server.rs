//! Listening side: the connection registry and the server socket facade.
use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    config::TransportConfig,
    connection::{self, Connection, ConnectionParts, Transport},
    error::TransportError,
    packet::{ConnectionId, Incoming, Packet, PacketType},
    protocol::{
        BoundedQueue, CancelToken, Worker,
        readiness::{self, Interest},
    },
};

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    reserved: bool,
    conn: Option<Arc<dyn Connection>>,
}

#[derive(Debug, Default)]
struct Slab {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// The live connections of a server and the inbound queue they all feed.
///
/// Connections are addressed by [`ConnectionId`]: a slot index plus the slot's
/// generation, which moves on every time a connection leaves the slot. A
/// handle kept past its connection's removal therefore misses instead of
/// reaching whatever occupies the slot next.
///
/// Insertion, removal and broadcast share one lock. Broadcast only holds it
/// to snapshot the live set and writes outside of it.
#[derive(Debug)]
pub struct Registry {
    slab: Mutex<Slab>,
    inbound: Arc<BoundedQueue<Incoming>>,
}

impl Registry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            slab: Mutex::new(Slab::default()),
            inbound: Arc::new(BoundedQueue::new(queue_capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab> {
        self.slab.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inbound(&self) -> &Arc<BoundedQueue<Incoming>> {
        &self.inbound
    }

    /// Claims a slot for a connection that is about to be opened.
    pub fn reserve(&self) -> ConnectionId {
        let mut slab = self.lock();
        let index = match slab.free.pop() {
            Some(index) => index,
            None => {
                slab.slots.push(Slot::default());
                (slab.slots.len() - 1) as u32
            }
        };
        let slot = &mut slab.slots[index as usize];
        slot.reserved = true;
        ConnectionId::new(index, slot.generation)
    }

    /// Gives back a reserved slot that never received a connection.
    pub fn release(&self, id: ConnectionId) {
        let mut slab = self.lock();
        let Some(slot) = slab.slots.get_mut(id.index() as usize) else {
            return;
        };
        if slot.generation == id.generation() && slot.reserved && slot.conn.is_none() {
            slot.reserved = false;
            slab.free.push(id.index());
        }
    }

    /// Fills the slot reserved for `conn.id()`.
    pub fn insert(&self, conn: Arc<dyn Connection>) -> Result<(), TransportError> {
        let id = conn.id();
        let mut slab = self.lock();
        match slab.slots.get_mut(id.index() as usize) {
            Some(slot)
                if slot.generation == id.generation() && slot.reserved && slot.conn.is_none() =>
            {
                slot.conn = Some(conn);
                debug!("registered connection {id}");
                Ok(())
            }
            _ => Err(TransportError::Closed),
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        let slab = self.lock();
        let slot = slab.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.conn.clone()
    }

    /// Unregisters `id` without deactivating it.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        let mut slab = self.lock();
        let slot = slab.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.reserved = false;
        slab.free.push(id.index());
        debug!("unregistered connection {id}");
        Some(conn)
    }

    /// Unregisters and deactivates `id`. Returns false when `id` was not
    /// registered, e.g. because it was already deleted.
    pub fn delete_connection(&self, id: ConnectionId) -> bool {
        match self.remove(id) {
            Some(conn) => {
                conn.deactivate();
                true
            }
            None => false,
        }
    }

    /// Unregisters every connection, returning them.
    pub fn clear(&self) -> Vec<Arc<dyn Connection>> {
        let mut slab = self.lock();
        let mut removed = Vec::new();
        for index in 0..slab.slots.len() {
            let slot = &mut slab.slots[index];
            if let Some(conn) = slot.conn.take() {
                slot.generation = slot.generation.wrapping_add(1);
                slot.reserved = false;
                slab.free.push(index as u32);
                removed.push(conn);
            }
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.lock()
            .slots
            .iter()
            .filter_map(|slot| slot.conn.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.conn.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `pkt` on every live connection. False if any write failed; a
    /// failure does not stop the others.
    pub fn write_all(&self, pkt: &Packet) -> bool {
        self.write_all_except(pkt, None)
    }

    /// [`Registry::write_all`] skipping the connection `except`.
    pub fn write_all_except(&self, pkt: &Packet, except: Option<ConnectionId>) -> bool {
        let mut ok = true;
        for conn in self.snapshot() {
            if Some(conn.id()) == except {
                continue;
            }
            if let Err(e) = conn.write(pkt.kind(), pkt.payload()) {
                debug!("broadcast to {} failed: {e}", conn.id());
                ok = false;
            }
        }
        ok
    }
}

/// Accepts connections on a listening socket and funnels their packets into
/// one queue.
///
/// The accept loop runs on its own thread from construction until
/// [`ServerSocket::shutdown`], which dropping the socket also performs.
#[derive(Debug)]
pub struct ServerSocket {
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    shutdown: CancelToken,
    accept: Mutex<Option<Worker>>,
    health: Mutex<Option<Worker>>,
}

impl ServerSocket {
    /// Binds `address:port` and starts accepting.
    pub fn new(
        address: &str,
        port: u16,
        transport: Transport,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((address, port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("listening at {local_addr}");

        let registry = Arc::new(Registry::new(config.queue_capacity));
        let shutdown = CancelToken::new();

        let health = match config.health_interval {
            Some(interval) => {
                let (registry, shutdown) = (Arc::clone(&registry), shutdown.clone());
                let tick = config.poll_interval;
                Some(Worker::spawn("server-health".into(), move || {
                    report_health(&registry, &shutdown, interval, tick)
                })?)
            }
            None => None,
        };

        let accept = {
            let acceptor = Acceptor {
                listener,
                registry: Arc::clone(&registry),
                transport,
                config,
                shutdown: shutdown.clone(),
            };
            Worker::spawn(format!("server-accept-{}", local_addr.port()), move || {
                acceptor.run()
            })
        };
        let accept = match accept {
            Ok(worker) => worker,
            Err(e) => {
                shutdown.cancel();
                if let Some(worker) = health {
                    worker.stop();
                }
                return Err(e);
            }
        };

        Ok(Self {
            registry,
            local_addr,
            shutdown,
            accept: Mutex::new(Some(accept)),
            health: Mutex::new(health),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Waits for the next inbound packet or close notice. `None` after shutdown.
    pub fn new_packet(&self) -> Option<Incoming> {
        self.registry.inbound().consume()
    }

    /// Like [`ServerSocket::new_packet`], but returns `None` instead of waiting.
    pub fn try_new_packet(&self) -> Option<Incoming> {
        self.registry.inbound().try_consume()
    }

    /// Releases a packet obtained from [`ServerSocket::new_packet`].
    pub fn delete_packet(&self, pkt: Packet) {
        drop(pkt);
    }

    pub fn write_all(&self, pkt: &Packet) -> bool {
        self.registry.write_all(pkt)
    }

    /// Relays `pkt` to every connection but the one it came from.
    pub fn write_all_except_origin(&self, pkt: &Packet) -> bool {
        self.registry.write_all_except(pkt, pkt.origin())
    }

    /// The live connection behind `id`, if it is still registered.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.registry.get(id)
    }

    /// Writes back to the connection `pkt` arrived on.
    pub fn reply(
        &self,
        pkt: &Packet,
        kind: PacketType,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let conn = pkt
            .origin()
            .and_then(|id| self.registry.get(id))
            .ok_or(TransportError::Closed)?;
        conn.write(kind, payload)
    }

    /// Deactivates `id` and waits for its close notice to be queued.
    ///
    /// The notice goes through the shared inbound queue with a blocking
    /// produce, so when that queue is full this returns only once someone
    /// consumes from it. The thread that drains the queue must not call this
    /// while the queue may be full; hand the call to another thread and keep
    /// consuming.
    pub fn delete_connection(&self, id: ConnectionId) -> bool {
        self.registry.delete_connection(id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Blocks until the accept loop ends, either through
    /// [`ServerSocket::shutdown`] or a fatal accept error.
    pub fn run(&self) {
        let accept = self
            .accept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = accept {
            worker.stop();
        }
    }

    /// Stops accepting, deactivates every connection and discards whatever
    /// is still queued.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for slot in [&self.accept, &self.health] {
            let worker = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(worker) = worker {
                worker.stop();
            }
        }

        let inbound = self.registry.inbound();
        if inbound.is_closed() {
            return;
        }
        inbound.close();

        let connections = self.registry.clear();
        info!("shutting down, closing {} connections", connections.len());
        for conn in connections {
            conn.deactivate();
        }

        let mut discarded = 0;
        while let Ok(Some(_)) = inbound.drain() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("discarded {discarded} undelivered packets");
        }
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Acceptor {
    listener: TcpListener,
    registry: Arc<Registry>,
    transport: Transport,
    config: TransportConfig,
    shutdown: CancelToken,
}

impl Acceptor {
    fn run(self) {
        while !self.shutdown.is_cancelled() {
            match readiness::wait(&self.listener, Interest::Readable, self.config.poll_interval) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("accept loop failed: {e}");
                    return;
                }
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("accepted connection from {peer}");
                    if let Err(e) = self.admit(stream, peer) {
                        warn!("rejected connection from {peer}: {e}");
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                    ) => {}
                Err(e) => {
                    error!("accept failed: {e}");
                    return;
                }
            }
        }
        debug!("accept loop stopped");
    }

    /// Prepares the connection and only registers it if that succeeds.
    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TransportError> {
        let id = self.registry.reserve();
        let parts = ConnectionParts {
            id,
            stream,
            host: peer.ip().to_string(),
            inbound: Arc::clone(self.registry.inbound()),
            owner: Some(Arc::downgrade(&self.registry)),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        };

        let conn = match connection::open(&self.transport, parts)
            .and_then(|conn| conn.prepare_as_server().map(|()| conn))
        {
            Ok(conn) => conn,
            Err(e) => {
                self.registry.release(id);
                return Err(e);
            }
        };

        self.registry.insert(Arc::clone(&conn))?;
        if let Err(e) = conn.activate() {
            self.registry.delete_connection(id);
            return Err(e);
        }
        Ok(())
    }
}

fn report_health(registry: &Registry, shutdown: &CancelToken, interval: Duration, tick: Duration) {
    let mut next = Instant::now() + interval;
    while !shutdown.is_cancelled() {
        std::thread::sleep(tick.min(interval));
        if Instant::now() >= next {
            info!("{} live connections", registry.len());
            next += interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };

    use super::*;
    use crate::connection::ConnectionState;

    #[derive(Debug)]
    struct Recorder {
        id: ConnectionId,
        written: Mutex<Vec<(PacketType, Vec<u8>)>>,
        deactivations: Mutex<usize>,
        delay: Duration,
    }

    impl Recorder {
        fn new(id: ConnectionId) -> Arc<Self> {
            Self::slow(id, Duration::ZERO)
        }

        fn slow(id: ConnectionId, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id,
                written: Mutex::new(Vec::new()),
                deactivations: Mutex::new(0),
                delay,
            })
        }

        fn written(&self) -> Vec<(PacketType, Vec<u8>)> {
            self.written.lock().unwrap().clone()
        }
    }

    impl Connection for Recorder {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn prepare_as_server(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn prepare_as_client(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn activate(self: Arc<Self>) -> Result<(), TransportError> {
            Ok(())
        }

        fn deactivate(&self) {
            *self.deactivations.lock().unwrap() += 1;
        }

        fn write(&self, kind: PacketType, payload: &[u8]) -> Result<(), TransportError> {
            thread::sleep(self.delay);
            self.written.lock().unwrap().push((kind, payload.to_vec()));
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Active
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn pending(&self) -> usize {
            0
        }
    }

    fn register(registry: &Registry) -> Arc<Recorder> {
        register_slow(registry, Duration::ZERO)
    }

    fn register_slow(registry: &Registry, delay: Duration) -> Arc<Recorder> {
        let conn = Recorder::slow(registry.reserve(), delay);
        registry.insert(conn.clone()).unwrap();
        conn
    }

    #[test]
    fn broadcast_skips_origin() {
        let registry = Registry::new(16);
        let (a, b, c) = (
            register(&registry),
            register(&registry),
            register(&registry),
        );

        let pkt = Packet::received(b.id(), 9, b"relay".to_vec());
        assert!(registry.write_all_except(&pkt, pkt.origin()));

        assert_eq!(a.written(), vec![(9, b"relay".to_vec())]);
        assert!(b.written().is_empty());
        assert_eq!(c.written(), vec![(9, b"relay".to_vec())]);

        assert!(registry.write_all(&pkt));
        assert_eq!(b.written().len(), 1);
        assert_eq!(a.written().len(), 2);
    }

    #[test]
    fn stale_ids_miss_after_removal() {
        let registry = Registry::new(16);
        let first = register(&registry);
        let id = first.id();

        assert!(registry.delete_connection(id));
        assert!(!registry.delete_connection(id));
        assert_eq!(*first.deactivations.lock().unwrap(), 1);

        let second = register(&registry);
        assert_eq!(second.id().index(), id.index());
        assert_ne!(second.id(), id);
        assert!(registry.get(id).is_none());
        assert!(registry.get(second.id()).is_some());
    }

    #[test]
    fn insert_requires_reservation() {
        let registry = Registry::new(16);
        let id = registry.reserve();
        registry.release(id);

        assert!(registry.insert(Recorder::new(id)).is_err());
        assert!(registry.is_empty());

        let bogus = Recorder::new(ConnectionId::new(42, 0));
        assert!(registry.insert(bogus).is_err());
    }

    #[test]
    fn clear_returns_every_connection() {
        let registry = Registry::new(16);
        let ids: Vec<_> = (0..3).map(|_| register(&registry).id()).collect();

        assert_eq!(registry.clear().len(), 3);
        assert!(registry.is_empty());
        assert!(ids.iter().all(|&id| registry.get(id).is_none()));
    }

    #[test]
    fn mutation_during_broadcast() {
        let registry = Arc::new(Registry::new(16));
        let slow = register_slow(&registry, Duration::from_millis(50));
        let steady = register(&registry);
        let done = Arc::new(AtomicBool::new(false));

        let churn = {
            let (registry, done) = (Arc::clone(&registry), Arc::clone(&done));
            thread::spawn(move || {
                let mut cycles = 0;
                while !done.load(Ordering::SeqCst) {
                    let conn = register(&registry);
                    assert!(registry.delete_connection(conn.id()));
                    cycles += 1;
                }
                cycles
            })
        };

        let pkt = Packet::new(7, b"tick".to_vec()).unwrap();
        for _ in 0..3 {
            assert!(registry.write_all(&pkt));
        }
        done.store(true, Ordering::SeqCst);

        assert!(churn.join().unwrap() > 0);
        assert_eq!(slow.written().len(), 3);
        assert_eq!(steady.written().len(), 3);
        assert_eq!(registry.len(), 2);
    }
}
