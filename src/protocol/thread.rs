use std::thread;

use log::{debug, warn};

use crate::error::TransportError;

/// A named worker thread owned by a connection or server.
#[derive(Debug)]
pub struct Worker {
    name: String,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    pub fn spawn<F>(name: String, f: F) -> Result<Self, TransportError>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(TransportError::Spawn)?;
        debug!("worker {name} started");

        Ok(Self { name, thread })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from this worker's own thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread.thread().id()
    }

    /// Waits for the worker to finish. A worker stopping itself is detached
    /// instead, since it cannot wait for its own completion.
    pub fn stop(self) {
        if self.is_current() {
            debug!("worker {} refused to join itself, detaching", self.name);
            return;
        }

        debug!("joining worker {}", self.name);
        if self.thread.join().is_err() {
            warn!("worker {} panicked", self.name);
        }
    }
}
