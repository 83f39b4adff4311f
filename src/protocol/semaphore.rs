use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::CancelToken;

#[derive(Debug)]
struct Permits {
    available: usize,
    closed: bool,
}

/// Counting semaphore that can be closed.
///
/// Closing wakes every waiter; from then on acquisitions fail, regardless of
/// how many permits remain.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<Permits>,
    released: Condvar,
}

/// Why an acquisition did not take a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    Closed,
    Cancelled,
    WouldBlock,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            permits: Mutex::new(Permits {
                available: initial,
                closed: false,
            }),
            released: Condvar::new(),
        }
    }

    // Counters stay consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, Permits> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a permit is available.
    pub fn acquire(&self) -> Result<(), AcquireError> {
        let mut permits = self.lock();
        loop {
            if permits.closed {
                return Err(AcquireError::Closed);
            }
            if permits.available > 0 {
                permits.available -= 1;
                return Ok(());
            }
            permits = self
                .released
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Semaphore::acquire`], but gives up once `cancel` is set. The
    /// token is polled every `tick`.
    pub fn acquire_cancellable(
        &self,
        cancel: &CancelToken,
        tick: Duration,
    ) -> Result<(), AcquireError> {
        let mut permits = self.lock();
        loop {
            if permits.closed {
                return Err(AcquireError::Closed);
            }
            if permits.available > 0 {
                permits.available -= 1;
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }
            permits = self
                .released
                .wait_timeout(permits, tick)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn try_acquire(&self) -> Result<(), AcquireError> {
        let mut permits = self.lock();
        if permits.closed {
            Err(AcquireError::Closed)
        } else if permits.available == 0 {
            Err(AcquireError::WouldBlock)
        } else {
            permits.available -= 1;
            Ok(())
        }
    }

    pub fn release(&self) {
        self.lock().available += 1;
        self.released.notify_one();
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.released.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn available(&self) -> usize {
        self.lock().available
    }
}
