//! Bounded producer/consumer queue.
//!
//! The hand-off point between network threads and application threads. A
//! FIFO under one lock, plus two counting semaphores: `slots` (free capacity,
//! starts at the capacity) and `items` (queued elements, starts at zero).
//! While the queue is open, `slots + items == capacity` whenever no call is
//! mid-flight.
//!
//! # Teardown
//!
//! [`BoundedQueue::close`] wakes every blocked producer and consumer and makes
//! all further ordinary calls fail. Only then may [`BoundedQueue::drain`] pull
//! the leftovers out; it bypasses both semaphores, so a drained queue is never
//! reopened.
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;

use super::{
    CancelToken,
    semaphore::{AcquireError, Semaphore},
};

/// A rejected [`BoundedQueue::produce`] hands the item back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError<T> {
    #[error("queue is closed")]
    Closed(T),
    #[error("produce was cancelled")]
    Cancelled(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Closed(item) | PushError::Cancelled(item) => item,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("drain requires a closed queue")]
pub struct DrainError;

#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    slots: Semaphore,
    available: Semaphore,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        Self {
            items: Mutex::new(VecDeque::new()),
            slots: Semaphore::new(capacity),
            available: Semaphore::new(0),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item`, blocking while the queue is full.
    pub fn produce(&self, item: T) -> Result<(), PushError<T>> {
        match self.slots.acquire() {
            Ok(()) => {
                self.push(item);
                Ok(())
            }
            Err(_) => Err(PushError::Closed(item)),
        }
    }

    /// [`BoundedQueue::produce`] that stops waiting for space once `cancel` is set.
    pub fn produce_cancellable(
        &self,
        item: T,
        cancel: &CancelToken,
        tick: Duration,
    ) -> Result<(), PushError<T>> {
        match self.slots.acquire_cancellable(cancel, tick) {
            Ok(()) => {
                self.push(item);
                Ok(())
            }
            Err(AcquireError::Cancelled) => Err(PushError::Cancelled(item)),
            Err(_) => Err(PushError::Closed(item)),
        }
    }

    fn push(&self, item: T) {
        self.lock().push_back(item);
        self.available.release();
    }

    /// Removes the head, blocking while the queue is empty. `None` once closed.
    pub fn consume(&self) -> Option<T> {
        self.available.acquire().ok()?;
        self.pop()
    }

    /// Removes the head if one is ready, never blocks.
    pub fn try_consume(&self) -> Option<T> {
        self.available.try_acquire().ok()?;
        self.pop()
    }

    fn pop(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.slots.release();
        }
        item
    }

    /// Stops the queue. Blocked and future ordinary calls fail.
    pub fn close(&self) {
        self.slots.close();
        self.available.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Teardown-only removal of the head, bypassing the semaphores.
    pub fn drain(&self) -> Result<Option<T>, DrainError> {
        if !self.is_closed() {
            return Err(DrainError);
        }
        Ok(self.lock().pop_front())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `(free slots, available items)` as the semaphores count them.
    pub fn counts(&self) -> (usize, usize) {
        (self.slots.available(), self.available.available())
    }
}
