//! Bounded drop-oldest queue over `crossbeam-channel`.
//!
//! The producer never blocks: when the channel is full it evicts the oldest
//! queued item and retries. Used between pipeline stages so a slow consumer
//! always sees the freshest frames.

use crossbeam_channel::{Receiver, SendError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct DropOldestSender<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for DropOldestSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

/// Consuming end. Dropping it makes further sends fail.
pub struct DropOldestReceiver<T> {
    rx: Receiver<T>,
    closed: Arc<AtomicBool>,
}

/// Create a queue holding at most `capacity` items (minimum 1).
pub fn drop_oldest<T>(capacity: usize) -> (DropOldestSender<T>, DropOldestReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    (
        DropOldestSender {
            tx,
            evict: rx.clone(),
            closed: Arc::clone(&closed),
        },
        DropOldestReceiver { rx, closed },
    )
}

impl<T> DropOldestSender<T> {
    /// Enqueue `item`, evicting older items while the queue is full.
    ///
    /// Returns the number of items evicted. Fails once the receiver is gone.
    pub fn send(&self, mut item: T) -> Result<usize, SendError<T>> {
        let mut evicted = 0;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(SendError(item));
            }
            match self.tx.try_send(item) {
                Ok(()) => return Ok(evicted),
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.evict.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                Err(TrySendError::Disconnected(back)) => return Err(SendError(back)),
            }
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

impl<T> DropOldestReceiver<T> {
    /// The underlying channel, for `recv_timeout` or `select!`.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

impl<T> Drop for DropOldestReceiver<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
