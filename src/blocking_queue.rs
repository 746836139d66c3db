//! Blocking facade over a bounded lock-free MPMC ring.
//!
//! Wraps `crossbeam`'s array queue with `put`/`take` that sleep-spin until
//! they succeed. This trades wakeup latency for zero allocation and no
//! parking machinery, which is the right trade for a contended executor
//! task queue under steady load. Not much else is supported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;

use crate::error::{DrainpipeError, DrainpipeResult};

const RETRY_SLEEP: Duration = Duration::from_millis(10);

pub struct BlockingMpmcQueue<T> {
    ring: ArrayQueue<T>,
    stop: AtomicBool,
}

impl<T> BlockingMpmcQueue<T> {
    /// Creates a queue with a fixed capacity. Capacity is set once; there
    /// is no growth.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity),
            stop: AtomicBool::new(false),
        }
    }

    /// Blocks until the ring accepts the element.
    ///
    /// Fails with `Interrupted` if the queue has been shut down.
    pub fn put(&self, item: T) -> DrainpipeResult<()> {
        let mut item = item;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Err(DrainpipeError::Interrupted("put on a shut-down queue"));
            }
            match self.ring.push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    item = rejected;
                    thread::sleep(RETRY_SLEEP);
                }
            }
        }
    }

    /// Blocks until an element is available.
    ///
    /// A shut-down queue drains its remaining elements before failing with
    /// `Interrupted`.
    pub fn take(&self) -> DrainpipeResult<T> {
        loop {
            if let Some(item) = self.ring.pop() {
                return Ok(item);
            }
            if self.stop.load(Ordering::Acquire) {
                return Err(DrainpipeError::Interrupted("take on a shut-down queue"));
            }
            thread::sleep(RETRY_SLEEP);
        }
    }

    /// Cancels blocked and future `put`/`take` calls.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn offer_timeout(&self, _item: T, _timeout: Duration) -> DrainpipeResult<()> {
        Err(DrainpipeError::Unsupported("offer with timeout"))
    }

    pub fn poll_timeout(&self, _timeout: Duration) -> DrainpipeResult<T> {
        Err(DrainpipeError::Unsupported("poll with timeout"))
    }

    pub fn drain_to(&self, _dest: &mut Vec<T>) -> DrainpipeResult<usize> {
        Err(DrainpipeError::Unsupported("drain_to"))
    }

    pub fn remaining_capacity(&self) -> DrainpipeResult<usize> {
        Err(DrainpipeError::Unsupported("remaining_capacity"))
    }
}
