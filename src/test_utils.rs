//! Shared test doubles for the writer components.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::sink::Sink;

/// In-memory sink recording bytes and flush/close transitions, with a
/// cloneable observer handle that stays usable after the sink instance
/// moves into a writer.
#[derive(Clone, Default)]
pub struct RecordingSink {
    shared: Arc<Recorded>,
}

#[derive(Default)]
struct Recorded {
    data: Mutex<Vec<u8>>,
    flushed: AtomicBool,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.shared.data.lock().unwrap().clone()
    }

    pub fn was_flushed(&self) -> bool {
        self.shared.flushed.load(Ordering::Acquire)
    }

    pub fn was_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Sink for RecordingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.shared.data.lock().unwrap().extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.flushed.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Sink that accepts the first `fail_after` bytes and then fails every
/// write, for exercising worker error paths.
#[derive(Clone)]
pub struct FailingSink {
    shared: Arc<Recorded>,
    fail_after: usize,
}

impl FailingSink {
    /// Fails from the very first write.
    pub fn new() -> Self {
        Self::after(0)
    }

    /// Accepts `limit` bytes before failing.
    pub fn after(limit: usize) -> Self {
        Self {
            shared: Arc::new(Recorded::default()),
            fail_after: limit,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.shared.data.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Sink for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut data = self.shared.data.lock().unwrap();
        if data.len() + buf.len() > self.fail_after {
            return Err(io::Error::other("injected sink failure"));
        }
        data.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.flushed.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }
}
