//! The downstream byte-sink collaborator.

use std::io::{self, Write};

/// A write-only byte consumer with an explicit close.
///
/// Unlike `std::io::Write`, a sink never returns short counts (it consumes
/// everything it is given) and distinguishes `close` from `flush`: the
/// writers in this crate promise their sink is flushed and closed exactly
/// once when the writer itself shuts down, and callers can observe that.
pub trait Sink: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

/// Adapts any `std::io::Write` into a [`Sink`].
///
/// `close` flushes; dropping the wrapped writer (when the owning worker
/// exits) completes the close.
pub struct IoSink<W: Write + Send> {
    inner: W,
}

impl<W: Write + Send> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> Sink for IoSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
