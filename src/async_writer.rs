//! Hand-off writer: producers enqueue chunks, one thread drains the sink.
//!
//! This lets a producer keep generating data while the next stage performs
//! the actual output work. The queue is a bounded FIFO, so a slow sink
//! applies backpressure by blocking `write` once 64 chunks are pending.
//!
//! Chunks reach the sink in enqueue order. With several producers the
//! serialization point is the channel send; no stronger cross-producer
//! ordering is promised.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use tracing::error;

use crate::error::{DrainpipeError, DrainpipeResult};
use crate::sink::Sink;

/// Pending chunks before `write` blocks.
const QUEUE_CAPACITY: usize = 64;

/// Max chunks the worker pulls off the queue between sink flushes.
const DRAIN_BATCH: usize = 128;

enum Message {
    Data(Vec<u8>),
    Flush(SyncSender<()>),
    Close,
}

pub struct AsyncWriter {
    tx: SyncSender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    failure: Arc<OnceLock<String>>,
}

impl AsyncWriter {
    /// Starts the drain thread. The sink is owned by that thread from here
    /// on; it is flushed after every drained batch and flushed + closed
    /// when the writer closes.
    pub fn new<S: Sink + 'static>(sink: S) -> Self {
        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let failure = Arc::new(OnceLock::new());

        let worker = {
            let failure = Arc::clone(&failure);
            thread::spawn(move || drain_loop(rx, sink, failure))
        };

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            failure,
        }
    }

    /// Copies `buf` and enqueues it, blocking while the queue is full.
    /// Empty input returns without enqueueing anything.
    pub fn write(&self, buf: &[u8]) -> DrainpipeResult<()> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.send(Message::Data(buf.to_vec()))
    }

    /// Enqueues a single-byte chunk.
    pub fn write_byte(&self, byte: u8) -> DrainpipeResult<()> {
        self.write(&[byte])
    }

    /// Enqueues a flush marker and waits for the worker to pass it, so the
    /// sink has been flushed by the time this returns.
    pub fn flush(&self) -> DrainpipeResult<()> {
        self.check_open()?;
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.send(Message::Flush(ack_tx))?;
        ack_rx.recv().map_err(|_| self.worker_gone())
    }

    /// Enqueues the close marker and joins the drain thread. The sink is
    /// flushed and closed before this returns. A second close fails.
    pub fn close(&self) -> DrainpipeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DrainpipeError::AlreadyClosed);
        }

        // The worker may already be gone after a sink failure; it has
        // closed the sink on its way out, so only the join remains.
        let _ = self.tx.send(Message::Close);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                let _ = self.failure.set("drain thread panicked".to_string());
            }
        }

        if let Some(msg) = self.failure.get() {
            return Err(DrainpipeError::Worker(msg.clone()));
        }
        Ok(())
    }

    fn check_open(&self) -> DrainpipeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DrainpipeError::AlreadyClosed);
        }
        if let Some(msg) = self.failure.get() {
            return Err(DrainpipeError::Worker(msg.clone()));
        }
        Ok(())
    }

    fn send(&self, message: Message) -> DrainpipeResult<()> {
        self.tx.send(message).map_err(|_| self.worker_gone())
    }

    fn worker_gone(&self) -> DrainpipeError {
        match self.failure.get() {
            Some(msg) => DrainpipeError::Worker(msg.clone()),
            None => DrainpipeError::Interrupted("drain thread is gone"),
        }
    }
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        AsyncWriter::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        AsyncWriter::flush(self)?;
        Ok(())
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

fn drain_loop<S: Sink>(rx: Receiver<Message>, mut sink: S, failure: Arc<OnceLock<String>>) {
    let mut batch = Vec::with_capacity(DRAIN_BATCH);

    let outcome: DrainpipeResult<()> = 'outer: loop {
        // Block for the first message, then grab whatever else is ready.
        let first = match rx.recv() {
            Ok(message) => message,
            // All handles dropped without an explicit close.
            Err(_) => break Ok(()),
        };
        batch.push(first);
        while batch.len() < DRAIN_BATCH {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        for message in batch.drain(..) {
            match message {
                Message::Data(bytes) => {
                    if let Err(e) = sink.write(&bytes) {
                        break 'outer Err(e.into());
                    }
                }
                Message::Flush(ack) => {
                    if let Err(e) = sink.flush() {
                        break 'outer Err(e.into());
                    }
                    let _ = ack.send(());
                }
                Message::Close => break 'outer Ok(()),
            }
        }

        if let Err(e) = sink.flush() {
            break 'outer Err(e.into());
        }
    };

    if let Err(e) = outcome {
        // The producer that triggered this has long since returned, so
        // report out-of-band and latch for the next caller.
        error!("async writer drain failed: {e}");
        let _ = failure.set(e.to_string());
    }

    if let Err(e) = sink.flush() {
        error!("async writer: final sink flush failed: {e}");
    }
    if let Err(e) = sink.close() {
        error!("async writer: sink close failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingSink, RecordingSink};
    use std::time::Duration;

    #[test]
    fn test_chunks_arrive_in_order() {
        let sink = RecordingSink::new();
        let writer = AsyncWriter::new(sink.clone());

        for byte in *b"abcdefg" {
            writer.write(&[byte]).unwrap();
        }
        writer.close().unwrap();

        assert_eq!(sink.bytes(), b"abcdefg");
        assert!(sink.was_flushed());
        assert!(sink.was_closed());
    }

    #[test]
    fn test_zero_length_write_is_not_a_close() {
        let sink = RecordingSink::new();
        let writer = AsyncWriter::new(sink.clone());

        writer.write(&[]).unwrap();
        writer.write(b"").unwrap();
        thread::sleep(Duration::from_millis(10));

        assert!(!sink.was_closed());
        assert_eq!(sink.bytes().len(), 0);

        writer.close().unwrap();
        assert!(sink.was_flushed());
        assert!(sink.was_closed());
    }

    #[test]
    fn test_close_without_writes_flushes_and_closes() {
        let sink = RecordingSink::new();
        let writer = AsyncWriter::new(sink.clone());

        writer.close().unwrap();

        assert!(sink.was_flushed());
        assert!(sink.was_closed());
        assert_eq!(sink.bytes().len(), 0);
    }

    #[test]
    fn test_double_close_fails() {
        let writer = AsyncWriter::new(RecordingSink::new());
        writer.close().unwrap();
        assert!(matches!(writer.close(), Err(DrainpipeError::AlreadyClosed)));
    }

    #[test]
    fn test_write_after_close_fails() {
        let writer = AsyncWriter::new(RecordingSink::new());
        writer.close().unwrap();
        assert!(matches!(
            writer.write(b"x"),
            Err(DrainpipeError::AlreadyClosed)
        ));
    }

    #[test]
    fn test_flush_waits_for_sink_flush() {
        let sink = RecordingSink::new();
        let writer = AsyncWriter::new(sink.clone());

        writer.write(b"payload").unwrap();
        writer.flush().unwrap();

        assert_eq!(sink.bytes(), b"payload");
        assert!(sink.was_flushed());
        assert!(!sink.was_closed());

        writer.close().unwrap();
    }

    #[test]
    fn test_sink_failure_is_latched_and_sink_still_closed() {
        let sink = FailingSink::new();
        let writer = AsyncWriter::new(sink.clone());

        writer.write(b"doomed").unwrap();

        // The drain thread dies on the failed write; subsequent calls
        // surface the latched error instead of queueing silently.
        let mut latched = false;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(10));
            if matches!(writer.write(b"x"), Err(DrainpipeError::Worker(_))) {
                latched = true;
                break;
            }
        }
        assert!(latched);
        assert!(sink.was_closed());

        assert!(matches!(writer.close(), Err(DrainpipeError::Worker(_))));
    }

    #[test]
    fn test_many_producers_many_chunks() {
        let sink = RecordingSink::new();
        let writer = Arc::new(AsyncWriter::new(sink.clone()));

        let handles: Vec<_> = (0..4u8)
            .map(|tag| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for _ in 0..500 {
                        writer.write(&[tag; 16]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        writer.close().unwrap();

        let bytes = sink.bytes();
        assert_eq!(bytes.len(), 4 * 500 * 16);
        // Each enqueued chunk stays contiguous at the sink.
        for chunk in bytes.chunks(16) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }
}
