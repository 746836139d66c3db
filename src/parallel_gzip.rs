//! Parallel gzip writer: pigz-style threading behind a stream interface.
//!
//! Compression is fanned out across worker threads while one dedicated
//! writer thread drains results in submission order, so compression never
//! stalls on I/O and parallelism stays invisible to decoders. Each chunk
//! is deflated independently and ends on a SYNC_FLUSH boundary; the
//! concatenation of chunk outputs plus a final empty block is a single
//! valid deflate stream inside one gzip member.
//!
//! For efficiency, pass reasonably sized chunks: no buffering is performed
//! here, so each `write` becomes one compression task and tiny chunks
//! compress poorly. The writer polls with short sleeps as back-off, so the
//! stream is intended to be used briskly and closed promptly.

use std::cell::UnsafeCell;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use flate2::{Compress, Compression, FlushCompress, Status};
use tracing::error;

use crate::blocking_queue::BlockingMpmcQueue;
use crate::error::{DrainpipeError, DrainpipeResult};
use crate::sink::Sink;

/// Fixed header: magic, deflate, no flags, zero mtime, Unix.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];

/// Initial per-worker scratch capacity; grows as chunks demand.
const SCRATCH_SIZE: usize = 1024;

/// Pending compression tasks before `write` blocks.
const JOB_QUEUE_CAPACITY: usize = 1024;

/// Writer back-off while the ordering queue is empty or its head is still
/// being compressed.
const WRITER_POLL: Duration = Duration::from_millis(1);

/// A compressed chunk together with the uncompressed bytes it came from;
/// the writer needs the parent for CRC and length accounting.
struct Deflated {
    compressed: Vec<u8>,
    raw: Vec<u8>,
}

/// Ordering token: filled by exactly one compression worker, consumed by
/// the writer thread once `ready` flips.
struct Slot {
    ready: AtomicBool,
    result: UnsafeCell<Option<DrainpipeResult<Deflated>>>,
}

// Safety: the single worker that took the job writes `result` before its
// Release store to `ready`; the writer thread reads only after an Acquire
// load observes true.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            result: UnsafeCell::new(None),
        }
    }

    fn fill(&self, result: DrainpipeResult<Deflated>) {
        unsafe {
            *self.result.get() = Some(result);
        }
        self.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<DrainpipeResult<Deflated>> {
        unsafe { (*self.result.get()).take() }
    }
}

/// Entries on the writer's FIFO. Control markers ride the same queue as
/// data so they keep their place in the submission order.
enum Entry {
    Data(Arc<Slot>),
    Flush,
    Close,
}

struct Job {
    input: Vec<u8>,
    slot: Arc<Slot>,
}

pub struct ParallelGzipWriter {
    entries: Arc<SegQueue<Entry>>,
    jobs: Arc<BlockingMpmcQueue<Job>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    failure: Arc<OnceLock<String>>,
}

impl ParallelGzipWriter {
    /// Writes the gzip header on the calling thread, then starts `workers`
    /// compressor threads plus the dedicated writer thread that owns the
    /// sink from here on.
    pub fn new<S: Sink + 'static>(mut sink: S, workers: usize) -> DrainpipeResult<Self> {
        if workers == 0 {
            return Err(DrainpipeError::invalid_argument(
                "parallel gzip writer needs at least one compression worker",
            ));
        }

        sink.write(&GZIP_HEADER)?;

        let entries: Arc<SegQueue<Entry>> = Arc::new(SegQueue::new());
        let jobs: Arc<BlockingMpmcQueue<Job>> =
            Arc::new(BlockingMpmcQueue::new(JOB_QUEUE_CAPACITY));
        let failure: Arc<OnceLock<String>> = Arc::new(OnceLock::new());

        let worker_handles = (0..workers)
            .map(|_| {
                let jobs = Arc::clone(&jobs);
                thread::spawn(move || compress_loop(jobs))
            })
            .collect();

        let writer = {
            let entries = Arc::clone(&entries);
            let failure = Arc::clone(&failure);
            thread::spawn(move || writer_loop(entries, sink, failure))
        };

        Ok(Self {
            entries,
            jobs,
            writer: Mutex::new(Some(writer)),
            workers: Mutex::new(worker_handles),
            closed: AtomicBool::new(false),
            failure,
        })
    }

    /// Copies `buf` and submits it for compression. The copy is essential:
    /// compression is asynchronous and the caller may reuse its buffer the
    /// moment this returns. Empty input is dropped without a task.
    ///
    /// Blocks when the job queue is full.
    pub fn write(&self, buf: &[u8]) -> DrainpipeResult<()> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(());
        }

        let slot = Arc::new(Slot::new());
        // Appending here is the serialization point: workers may finish in
        // any order, the queue preserves submission order.
        self.entries.push(Entry::Data(Arc::clone(&slot)));
        self.jobs.put(Job {
            input: buf.to_vec(),
            slot,
        })?;
        Ok(())
    }

    pub fn write_byte(&self, byte: u8) -> DrainpipeResult<()> {
        self.write(&[byte])
    }

    /// Queues a flush of the sink behind everything written so far.
    pub fn flush(&self) -> DrainpipeResult<()> {
        self.check_open()?;
        self.entries.push(Entry::Flush);
        Ok(())
    }

    /// Queues the close marker, then joins the writer and the worker pool.
    /// The writer finishes the stream (final empty block + trailer),
    /// flushes and closes the sink before it exits. A second close fails.
    pub fn close(&self) -> DrainpipeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DrainpipeError::AlreadyClosed);
        }

        self.entries.push(Entry::Close);

        let handle = self.writer.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                let _ = self.failure.set("writer thread panicked".to_string());
            }
        }

        self.jobs.shutdown();
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
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
}

impl Write for ParallelGzipWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ParallelGzipWriter::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        ParallelGzipWriter::flush(self)?;
        Ok(())
    }
}

impl Drop for ParallelGzipWriter {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

/// Reusable compressor state, one per worker thread, created on the first
/// job and kept for the life of the thread. Never shared.
struct CompressorState {
    deflater: Compress,
    scratch: Vec<u8>,
}

impl CompressorState {
    fn new() -> Self {
        Self {
            // Raw deflate: the gzip framing is written by the writer thread.
            deflater: Compress::new(Compression::default(), false),
            scratch: Vec::with_capacity(SCRATCH_SIZE),
        }
    }

    /// Deflates one chunk as complete blocks ended by a SYNC_FLUSH
    /// boundary, so downstream decoders re-synchronise between chunks.
    fn deflate_chunk(&mut self, input: Vec<u8>) -> DrainpipeResult<Deflated> {
        self.deflater.reset();
        self.scratch.clear();

        let mut remaining = &input[..];
        loop {
            if self.scratch.len() == self.scratch.capacity() {
                self.scratch.reserve(SCRATCH_SIZE);
            }
            let before_in = self.deflater.total_in();
            let before_out = self.deflater.total_out();

            let status = self
                .deflater
                .compress_vec(remaining, &mut self.scratch, FlushCompress::Sync)
                .map_err(DrainpipeError::compression)?;

            let consumed = (self.deflater.total_in() - before_in) as usize;
            let produced = (self.deflater.total_out() - before_out) as usize;
            remaining = &remaining[consumed..];

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // Flush is complete once all input is consumed and a
                    // call with spare output space produces nothing.
                    if remaining.is_empty()
                        && produced == 0
                        && self.scratch.len() < self.scratch.capacity()
                    {
                        break;
                    }
                }
            }
        }

        Ok(Deflated {
            compressed: self.scratch.clone(),
            raw: input,
        })
    }
}

fn compress_loop(jobs: Arc<BlockingMpmcQueue<Job>>) {
    let mut state: Option<CompressorState> = None;
    while let Ok(job) = jobs.take() {
        let state = state.get_or_insert_with(CompressorState::new);
        let result = state.deflate_chunk(job.input);
        job.slot.fill(result);
    }
}

fn writer_loop<S: Sink>(entries: Arc<SegQueue<Entry>>, mut sink: S, failure: Arc<OnceLock<String>>) {
    let mut total_bytes: u64 = 0;
    let mut crc = crc32fast::Hasher::new();

    let outcome: DrainpipeResult<()> = loop {
        let Some(entry) = entries.pop() else {
            thread::sleep(WRITER_POLL);
            continue;
        };

        match entry {
            Entry::Data(slot) => {
                while !slot.is_ready() {
                    thread::sleep(WRITER_POLL);
                }
                let Some(result) = slot.take() else { continue };
                match result {
                    Ok(block) => {
                        if let Err(e) = sink.write(&block.compressed) {
                            break Err(e.into());
                        }
                        total_bytes = total_bytes.wrapping_add(block.raw.len() as u64);
                        crc.update(&block.raw);
                    }
                    Err(e) => break Err(e),
                }
            }
            Entry::Flush => {
                if let Err(e) = sink.flush() {
                    break Err(e.into());
                }
            }
            Entry::Close => {
                break write_trailer(&mut sink, crc, total_bytes)
                    .and_then(|()| sink.flush().map_err(DrainpipeError::from))
                    .and_then(|()| sink.close().map_err(DrainpipeError::from));
            }
        }
    };

    if let Err(e) = outcome {
        // The caller that submitted the failing chunk has long since
        // returned; report out-of-band, latch for the next caller, and do
        // not write a trailer over an indeterminate stream.
        error!("parallel gzip writer stopped: {e}");
        let _ = failure.set(e.to_string());
        let _ = sink.flush();
        let _ = sink.close();
    }
}

/// Ends the deflate stream with an empty final block, then writes the
/// 8-byte trailer: CRC32 of the uncompressed input, and its length mod
/// 2^32, both little-endian.
fn write_trailer<S: Sink>(
    sink: &mut S,
    crc: crc32fast::Hasher,
    total_bytes: u64,
) -> DrainpipeResult<()> {
    let mut deflater = Compress::new(Compression::default(), false);
    let mut block = Vec::with_capacity(16);
    loop {
        let status = deflater
            .compress_vec(&[], &mut block, FlushCompress::Finish)
            .map_err(DrainpipeError::compression)?;
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if block.len() == block.capacity() {
                    block.reserve(16);
                }
            }
        }
    }
    sink.write(&block)?;

    let mut trailer = [0u8; 8];
    trailer[..4].copy_from_slice(&crc.finalize().to_le_bytes());
    trailer[4..].copy_from_slice(&((total_bytes & 0xffff_ffff) as u32).to_le_bytes());
    sink.write(&trailer)?;
    Ok(())
}
