//! drainpipe - concurrent byte-stream sinks
//!
//! High-throughput primitives for the case where many producers push bytes
//! at a sink and a mutex-guarded buffered writer is the bottleneck. Each
//! component is a write-only stream (`write` / `flush` / `close`) that puts
//! one or more background threads between the producers and the sink:
//!
//! - [`BlockingMpmcQueue`]: blocking `put`/`take` facade over a bounded
//!   lock-free MPMC ring, for contended executor task queues
//! - [`AsyncWriter`]: hands immutable chunks to a single drain thread over
//!   a bounded FIFO, strict enqueue order at the sink
//! - [`StripedWriter`]: buffered writer striped across 32 lock-free
//!   claim/publish buffers, no mutual exclusion on the write path
//! - [`ParallelGzipWriter`]: gzip output with compression fanned out over
//!   a worker pool and a dedicated writer thread draining in order
//!
//! The components share idioms (tagged sentinel messages, sleep-spin
//! back-off, whole-chunk copies at hand-off) but no data structures; each
//! is used on its own.

mod async_writer;
mod blocking_queue;
mod error;
mod parallel_gzip;
mod sink;
mod striped_writer;
#[cfg(test)]
mod test_utils;

pub use async_writer::AsyncWriter;
pub use blocking_queue::BlockingMpmcQueue;
pub use error::{DrainpipeError, DrainpipeResult};
pub use parallel_gzip::ParallelGzipWriter;
pub use sink::{IoSink, Sink};
pub use striped_writer::{StripedWriter, BUFFER_SIZE, STRIPE_COUNT};
