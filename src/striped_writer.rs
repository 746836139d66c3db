//! Striped buffered writer coordinated by compare-and-swap only.
//!
//! A drop-in for a mutex-guarded buffered writer when many threads write
//! to a fast sink. Producers are spread over 32 stripes by thread
//! identity; within a stripe, space is reserved with a claim CAS and
//! recorded with a publish CAS, so concurrent producers fill one buffer
//! without mutual exclusion. Only buffer rotation (flush) touches a lock,
//! and only to serialize the drained buffer onto the sink.
//!
//! Ordering: the bytes of a single `write` call land contiguously at the
//! sink. Ordering between distinct calls is not preserved; writers may
//! interleave on a stripe and stripes drain independently. That is the
//! price of CAS-only coordination.

use std::cell::UnsafeCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::error::{DrainpipeError, DrainpipeResult};
use crate::sink::Sink;

pub const BUFFER_SIZE: usize = 24576;
pub const STRIPE_COUNT: usize = 32;
const STRIPE_MASK: u64 = (STRIPE_COUNT as u64) - 1;

// The stripe state lives in one u64 so claim, publish, and rotation are
// each a single CAS:
//
//   bits  0..24   published  (bytes copied in)
//   bits 24..48   claimed    (bytes reserved)
//   bits 48..63   generation (bumped on every rotation)
//   bit  63       rotating   (buffer swap in progress)
const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const GEN_SHIFT: u32 = 48;
const GEN_MASK: u64 = (1 << 15) - 1;
const ROTATING_BIT: u64 = 1 << 63;

#[derive(Clone, Copy)]
struct StripeState {
    claimed: usize,
    published: usize,
    generation: u64,
    rotating: bool,
}

impl StripeState {
    fn decode(word: u64) -> Self {
        Self {
            published: (word & COUNT_MASK) as usize,
            claimed: ((word >> COUNT_BITS) & COUNT_MASK) as usize,
            generation: (word >> GEN_SHIFT) & GEN_MASK,
            rotating: word & ROTATING_BIT != 0,
        }
    }

    fn encode(self) -> u64 {
        let mut word = self.published as u64
            | ((self.claimed as u64) << COUNT_BITS)
            | ((self.generation & GEN_MASK) << GEN_SHIFT);
        if self.rotating {
            word |= ROTATING_BIT;
        }
        word
    }

    fn can_claim(&self, len: usize) -> bool {
        self.claimed + len <= BUFFER_SIZE
    }

    /// No producer is between its claim and its publish.
    fn quiet(&self) -> bool {
        self.published == self.claimed
    }
}

struct Stripe {
    state: AtomicU64,
    buffer: UnsafeCell<Box<[u8]>>,
}

// Safety: the state word serializes all buffer access. A successful claim
// CAS grants its caller exclusive ownership of [claimed, claimed+len) until
// the matching publish, and claim ranges never overlap. The buffer itself
// is only replaced under the ROTATING bit, which can only be taken while
// quiet, i.e. while no claim is outstanding.
unsafe impl Sync for Stripe {}

impl Stripe {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            buffer: UnsafeCell::new(vec![0u8; BUFFER_SIZE].into_boxed_slice()),
        }
    }
}

pub struct StripedWriter<S: Sink> {
    stripes: Vec<Stripe>,
    sink: Mutex<S>,
    closed: AtomicBool,
}

impl<S: Sink> StripedWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| Stripe::new()).collect(),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    /// Buffers `buf` on the calling thread's stripe. The bytes of one call
    /// stay contiguous; nothing reaches the sink until the stripe fills or
    /// an explicit flush.
    ///
    /// A request larger than the stripe buffer fails with
    /// `OversizedWrite` rather than spinning on a rotation that can never
    /// make room.
    pub fn write(&self, buf: &[u8]) -> DrainpipeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DrainpipeError::AlreadyClosed);
        }
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() > BUFFER_SIZE {
            return Err(DrainpipeError::OversizedWrite {
                len: buf.len(),
                capacity: BUFFER_SIZE,
            });
        }

        let index = stripe_index();
        let stripe = &self.stripes[index];

        // Claim: reserve [claimed, claimed+len) or rotate a full buffer.
        let offset = loop {
            let word = stripe.state.load(Ordering::Acquire);
            let state = StripeState::decode(word);
            if state.rotating {
                std::hint::spin_loop();
                continue;
            }
            if state.can_claim(buf.len()) {
                let mut next = state;
                next.claimed += buf.len();
                if stripe
                    .state
                    .compare_exchange(word, next.encode(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break state.claimed;
                }
            } else {
                self.flush_stripe(index)?;
            }
        };

        // The claim pins the buffer identity: rotation requires
        // published == claimed, which cannot hold again until this write
        // publishes. Disjoint claim ranges make the raw copy race-free.
        unsafe {
            let base = ptr::addr_of_mut!(**stripe.buffer.get()) as *mut u8;
            ptr::copy_nonoverlapping(buf.as_ptr(), base.add(offset), buf.len());
        }

        // Publish: record that the reserved range is filled.
        loop {
            let word = stripe.state.load(Ordering::Acquire);
            let mut next = StripeState::decode(word);
            next.published += buf.len();
            if stripe
                .state
                .compare_exchange(word, next.encode(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        Ok(())
    }

    pub fn write_byte(&self, byte: u8) -> DrainpipeResult<()> {
        self.write(&[byte])
    }

    /// Rotates every stripe with buffered bytes out to the sink.
    pub fn flush(&self) -> DrainpipeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DrainpipeError::AlreadyClosed);
        }
        self.flush_all()
    }

    /// Flushes residual bytes, waits for every stripe to go quiet, then
    /// closes the sink. Writers must have stopped by the time close is
    /// called; a write that races past the closed check keeps its bytes in
    /// the stripe. A second close fails.
    pub fn close(&self) -> DrainpipeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DrainpipeError::AlreadyClosed);
        }

        let flushed = self.flush_all();

        for stripe in &self.stripes {
            loop {
                let state = StripeState::decode(stripe.state.load(Ordering::Acquire));
                if !state.rotating && state.quiet() {
                    break;
                }
                std::hint::spin_loop();
            }
        }

        // Close the sink even when the residual flush failed.
        let closed = self.sink.lock().unwrap().close();
        flushed?;
        closed?;
        Ok(())
    }

    fn flush_all(&self) -> DrainpipeResult<()> {
        for index in 0..self.stripes.len() {
            self.flush_stripe(index)?;
        }
        Ok(())
    }

    /// Rotates one stripe: whoever wins the CAS swaps in a fresh buffer
    /// and owns draining the old one to the sink.
    fn flush_stripe(&self, index: usize) -> DrainpipeResult<()> {
        let stripe = &self.stripes[index];
        let mut first_generation = None;

        loop {
            let word = stripe.state.load(Ordering::Acquire);
            let state = StripeState::decode(word);
            let generation = *first_generation.get_or_insert(state.generation);

            if state.generation != generation {
                // someone else already rotated this buffer
                return Ok(());
            }
            if state.rotating {
                thread::yield_now();
                continue;
            }
            if state.claimed == 0 {
                // nothing to flush
                return Ok(());
            }
            if !state.quiet() {
                // wait for claimants to finish copying
                std::hint::spin_loop();
                continue;
            }

            let mut rotating = state;
            rotating.rotating = true;
            if stripe
                .state
                .compare_exchange(word, rotating.encode(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            // We own the rotation. Swap first so producers fill the fresh
            // buffer while the old one drains.
            let fresh = vec![0u8; BUFFER_SIZE].into_boxed_slice();
            let old = unsafe { std::mem::replace(&mut *stripe.buffer.get(), fresh) };
            let next = StripeState {
                claimed: 0,
                published: 0,
                generation: generation.wrapping_add(1) & GEN_MASK,
                rotating: false,
            };
            stripe.state.store(next.encode(), Ordering::Release);

            let mut sink = self.sink.lock().unwrap();
            sink.write(&old[..state.published])?;
            sink.flush()?;
            return Ok(());
        }
    }

    #[cfg(test)]
    fn stripe_counts(&self, index: usize) -> (usize, usize) {
        let state = StripeState::decode(self.stripes[index].state.load(Ordering::Acquire));
        (state.claimed, state.published)
    }
}

/// Stable stripe for the calling thread without thread-local storage.
fn stripe_index() -> usize {
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    (hasher.finish() & STRIPE_MASK) as usize
}

impl<S: Sink> Write for StripedWriter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        StripedWriter::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        StripedWriter::flush(self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSink;
    use std::sync::Arc;

    #[test]
    fn test_one_small_item_stays_buffered() {
        let sink = RecordingSink::new();
        let writer = StripedWriter::new(sink.clone());

        writer.write_byte(b'a').unwrap();

        assert_eq!(sink.bytes().len(), 0);
        assert!(!sink.was_flushed());
        assert!(!sink.was_closed());
    }

    #[test]
    fn test_filling_a_stripe_rotates_exactly_once() {
        let sink = RecordingSink::new();
        let writer = StripedWriter::new(sink.clone());

        for _ in 0..32000 {
            writer.write_byte(b'a').unwrap();
        }

        // One rotation at capacity; the remainder stays buffered.
        let flushed = sink.bytes();
        assert_eq!(flushed.len(), BUFFER_SIZE);
        assert!(flushed.iter().all(|b| *b == b'a'));
        assert!(!sink.was_closed());
    }

    #[test]
    fn test_close_drains_residual_bytes() {
        let sink = RecordingSink::new();
        let writer = StripedWriter::new(sink.clone());

        for _ in 0..3200 {
            writer.write(b"abcdefghij").unwrap();
        }
        writer.close().unwrap();

        let flushed = sink.bytes();
        assert_eq!(flushed.len(), 32000);
        assert!(sink.was_flushed());
        assert!(sink.was_closed());
        for chunk in flushed.chunks(10) {
            assert_eq!(chunk, b"abcdefghij");
        }
    }

    #[test]
    fn test_explicit_flush_drains_and_resets() {
        let sink = RecordingSink::new();
        let writer = StripedWriter::new(sink.clone());

        for _ in 0..32000 {
            writer.write_byte(b'a').unwrap();
        }
        writer.flush().unwrap();

        let flushed = sink.bytes();
        assert_eq!(flushed.len(), 32000);
        assert!(sink.was_flushed());
        assert!(flushed.iter().all(|b| *b == b'a'));
        assert!(!sink.was_closed());

        for index in 0..STRIPE_COUNT {
            assert_eq!(writer.stripe_counts(index), (0, 0));
        }
    }

    #[test]
    fn test_oversized_write_fails_loudly() {
        let writer = StripedWriter::new(RecordingSink::new());
        let oversized = vec![0u8; BUFFER_SIZE + 1];
        assert!(matches!(
            writer.write(&oversized),
            Err(DrainpipeError::OversizedWrite { .. })
        ));
    }

    #[test]
    fn test_write_of_exactly_buffer_size_is_accepted() {
        let sink = RecordingSink::new();
        let writer = StripedWriter::new(sink.clone());

        writer.write(&vec![b'x'; BUFFER_SIZE]).unwrap();
        writer.flush().unwrap();

        assert_eq!(sink.bytes().len(), BUFFER_SIZE);
    }

    #[test]
    fn test_write_after_close_fails() {
        let writer = StripedWriter::new(RecordingSink::new());
        writer.close().unwrap();
        assert!(matches!(
            writer.write(b"a"),
            Err(DrainpipeError::AlreadyClosed)
        ));
        assert!(matches!(writer.close(), Err(DrainpipeError::AlreadyClosed)));
    }

    #[test]
    fn test_concurrent_writes_stay_contiguous() {
        const CHUNK: usize = 100;
        const WRITES: usize = 400;

        let sink = RecordingSink::new();
        let writer = Arc::new(StripedWriter::new(sink.clone()));

        let handles: Vec<_> = (0..8u8)
            .map(|tag| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    let chunk = [tag; CHUNK];
                    for _ in 0..WRITES {
                        writer.write(&chunk).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        writer.close().unwrap();

        let bytes = sink.bytes();
        assert_eq!(bytes.len(), 8 * WRITES * CHUNK);

        // Calls may interleave across stripes, but each 100-byte write is
        // contiguous: every maximal run of one tag is a whole number of
        // chunks.
        let mut run_start = 0;
        for i in 1..=bytes.len() {
            if i == bytes.len() || bytes[i] != bytes[run_start] {
                assert_eq!((i - run_start) % CHUNK, 0, "split write at {run_start}");
                run_start = i;
            }
        }
    }
}
