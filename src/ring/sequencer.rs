//! Producer-side sequencers
//!
//! A sequencer hands out slot claims to producers and publishes them to
//! consumers. The single-producer variant advances a plain cursor; the
//! multi-producer variant lets any number of threads claim through a CAS loop
//! and tracks out-of-order publication with an availability buffer.
//!
//! Both variants gate claims on the registered consumer sequences so that a
//! producer can never overwrite a slot that some consumer has not yet read.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::constants::PARK_INTERVAL_NANOS;
use crate::error::{RelayError, Result};
use crate::ring::wait_strategy::WaitStrategy;
use crate::ring::Sequence;

/// Registry of consumer gating sequences
///
/// Readers may observe a stale snapshot; that is safe because the minimum
/// only ever moves upward.
pub(crate) struct GatingSequences {
    sequences: RwLock<Vec<Arc<Sequence>>>,
}

impl GatingSequences {
    fn new() -> Self {
        Self {
            sequences: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, sequence: Arc<Sequence>) {
        self.sequences.write().push(sequence);
    }

    /// Remove a registered sequence. Removing a non-member is a silent no-op.
    fn remove(&self, sequence: &Arc<Sequence>) {
        self.sequences
            .write()
            .retain(|s| !Arc::ptr_eq(s, sequence));
    }

    fn snapshot(&self) -> Vec<Arc<Sequence>> {
        self.sequences.read().clone()
    }

    fn minimum(&self, fallback: i64) -> i64 {
        self.sequences
            .read()
            .iter()
            .map(|s| s.get())
            .min()
            .unwrap_or(fallback)
    }
}

/// Trait for producer-side slot coordination
pub trait Sequencer: Send + Sync {
    /// Claim the next `n` slots, blocking while the ring is full.
    /// Returns the highest claimed sequence.
    fn next(&self, n: usize) -> i64;

    /// Claim the next `n` slots without blocking
    fn try_next(&self, n: usize) -> Result<i64>;

    /// Publish the claimed range `[low, high]` to consumers
    fn publish(&self, low: i64, high: i64);

    /// The producer cursor
    fn cursor(&self) -> Arc<Sequence>;

    /// Highest sequence in `[low, high]` up to which publication is contiguous.
    /// Returns `low - 1` when the slot at `low` is not yet published.
    fn get_highest_published(&self, low: i64, high: i64) -> i64;

    /// Register a consumer gating sequence
    fn add_gating_sequence(&self, sequence: Arc<Sequence>);

    /// Unregister a consumer gating sequence; idempotent
    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>);

    /// Snapshot of the registered gating sequences
    fn gating_sequences(&self) -> Vec<Arc<Sequence>>;

    /// Minimum over the registered gating sequences, or `fallback` when none
    fn minimum_gating_sequence(&self, fallback: i64) -> i64;

    /// Number of free slots at this instant (advisory under concurrency)
    fn remaining_capacity(&self) -> i64;

    /// Capacity of the ring this sequencer coordinates
    fn buffer_size(&self) -> usize;
}

fn check_buffer_size(buffer_size: usize) -> Result<()> {
    if buffer_size == 0 || !buffer_size.is_power_of_two() {
        return Err(RelayError::config("buffer size must be a power of 2"));
    }
    Ok(())
}

/// Sequencer for a single producer thread
///
/// `next_value` and `cached_gating` are only ever touched by the one
/// producing thread; they are atomics with relaxed ordering purely so the
/// type stays `Sync`.
pub struct SingleProducerSequencer {
    cursor: Arc<Sequence>,
    gating: GatingSequences,
    wait_strategy: Arc<dyn WaitStrategy>,
    buffer_size: usize,
    next_value: AtomicI64,
    cached_gating: AtomicI64,
}

impl SingleProducerSequencer {
    /// Create a single-producer sequencer over a ring of `buffer_size` slots
    pub fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        check_buffer_size(buffer_size)?;
        Ok(Self {
            cursor: Arc::new(Sequence::default()),
            gating: GatingSequences::new(),
            wait_strategy,
            buffer_size,
            next_value: AtomicI64::new(crate::constants::INITIAL_CURSOR_VALUE),
            cached_gating: AtomicI64::new(crate::constants::INITIAL_CURSOR_VALUE),
        })
    }
}

impl Sequencer for SingleProducerSequencer {
    fn next(&self, n: usize) -> i64 {
        debug_assert!(n >= 1);
        let n = n as i64;
        let next_value = self.next_value.load(Ordering::Relaxed);
        let next_sequence = next_value + n;
        let wrap_point = next_sequence - self.buffer_size as i64;
        let cached = self.cached_gating.load(Ordering::Relaxed);

        if wrap_point > cached || cached > next_value {
            loop {
                let min = self.gating.minimum(next_value);
                if wrap_point <= min {
                    self.cached_gating.store(min, Ordering::Relaxed);
                    break;
                }
                thread::park_timeout(Duration::from_nanos(PARK_INTERVAL_NANOS));
            }
        }

        self.next_value.store(next_sequence, Ordering::Relaxed);
        next_sequence
    }

    fn try_next(&self, n: usize) -> Result<i64> {
        debug_assert!(n >= 1);
        let n = n as i64;
        let next_value = self.next_value.load(Ordering::Relaxed);
        let next_sequence = next_value + n;
        let wrap_point = next_sequence - self.buffer_size as i64;
        let cached = self.cached_gating.load(Ordering::Relaxed);

        if wrap_point > cached || cached > next_value {
            let min = self.gating.minimum(next_value);
            self.cached_gating.store(min, Ordering::Relaxed);
            if wrap_point > min {
                return Err(RelayError::InsufficientCapacity);
            }
        }

        self.next_value.store(next_sequence, Ordering::Relaxed);
        Ok(next_sequence)
    }

    fn publish(&self, _low: i64, high: i64) {
        self.cursor.set(high);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn get_highest_published(&self, _low: i64, high: i64) -> i64 {
        // A single producer publishes in order; everything at or below the
        // cursor is visible.
        high
    }

    fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        self.gating.add(sequence);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) {
        self.gating.remove(sequence);
    }

    fn gating_sequences(&self) -> Vec<Arc<Sequence>> {
        self.gating.snapshot()
    }

    fn minimum_gating_sequence(&self, fallback: i64) -> i64 {
        self.gating.minimum(fallback)
    }

    fn remaining_capacity(&self) -> i64 {
        let produced = self.next_value.load(Ordering::Relaxed);
        let consumed = self.gating.minimum(produced);
        self.buffer_size as i64 - (produced - consumed)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Sequencer for concurrent producers
///
/// Claims race through a CAS loop on the shared cursor. Publication is
/// recorded per slot in the availability buffer: `avail[seq & mask]` holds
/// `seq >> log2(buffer_size)`, so a stale flag from a previous ring turn is
/// never mistaken for the current one.
pub struct MultiProducerSequencer {
    cursor: Arc<Sequence>,
    gating: GatingSequences,
    wait_strategy: Arc<dyn WaitStrategy>,
    buffer_size: usize,
    index_mask: i64,
    index_shift: u32,
    available: Box<[AtomicI32]>,
    cached_gating: AtomicI64,
}

impl MultiProducerSequencer {
    /// Create a multi-producer sequencer over a ring of `buffer_size` slots
    pub fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        check_buffer_size(buffer_size)?;
        let available = (0..buffer_size)
            .map(|_| AtomicI32::new(-1))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            cursor: Arc::new(Sequence::default()),
            gating: GatingSequences::new(),
            wait_strategy,
            buffer_size,
            index_mask: (buffer_size - 1) as i64,
            index_shift: buffer_size.trailing_zeros(),
            available,
            cached_gating: AtomicI64::new(crate::constants::INITIAL_CURSOR_VALUE),
        })
    }

    #[inline]
    fn availability_flag(&self, sequence: i64) -> i32 {
        (sequence >> self.index_shift) as i32
    }

    #[inline]
    fn set_available(&self, sequence: i64) {
        let index = (sequence & self.index_mask) as usize;
        self.available[index].store(self.availability_flag(sequence), Ordering::Release);
    }

    #[inline]
    fn is_available(&self, sequence: i64) -> bool {
        let index = (sequence & self.index_mask) as usize;
        self.available[index].load(Ordering::Acquire) == self.availability_flag(sequence)
    }
}

impl Sequencer for MultiProducerSequencer {
    fn next(&self, n: usize) -> i64 {
        debug_assert!(n >= 1);
        let n = n as i64;
        loop {
            let current = self.cursor.get();
            let next_sequence = current + n;
            let wrap_point = next_sequence - self.buffer_size as i64;
            let cached = self.cached_gating.load(Ordering::Relaxed);

            if wrap_point > cached || cached > current {
                let min = self.gating.minimum(current);
                if wrap_point > min {
                    thread::park_timeout(Duration::from_nanos(PARK_INTERVAL_NANOS));
                    continue;
                }
                self.cached_gating.store(min, Ordering::Relaxed);
            } else if self.cursor.compare_and_set(current, next_sequence) {
                return next_sequence;
            }
        }
    }

    fn try_next(&self, n: usize) -> Result<i64> {
        debug_assert!(n >= 1);
        let n = n as i64;
        loop {
            let current = self.cursor.get();
            let next_sequence = current + n;
            let wrap_point = next_sequence - self.buffer_size as i64;
            let min = self.gating.minimum(current);
            if wrap_point > min {
                return Err(RelayError::InsufficientCapacity);
            }
            if self.cursor.compare_and_set(current, next_sequence) {
                return Ok(next_sequence);
            }
        }
    }

    fn publish(&self, low: i64, high: i64) {
        for sequence in low..=high {
            self.set_available(sequence);
        }
        self.wait_strategy.signal_all_when_blocking();
    }

    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn get_highest_published(&self, low: i64, high: i64) -> i64 {
        for sequence in low..=high {
            if !self.is_available(sequence) {
                return sequence - 1;
            }
        }
        high
    }

    fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        self.gating.add(sequence);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) {
        self.gating.remove(sequence);
    }

    fn gating_sequences(&self) -> Vec<Arc<Sequence>> {
        self.gating.snapshot()
    }

    fn minimum_gating_sequence(&self, fallback: i64) -> i64 {
        self.gating.minimum(fallback)
    }

    fn remaining_capacity(&self) -> i64 {
        let produced = self.cursor.get();
        let consumed = self.gating.minimum(produced);
        self.buffer_size as i64 - (produced - consumed)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}
