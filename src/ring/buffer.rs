//! Pre-allocated ring buffer over a sequencer
//!
//! The ring owns the slot array and adapts a [`Sequencer`] into a value-level
//! publish/read API. Slots live for the whole lifetime of the ring and are
//! reused on wrap-around; no per-signal allocation happens in steady state.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::ring::sequencer::Sequencer;
use crate::ring::Sequence;

/// Factory used to pre-fill every slot at construction, so that steady-state
/// publishing replaces values instead of populating empty cells
pub type ValueSupplier<T> = Arc<dyn Fn() -> T + Send + Sync>;

struct Slot<T> {
    value: UnsafeCell<Option<T>>,
}

/// Power-of-two ring of value slots shared by producers and consumers
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    index_mask: i64,
    sequencer: Arc<dyn Sequencer>,
}

// SAFETY: a slot is written only by the producer that claimed its sequence,
// between `next` and `publish`; consumers read it only after observing the
// publication (release store on the cursor or availability flag, acquire load
// on the consumer side). Gating sequences keep producers from reclaiming a
// slot before every registered consumer has moved past it.
unsafe impl<T: Send + Sync> Send for RingBuffer<T> {}
unsafe impl<T: Send + Sync> Sync for RingBuffer<T> {}

impl<T: Clone + Send + Sync + 'static> RingBuffer<T> {
    /// Create a ring of `buffer_size` slots coordinated by `sequencer`
    ///
    /// When a `supplier` is given, every slot is eagerly filled with
    /// `supplier()` at construction.
    pub fn new(
        buffer_size: usize,
        sequencer: Arc<dyn Sequencer>,
        supplier: Option<&ValueSupplier<T>>,
    ) -> Result<Self> {
        if buffer_size == 0 || !buffer_size.is_power_of_two() {
            return Err(RelayError::config("buffer size must be a power of 2"));
        }
        if buffer_size != sequencer.buffer_size() {
            return Err(RelayError::config(
                "ring and sequencer disagree on buffer size",
            ));
        }
        let prefill: Option<&(dyn Fn() -> T + Send + Sync)> =
            supplier.map(|factory| factory.as_ref());
        let slots = (0..buffer_size)
            .map(|_| Slot {
                value: UnsafeCell::new(prefill.map(|factory| factory())),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            slots,
            index_mask: (buffer_size - 1) as i64,
            sequencer,
        })
    }

    /// Claim one slot, write `value` into it and publish it.
    /// Blocks while the ring is full. Returns the published sequence.
    pub fn publish(&self, value: T) -> i64 {
        let sequence = self.sequencer.next(1);
        self.write(sequence, value);
        self.sequencer.publish(sequence, sequence);
        sequence
    }

    /// Like [`RingBuffer::publish`] but fails instead of blocking when full
    pub fn try_publish(&self, value: T) -> Result<i64> {
        let sequence = self.sequencer.try_next(1)?;
        self.write(sequence, value);
        self.sequencer.publish(sequence, sequence);
        Ok(sequence)
    }

    /// Claim one slot and publish the value produced by `f`, which receives
    /// the claimed sequence
    pub fn publish_with<F: FnOnce(i64) -> T>(&self, f: F) -> i64 {
        let sequence = self.sequencer.next(1);
        self.write(sequence, f(sequence));
        self.sequencer.publish(sequence, sequence);
        sequence
    }

    fn write(&self, sequence: i64, value: T) {
        let slot = &self.slots[(sequence & self.index_mask) as usize];
        // SAFETY: `sequence` was claimed exclusively by this producer and has
        // not been published yet, so no consumer reads this slot concurrently.
        unsafe {
            *slot.value.get() = Some(value);
        }
    }

    /// Clone the value at `sequence` out of the ring.
    ///
    /// Must only be called for sequences at or below the published cursor and
    /// above every producer's claim horizon minus the buffer size; barriers
    /// and gating sequences enforce this.
    pub fn read(&self, sequence: i64) -> Option<T> {
        let slot = &self.slots[(sequence & self.index_mask) as usize];
        // SAFETY: publication ordering guarantees the producer write to this
        // slot happened-before this read, and gating keeps writers away from
        // it until this consumer has advanced past `sequence`.
        unsafe { (*slot.value.get()).clone() }
    }

    /// Register a consumer gating sequence
    pub fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        self.sequencer.add_gating_sequence(sequence);
    }

    /// Unregister a consumer gating sequence; idempotent
    pub fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) {
        self.sequencer.remove_gating_sequence(sequence);
    }

    /// Snapshot of all registered gating sequences
    pub fn gating_sequences(&self) -> Vec<Arc<Sequence>> {
        self.sequencer.gating_sequences()
    }

    /// Minimum registered gating sequence, or `fallback` when none
    pub fn minimum_gating_sequence(&self, fallback: i64) -> i64 {
        self.sequencer.minimum_gating_sequence(fallback)
    }

    /// Current producer cursor value
    pub fn cursor_value(&self) -> i64 {
        self.sequencer.cursor().get()
    }

    /// Highest contiguously published sequence within `[low, high]`
    pub fn highest_published(&self, low: i64, high: i64) -> i64 {
        self.sequencer.get_highest_published(low, high)
    }

    /// Free slots at this instant (advisory under concurrency)
    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    /// Published-but-unconsumed slot count at this instant
    pub fn pending(&self) -> i64 {
        let cursor = self.cursor_value();
        cursor - self.minimum_gating_sequence(cursor)
    }

    /// Capacity of the ring
    pub fn buffer_size(&self) -> usize {
        self.slots.len()
    }

    /// The sequencer coordinating this ring
    pub fn sequencer(&self) -> &Arc<dyn Sequencer> {
        &self.sequencer
    }
}
