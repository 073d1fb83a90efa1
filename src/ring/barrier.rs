//! Consumer-side sequence barrier

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::ring::sequencer::Sequencer;
use crate::ring::wait_strategy::WaitStrategy;
use crate::ring::Sequence;

/// Per-consumer view over the producer cursor, the shared wait strategy and
/// an alert flag.
///
/// An alert is a recoverable control signal, not a failure: it wakes the
/// consumer so it can re-check cancellation and termination state.
pub struct SequenceBarrier {
    sequencer: Arc<dyn Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
    cursor: Arc<Sequence>,
    alerted: AtomicBool,
}

impl SequenceBarrier {
    /// Create a barrier over the sequencer's cursor
    pub fn new(sequencer: Arc<dyn Sequencer>, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        let cursor = sequencer.cursor();
        Self {
            sequencer,
            wait_strategy,
            cursor,
            alerted: AtomicBool::new(false),
        }
    }

    /// Wait until `sequence` has been published and return the highest
    /// contiguously published sequence at or beyond it.
    ///
    /// Returns [`crate::RelayError::Alerted`] when the alert flag is raised
    /// before or during the wait.
    pub fn wait_for(&self, sequence: i64) -> Result<i64> {
        let available =
            self.wait_strategy
                .wait_for(sequence, &self.cursor, &self.cursor, &self.alerted)?;
        if available < sequence {
            return Ok(available);
        }
        Ok(self.sequencer.get_highest_published(sequence, available))
    }

    /// Current producer cursor value
    pub fn cursor_value(&self) -> i64 {
        self.cursor.get()
    }

    /// Raise the alert flag and wake all waiters
    pub fn alert(&self) {
        self.alerted.store(true, Ordering::Release);
        self.wait_strategy.signal_all_when_blocking();
    }

    /// Reset the alert flag after the consumer has handled it
    pub fn clear_alert(&self) {
        self.alerted.store(false, Ordering::Release);
    }

    /// Whether the alert flag is currently raised
    pub fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::Acquire)
    }

    /// Wake waiters without raising an alert
    pub fn signal(&self) {
        self.wait_strategy.signal_all_when_blocking();
    }
}
