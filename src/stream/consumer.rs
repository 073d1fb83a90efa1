//! Per-subscriber consumer loop
//!
//! Every subscriber owns one dedicated task that follows the published cursor
//! through a [`SequenceBarrier`], pacing delivery with the subscriber's
//! pending demand. The task exits on cancellation, on a terminal signal, or
//! when the subscriber itself fails; its teardown (unregistering the gating
//! sequence, decrementing the subscriber count, triggering auto-cancel) runs
//! unconditionally via a drop guard.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;
use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::constants::{PARK_INTERVAL_NANOS, UNBOUNDED_DEMAND};
use crate::error::RelayError;
use crate::ring::SequenceBarrier;
use crate::ring::Sequence;
use crate::stream::processor::BroadcastProcessor;
use crate::stream::{EmptySubscription, Subscriber, Subscription};

/// Shared control block of one consumer: its ring position, its pending
/// demand and the flags its subscription handle flips
pub(crate) struct ConsumerState {
    pub(crate) sequence: Arc<Sequence>,
    pub(crate) barrier: SequenceBarrier,
    pending: AtomicI64,
    running: AtomicBool,
    cancelled: AtomicBool,
    fault: OnceCell<RelayError>,
}

impl ConsumerState {
    pub(crate) fn new(barrier: SequenceBarrier) -> Self {
        Self {
            sequence: Arc::new(Sequence::default()),
            barrier,
            pending: AtomicI64::new(0),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            fault: OnceCell::new(),
        }
    }

    pub(crate) fn position(&self) -> i64 {
        self.sequence.get()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_halted(&self) -> bool {
        self.is_cancelled() || !self.running.load(Ordering::Acquire)
    }

    fn fault_snapshot(&self) -> Option<RelayError> {
        self.fault.get().cloned()
    }
}

/// Demand and cancellation handle given to the subscriber in `on_subscribe`
struct ConsumerSubscription {
    state: Arc<ConsumerState>,
}

impl Subscription for ConsumerSubscription {
    fn request(&self, n: i64) {
        if n <= 0 {
            // Invalid demand faults this subscriber only; the consumer task
            // delivers the error on its own thread.
            let _ = self.state.fault.set(RelayError::InvalidDemand(n));
            self.state.barrier.alert();
            return;
        }
        let mut current = self.state.pending.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED_DEMAND {
                return;
            }
            let next = current.saturating_add(n);
            match self.state.pending.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.state.barrier.signal();
    }

    fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.running.store(false, Ordering::Release);
        self.state.barrier.alert();
    }
}

enum Abort {
    /// Cancelled or no longer running; exit without any further signal
    Halted,
    /// An invalid-demand fault is pending for this subscriber
    Fault,
    /// The processor terminated; the outer loop decides how to finish
    Terminated,
    /// The subscriber's `on_next` failed
    Subscriber(RelayError),
}

/// Removes the consumer from the processor when the task exits, however it
/// exits.
struct Teardown<T: Clone + Send + Sync + 'static> {
    processor: Arc<BroadcastProcessor<T>>,
    state: Arc<ConsumerState>,
}

impl<T: Clone + Send + Sync + 'static> Drop for Teardown<T> {
    fn drop(&mut self) {
        self.processor
            .ring()
            .remove_gating_sequence(&self.state.sequence);
        self.state.running.store(false, Ordering::Release);
        self.processor.consumer_departed(&self.state);
        debug!(
            processor = self.processor.name(),
            position = self.state.position(),
            "consumer departed"
        );
    }
}

/// The dedicated task driving one subscriber
pub(crate) struct ConsumerLoop<T: Clone + Send + Sync + 'static> {
    state: Arc<ConsumerState>,
    processor: Arc<BroadcastProcessor<T>>,
    subscriber: Box<dyn Subscriber<T>>,
}

impl<T: Clone + Send + Sync + 'static> ConsumerLoop<T> {
    pub(crate) fn new(
        state: Arc<ConsumerState>,
        processor: Arc<BroadcastProcessor<T>>,
        subscriber: Box<dyn Subscriber<T>>,
    ) -> Self {
        Self {
            state,
            processor,
            subscriber,
        }
    }

    pub(crate) fn into_subscriber(self) -> Box<dyn Subscriber<T>> {
        self.subscriber
    }

    pub(crate) fn run(mut self) {
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // The invocation that won the flag owns the registration and its
            // teardown; this one must not touch either.
            self.subscriber.on_subscribe(Arc::new(EmptySubscription));
            self.subscriber
                .on_error(Arc::new(RelayError::AlreadyRunning));
            return;
        }

        let _teardown = Teardown {
            processor: Arc::clone(&self.processor),
            state: Arc::clone(&self.state),
        };

        let subscription: Arc<dyn Subscription> = Arc::new(ConsumerSubscription {
            state: Arc::clone(&self.state),
        });
        self.subscriber.on_subscribe(subscription);

        // Honor a cancel that arrived before the task started
        if self.state.is_cancelled() {
            return;
        }

        self.process();
    }

    fn process(&mut self) {
        let mut next_sequence = self.state.sequence.get() + 1;
        loop {
            if self.state.is_halted() {
                return;
            }
            if self.state.fault_snapshot().is_some() {
                self.emit_fault();
                return;
            }

            let draining = self.processor.is_terminated();
            if draining {
                if let Some(error) = self.processor.terminal_error() {
                    self.subscriber.on_error(error);
                    return;
                }
                let cursor = self.state.barrier.cursor_value();
                if next_sequence > cursor {
                    self.subscriber.on_complete();
                    return;
                }
                // Residual data remains published ahead of us; clear the
                // terminal alert and drain it through the normal path.
                self.state.barrier.clear_alert();
            }

            match self.state.barrier.wait_for(next_sequence) {
                Ok(available) => {
                    while next_sequence <= available {
                        match self.deliver(next_sequence, draining) {
                            Ok(()) => next_sequence += 1,
                            Err(Abort::Halted) => return,
                            Err(Abort::Fault) => {
                                self.emit_fault();
                                return;
                            }
                            Err(Abort::Terminated) => break,
                            Err(Abort::Subscriber(error)) => {
                                // Isolate the failure: release the offending
                                // slot, fail this subscriber, leave the rest
                                // of the stream untouched.
                                self.state.sequence.set(next_sequence);
                                debug!(
                                    processor = self.processor.name(),
                                    sequence = next_sequence,
                                    %error,
                                    "subscriber failed in on_next"
                                );
                                self.subscriber.on_error(Arc::new(error));
                                return;
                            }
                        }
                    }
                    self.state.sequence.set(next_sequence - 1);
                    self.processor.signal_read_wait();
                }
                Err(error) if error.is_recoverable() => {
                    if self.state.is_halted() {
                        return;
                    }
                    if self.state.fault_snapshot().is_some() {
                        self.emit_fault();
                        return;
                    }
                    if self.processor.is_terminated() {
                        continue;
                    }
                    trace!(processor = self.processor.name(), "spurious alert");
                    self.state.barrier.clear_alert();
                }
                Err(error) => {
                    self.subscriber.on_error(Arc::new(error));
                    return;
                }
            }
        }
    }

    fn deliver(&mut self, sequence: i64, draining: bool) -> Result<(), Abort> {
        self.await_demand(draining)?;
        if let Some(value) = self.processor.ring().read(sequence) {
            if let Err(error) = self.subscriber.on_next(value) {
                return Err(Abort::Subscriber(error));
            }
        }
        Ok(())
    }

    /// Park until this subscriber has demand. While parked, cancellation,
    /// invalid-demand faults and (outside the terminal drain) termination
    /// all abort the wait.
    fn await_demand(&self, draining: bool) -> Result<(), Abort> {
        let backoff = Backoff::new();
        loop {
            if self.state.is_halted() {
                return Err(Abort::Halted);
            }
            if self.state.fault.get().is_some() {
                return Err(Abort::Fault);
            }
            let pending = self.state.pending.load(Ordering::Acquire);
            if pending == UNBOUNDED_DEMAND {
                return Ok(());
            }
            if pending > 0 {
                // Only this task ever decrements
                self.state.pending.fetch_sub(1, Ordering::AcqRel);
                return Ok(());
            }
            if !draining && self.processor.is_terminated() {
                return Err(Abort::Terminated);
            }
            if backoff.is_completed() {
                thread::park_timeout(Duration::from_nanos(PARK_INTERVAL_NANOS));
            } else {
                backoff.snooze();
            }
        }
    }

    fn emit_fault(&mut self) {
        if let Some(fault) = self.state.fault_snapshot() {
            self.subscriber.on_error(Arc::new(fault));
        }
    }
}
