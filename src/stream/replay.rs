//! Cold replay source for late subscribers
//!
//! A subscriber arriving after the processor has terminated must still see
//! the tail of undrained data plus the terminal signal. The replay source
//! snapshots the retained range of the ring at hand-off and serves each late
//! subscriber through a serialized one-at-a-time drain that honors its
//! `request(n)` demand.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use crate::constants::UNBOUNDED_DEMAND;
use crate::error::RelayError;
use crate::stream::processor::BroadcastProcessor;
use crate::stream::{Publisher, Subscriber, Subscription};

/// One-shot publisher over the residual contents of a terminated processor
pub struct ReplaySource<T> {
    values: Arc<Vec<T>>,
    error: Option<Arc<RelayError>>,
    rejection: Option<RelayError>,
}

impl<T: Clone + Send + Sync + 'static> ReplaySource<T> {
    pub(crate) fn from_processor(
        processor: &BroadcastProcessor<T>,
        rejection: Option<RelayError>,
    ) -> Self {
        let ring = processor.ring();
        let cursor = ring.cursor_value();
        // Replay from the anchor, bounded by what the ring still retains
        let start = (processor.minimum_value() + 1)
            .max(cursor - ring.buffer_size() as i64 + 1)
            .max(0);
        let published = if start > cursor {
            cursor
        } else {
            ring.highest_published(start, cursor)
        };
        let mut values = Vec::new();
        for sequence in start..=published {
            if let Some(value) = ring.read(sequence) {
                values.push(value);
            }
        }
        Self {
            values: Arc::new(values),
            error: processor.terminal_error(),
            rejection,
        }
    }

    /// Serve one late subscriber: replayed values on demand, then the
    /// terminal signal
    pub fn subscribe(&self, mut subscriber: Box<dyn Subscriber<T>>) {
        let state = Arc::new(ReplayState {
            values: Arc::clone(&self.values),
            error: self.error.clone(),
            rejection: self.rejection.clone(),
            inner: Mutex::new(ReplayInner {
                subscriber: None,
                index: 0,
                done: false,
            }),
            requested: AtomicI64::new(0),
            wip: AtomicI32::new(0),
            cancelled: AtomicBool::new(false),
            fault: OnceCell::new(),
        });

        let subscription: Arc<dyn Subscription> = Arc::new(ReplaySubscription {
            state: Arc::clone(&state),
        });
        subscriber.on_subscribe(subscription);
        state.inner.lock().subscriber = Some(subscriber);
        // Deliver whatever the subscriber asked for during on_subscribe, or
        // the immediate terminal when there is nothing to replay
        drain(&state);
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for ReplaySource<T> {
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>) {
        ReplaySource::subscribe(self, subscriber);
    }
}

struct ReplayInner<T> {
    subscriber: Option<Box<dyn Subscriber<T>>>,
    index: usize,
    done: bool,
}

struct ReplayState<T> {
    values: Arc<Vec<T>>,
    error: Option<Arc<RelayError>>,
    rejection: Option<RelayError>,
    inner: Mutex<ReplayInner<T>>,
    requested: AtomicI64,
    wip: AtomicI32,
    cancelled: AtomicBool,
    fault: OnceCell<RelayError>,
}

struct ReplaySubscription<T> {
    state: Arc<ReplayState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Subscription for ReplaySubscription<T> {
    fn request(&self, n: i64) {
        if n <= 0 {
            let _ = self.state.fault.set(RelayError::InvalidDemand(n));
            drain(&self.state);
            return;
        }
        let mut current = self.state.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED_DEMAND {
                break;
            }
            let next = current.saturating_add(n);
            match self.state.requested.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        drain(&self.state);
    }

    fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }
}

/// Serialized drain loop: whichever thread wins the wip race does the work,
/// re-running for signals that arrived while it was busy.
fn drain<T: Clone + Send + Sync + 'static>(state: &Arc<ReplayState<T>>) {
    if state.wip.fetch_add(1, Ordering::AcqRel) != 0 {
        return;
    }
    let mut missed = 1;
    loop {
        {
            let mut inner = state.inner.lock();
            let ReplayInner {
                subscriber,
                index,
                done,
            } = &mut *inner;
            if let Some(subscriber) = subscriber.as_mut() {
                loop {
                    if *done || state.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    if let Some(fault) = state.fault.get() {
                        subscriber.on_error(Arc::new(fault.clone()));
                        *done = true;
                        break;
                    }
                    if *index >= state.values.len() {
                        *done = true;
                        match &state.error {
                            Some(error) => {
                                if let Some(rejection) = &state.rejection {
                                    debug!(%rejection, "suppressed rejection on replayed error");
                                }
                                subscriber.on_error(Arc::clone(error));
                            }
                            None => subscriber.on_complete(),
                        }
                        break;
                    }
                    let requested = state.requested.load(Ordering::Acquire);
                    if requested <= 0 {
                        break;
                    }
                    let value = state.values[*index].clone();
                    match subscriber.on_next(value) {
                        Ok(()) => {
                            *index += 1;
                            if requested != UNBOUNDED_DEMAND {
                                state.requested.fetch_sub(1, Ordering::AcqRel);
                            }
                        }
                        Err(error) => {
                            subscriber.on_error(Arc::new(error));
                            *done = true;
                            break;
                        }
                    }
                }
            }
        }
        let previous = state.wip.fetch_sub(missed, Ordering::AcqRel);
        missed = previous - missed;
        if missed == 0 {
            break;
        }
    }
}
