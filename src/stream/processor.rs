//! Broadcast processor façade
//!
//! A [`BroadcastProcessor`] fans every published value out to all active
//! subscribers in publication order. Producers coordinate through the ring's
//! sequencer; each subscriber runs its own consumer task and paces delivery
//! with its demand. The processor can also subscribe to an upstream publisher,
//! in which case a dedicated replenishment task converts consumer progress
//! into upstream `request(n)` calls.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::constants::{PARK_INTERVAL_NANOS, REPLENISH_DIVISOR};
use crate::error::{RelayError, Result};
use crate::executor::{TaskExecutor, ThreadPerTaskExecutor};
use crate::ring::{
    MultiProducerSequencer, RingBuffer, Sequence, SequenceBarrier, Sequencer,
    SingleProducerSequencer, ValueSupplier, WaitStrategy, WaitStrategyFactory,
};
use crate::stream::consumer::{ConsumerLoop, ConsumerState};
use crate::stream::replay::ReplaySource;
use crate::stream::{EmptySubscription, ProcessorConfig, Publisher, Subscriber, Subscription};

/// Builder for [`BroadcastProcessor`]
///
/// Carries a [`ProcessorConfig`] plus the options that cannot be described
/// declaratively: a custom executor, a caller-supplied wait strategy and a
/// slot value supplier.
pub struct ProcessorBuilder<T: Clone + Send + Sync + 'static> {
    config: ProcessorConfig,
    executor: Option<Arc<dyn TaskExecutor>>,
    wait_strategy: Option<Arc<dyn WaitStrategy>>,
    value_supplier: Option<ValueSupplier<T>>,
}

impl<T: Clone + Send + Sync + 'static> Default for ProcessorBuilder<T> {
    fn default() -> Self {
        Self {
            config: ProcessorConfig::default(),
            executor: None,
            wait_strategy: None,
            value_supplier: None,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ProcessorBuilder<T> {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a declarative configuration wholesale
    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Label worker threads. Ignored for thread naming when a custom
    /// executor drives the workers.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the ring capacity; validated at build time
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.config.buffer_size = buffer_size;
        self
    }

    /// Select one of the standard wait strategies
    pub fn wait_strategy(mut self, kind: crate::ring::WaitStrategyKind) -> Self {
        self.config.wait_strategy = kind;
        self
    }

    /// Supply a custom wait strategy, overriding the configured kind
    pub fn custom_wait_strategy(mut self, strategy: Arc<dyn WaitStrategy>) -> Self {
        self.wait_strategy = Some(strategy);
        self
    }

    /// Allow concurrent publishers (multi-producer sequencer)
    pub fn shared(mut self, shared: bool) -> Self {
        self.config.shared = shared;
        self
    }

    /// Cancel the upstream subscription when the last subscriber leaves
    pub fn auto_cancel(mut self, auto_cancel: bool) -> Self {
        self.config.auto_cancel = auto_cancel;
        self
    }

    /// Drive consumer tasks with a custom executor
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Pre-fill every slot with `supplier()` at construction
    pub fn value_supplier(mut self, supplier: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.value_supplier = Some(Arc::new(supplier));
        self
    }

    /// Validate the configuration and construct the processor
    pub fn build(self) -> Result<Arc<BroadcastProcessor<T>>> {
        let config = self.config;
        if config.buffer_size == 0 || !config.buffer_size.is_power_of_two() {
            return Err(RelayError::config("buffer size must be a power of 2"));
        }

        let wait_strategy = self
            .wait_strategy
            .unwrap_or_else(|| WaitStrategyFactory::create(config.wait_strategy));
        let sequencer: Arc<dyn Sequencer> = if config.shared {
            Arc::new(MultiProducerSequencer::new(
                config.buffer_size,
                Arc::clone(&wait_strategy),
            )?)
        } else {
            Arc::new(SingleProducerSequencer::new(
                config.buffer_size,
                Arc::clone(&wait_strategy),
            )?)
        };
        let ring = Arc::new(RingBuffer::new(
            config.buffer_size,
            Arc::clone(&sequencer),
            self.value_supplier.as_ref(),
        )?);
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ThreadPerTaskExecutor::new()));

        Ok(Arc::new_cyclic(|self_ref| BroadcastProcessor {
            self_ref: self_ref.clone(),
            name: config.name,
            auto_cancel: config.auto_cancel,
            shared: config.shared,
            ring,
            sequencer,
            wait_strategy,
            executor,
            minimum: Arc::new(Sequence::default()),
            subscriber_count: AtomicUsize::new(0),
            worker_counter: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            error: OnceCell::new(),
            upstream: Mutex::new(None),
            has_upstream: AtomicBool::new(false),
            upstream_cancelled: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        }))
    }
}

/// Multi-producer / multi-subscriber in-memory broadcast processor
///
/// Every active subscriber observes the same totally-ordered sequence of
/// values; late subscribers tail-follow from the current cursor, while the
/// first subscriber replays from the `minimum` anchor. After termination,
/// subscribers are served by a cold [`ReplaySource`] over the residual ring
/// contents.
pub struct BroadcastProcessor<T: Clone + Send + Sync + 'static> {
    /// Handle to the owning `Arc`, used to equip consumer tasks with a
    /// back-pointer; always upgradable while a caller holds the processor
    self_ref: Weak<BroadcastProcessor<T>>,
    name: String,
    auto_cancel: bool,
    shared: bool,
    ring: Arc<RingBuffer<T>>,
    sequencer: Arc<dyn Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
    executor: Arc<dyn TaskExecutor>,
    /// Upstream request anchor; also the replay start for a first subscriber
    minimum: Arc<Sequence>,
    subscriber_count: AtomicUsize,
    worker_counter: AtomicUsize,
    started: AtomicBool,
    terminating: AtomicBool,
    terminated: AtomicBool,
    error: OnceCell<Arc<RelayError>>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    has_upstream: AtomicBool,
    upstream_cancelled: AtomicBool,
    consumers: Mutex<Vec<Weak<ConsumerState>>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for BroadcastProcessor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastProcessor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> BroadcastProcessor<T> {
    /// Start building a processor
    pub fn builder() -> ProcessorBuilder<T> {
        ProcessorBuilder::new()
    }

    /// Create a processor with default configuration and the given name
    pub fn create(name: impl Into<String>) -> Result<Arc<Self>> {
        Self::builder().name(name).build()
    }

    /// Attach a subscriber.
    ///
    /// On a terminated processor the subscriber is served by a cold replay of
    /// the residual ring contents instead. If the executor rejects the
    /// consumer task, the rejection is surfaced to this subscriber only.
    pub fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>) {
        if self.is_terminated() {
            self.replay_source(None).subscribe(subscriber);
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        let barrier = SequenceBarrier::new(Arc::clone(&self.sequencer), Arc::clone(&self.wait_strategy));
        let state = Arc::new(ConsumerState::new(barrier));

        let previous = self.subscriber_count.fetch_add(1, Ordering::AcqRel);
        let cursor = self.ring.cursor_value();
        let start = if previous == 0 {
            // First subscriber replays from the anchor, bounded by what the
            // ring still retains
            self.minimum
                .get()
                .max(cursor - self.ring.buffer_size() as i64)
        } else {
            cursor
        };
        state.sequence.set(start);
        self.ring.add_gating_sequence(Arc::clone(&state.sequence));
        self.consumers.lock().push(Arc::downgrade(&state));
        self.started.store(true, Ordering::Release);
        debug!(
            processor = %self.name,
            start,
            tail_follow = previous != 0,
            "subscriber attached"
        );

        let worker_id = self.worker_counter.fetch_add(1, Ordering::Relaxed);
        let worker = format!("{}-{}", self.name, worker_id);
        let task = Arc::new(Mutex::new(Some(ConsumerLoop::new(
            Arc::clone(&state),
            this,
            subscriber,
        ))));
        let task_in_worker = Arc::clone(&task);
        let outcome = self.executor.execute(
            &worker,
            Box::new(move || {
                if let Some(consumer) = task_in_worker.lock().take() {
                    consumer.run();
                }
            }),
        );

        if let Err(rejection) = outcome {
            // The task never ran; undo the registration and surface the
            // rejection to this subscriber alone.
            self.ring.remove_gating_sequence(&state.sequence);
            self.forget_consumer(&state);
            self.subscriber_count.fetch_sub(1, Ordering::AcqRel);
            let Some(consumer) = task.lock().take() else {
                return;
            };
            let mut subscriber = consumer.into_subscriber();
            if self.is_terminated() && rejection.is_shutdown_rejection() {
                self.replay_source(Some(rejection)).subscribe(subscriber);
            } else {
                debug!(processor = %self.name, %rejection, "consumer task rejected");
                subscriber.on_subscribe(Arc::new(EmptySubscription));
                subscriber.on_error(Arc::new(rejection));
            }
        }
    }

    /// Publish one value to all subscribers.
    ///
    /// Blocks while the ring is full. Calls after a terminal signal are
    /// dropped. Concurrent calls are only permitted on a `shared` processor.
    pub fn on_next(&self, value: T) {
        if self.is_terminated() {
            trace!(processor = %self.name, "value dropped after terminal signal");
            return;
        }
        self.ring.publish(value);
    }

    /// Publish one value without blocking, failing when the ring is full
    pub fn try_publish(&self, value: T) -> Result<i64> {
        if self.is_terminated() {
            return Err(RelayError::unexpected("processor is terminated"));
        }
        self.ring.try_publish(value)
    }

    /// Terminate the stream with an error. Active subscribers drain their
    /// prefix and then receive `on_error`; late subscribers get the stored
    /// error from the cold replay source.
    pub fn on_error(&self, error: RelayError) {
        self.terminate(Some(Arc::new(error)));
    }

    pub(crate) fn on_error_shared(&self, error: Arc<RelayError>) {
        self.terminate(Some(error));
    }

    /// Terminate the stream normally. Active subscribers drain their prefix
    /// and then receive `on_complete`.
    pub fn on_complete(&self) {
        self.terminate(None);
    }

    fn terminate(&self, error: Option<Arc<RelayError>>) {
        if self
            .terminating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(error) = error {
            let _ = self.error.set(error);
        }
        // The stored error must be visible before consumers observe the flag
        self.terminated.store(true, Ordering::Release);
        debug!(
            processor = %self.name,
            error = ?self.error.get(),
            "terminated"
        );
        for state in self.consumer_states() {
            state.barrier.alert();
        }
        self.wait_strategy.signal_all_when_blocking();
    }

    /// Attach this processor to an upstream publisher's subscription.
    ///
    /// Starts the request-replenishment task, which pulls from the upstream
    /// in ring-bounded chunks as consumers drain.
    pub fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.is_terminated() {
            subscription.cancel();
            return;
        }
        {
            let mut upstream = self.upstream.lock();
            if upstream.is_some() {
                // Already subscribed; a second upstream must be rejected
                subscription.cancel();
                return;
            }
            *upstream = Some(Arc::clone(&subscription));
        }
        self.has_upstream.store(true, Ordering::Release);
        self.started.store(true, Ordering::Release);
        self.minimum.set(self.ring.cursor_value());
        self.ring.add_gating_sequence(Arc::clone(&self.minimum));

        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let task = RequestTask {
            processor: this,
            upstream: subscription,
        };
        let name = format!("{}-request-task", self.name);
        if let Err(error) = thread::Builder::new().name(name).spawn(move || task.run()) {
            debug!(processor = %self.name, %error, "failed to start request task");
        }
    }

    /// Wrap this processor as a boxed [`Subscriber`] so it can be handed to
    /// any [`Publisher`]
    pub fn as_subscriber(&self) -> Box<dyn Subscriber<T>> {
        // self_ref comes from `Arc::new_cyclic` at construction; it stays
        // upgradable for as long as this method is callable
        let processor = self
            .self_ref
            .upgrade()
            .expect("processor is only reachable through its Arc");
        Box::new(ProcessorSubscriber { processor })
    }

    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.ring.buffer_size()
    }

    /// Free slots at this instant; advisory under concurrency
    pub fn remaining_capacity(&self) -> i64 {
        self.ring.remaining_capacity()
    }

    /// Alias of [`BroadcastProcessor::remaining_capacity`]
    pub fn available_capacity(&self) -> i64 {
        self.ring.remaining_capacity()
    }

    /// Published-but-unconsumed slot count at this instant
    pub fn pending(&self) -> i64 {
        self.ring.pending()
    }

    /// Number of active subscribers
    pub fn downstream_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Acquire)
    }

    /// Ring positions of the active subscribers; advisory under concurrency
    pub fn downstream_positions(&self) -> Vec<i64> {
        self.consumer_states()
            .iter()
            .map(|state| state.position())
            .collect()
    }

    /// Whether any subscriber or upstream was ever attached
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether a terminal signal has been issued
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Whether the processor still accepts values and live subscribers
    pub fn is_alive(&self) -> bool {
        !self.is_terminated()
    }

    /// The worker-thread label
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this processor allows concurrent publishers
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// The stored terminal error, if the stream failed
    pub fn terminal_error(&self) -> Option<Arc<RelayError>> {
        self.error.get().cloned()
    }

    pub(crate) fn ring(&self) -> &Arc<RingBuffer<T>> {
        &self.ring
    }

    pub(crate) fn minimum_value(&self) -> i64 {
        self.minimum.get()
    }

    /// Wake a replenishment task blocked on consumer progress
    pub(crate) fn signal_read_wait(&self) {
        if self.has_upstream.load(Ordering::Acquire) {
            self.wait_strategy.signal_all_when_blocking();
        }
    }

    pub(crate) fn consumer_departed(&self, state: &Arc<ConsumerState>) {
        self.forget_consumer(state);
        let previous = self.subscriber_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.auto_cancel {
            self.cancel_upstream();
        }
        self.signal_read_wait();
    }

    fn cancel_upstream(&self) {
        let upstream = self.upstream.lock();
        if let Some(subscription) = upstream.as_ref() {
            if self
                .upstream_cancelled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(processor = %self.name, "cancelling upstream subscription");
                subscription.cancel();
            }
        }
    }

    fn consumer_states(&self) -> Vec<Arc<ConsumerState>> {
        self.consumers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn forget_consumer(&self, state: &Arc<ConsumerState>) {
        self.consumers
            .lock()
            .retain(|weak| weak.upgrade().is_some_and(|s| !Arc::ptr_eq(&s, state)));
    }

    fn replay_source(&self, rejection: Option<RelayError>) -> ReplaySource<T> {
        ReplaySource::from_processor(self, rejection)
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for BroadcastProcessor<T> {
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>) {
        BroadcastProcessor::subscribe(self, subscriber);
    }
}

/// Adapter that lets a processor consume an upstream publisher
pub struct ProcessorSubscriber<T: Clone + Send + Sync + 'static> {
    processor: Arc<BroadcastProcessor<T>>,
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for ProcessorSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.processor.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        self.processor.on_next(value);
        Ok(())
    }

    fn on_error(&mut self, error: Arc<RelayError>) {
        self.processor.on_error_shared(error);
    }

    fn on_complete(&mut self) {
        self.processor.on_complete();
    }
}

/// Converts consumer progress into upstream demand.
///
/// Requests one ring's worth up front, then another chunk each time the
/// consumers have drained past the current anchor, advancing the `minimum`
/// anchor as it goes. Exits when the processor dies or the upstream is
/// cancelled.
struct RequestTask<T: Clone + Send + Sync + 'static> {
    processor: Arc<BroadcastProcessor<T>>,
    upstream: Arc<dyn Subscription>,
}

impl<T: Clone + Send + Sync + 'static> RequestTask<T> {
    fn run(self) {
        let buffer_size = self.processor.ring.buffer_size();
        let limit = if buffer_size == 1 {
            1
        } else {
            (buffer_size - (buffer_size / REPLENISH_DIVISOR).max(1)) as i64
        };
        self.upstream.request(buffer_size as i64);

        let mut anchor = self.processor.minimum.get();
        loop {
            let target = anchor + limit;
            loop {
                if !self.processor.is_alive()
                    || self.processor.upstream_cancelled.load(Ordering::Acquire)
                {
                    return;
                }
                if self.read_progress() >= target {
                    break;
                }
                thread::park_timeout(Duration::from_nanos(PARK_INTERVAL_NANOS));
            }
            self.processor.minimum.set(target);
            self.upstream.request(limit);
            anchor = target;
        }
    }

    /// Minimum consumer position, excluding the request anchor itself
    fn read_progress(&self) -> i64 {
        let cursor = self.processor.ring.cursor_value();
        self.processor
            .ring
            .gating_sequences()
            .iter()
            .filter(|sequence| !Arc::ptr_eq(sequence, &self.processor.minimum))
            .map(|sequence| sequence.get())
            .min()
            .unwrap_or(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rejects_non_power_of_two() {
        let result = BroadcastProcessor::<u64>::builder().buffer_size(6).build();
        assert!(matches!(
            result.unwrap_err(),
            RelayError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_initial_introspection() {
        let processor = BroadcastProcessor::<u64>::builder()
            .name("probe")
            .buffer_size(16)
            .build()
            .unwrap();
        assert_eq!(processor.capacity(), 16);
        assert_eq!(processor.remaining_capacity(), 16);
        assert_eq!(processor.pending(), 0);
        assert_eq!(processor.downstream_count(), 0);
        assert!(!processor.is_started());
        assert!(processor.is_alive());
        assert!(!processor.is_shared());
        assert_eq!(processor.name(), "probe");
    }

    #[test]
    fn test_terminal_signal_is_sticky() {
        let processor = BroadcastProcessor::<u64>::create("once").unwrap();
        processor.on_error(RelayError::unexpected("boom"));
        processor.on_complete();
        assert!(processor.is_terminated());
        assert_eq!(
            processor.terminal_error(),
            Some(Arc::new(RelayError::unexpected("boom")))
        );
    }

    #[test]
    fn test_publish_after_terminal_is_dropped() {
        let processor = BroadcastProcessor::<u64>::builder()
            .buffer_size(8)
            .build()
            .unwrap();
        processor.on_next(1);
        processor.on_complete();
        processor.on_next(2);
        assert_eq!(processor.ring().cursor_value(), 0);
        assert!(processor.try_publish(3).is_err());
    }

    #[test]
    fn test_shared_processor_accepts_concurrent_publishers() {
        let processor = BroadcastProcessor::<u64>::builder()
            .buffer_size(1024)
            .shared(true)
            .build()
            .unwrap();
        let mut handles = Vec::new();
        for p in 0..4u64 {
            let processor = Arc::clone(&processor);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    processor.on_next(p * 1000 + i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(processor.ring().cursor_value(), 399);
        assert_eq!(processor.pending(), 0);
    }
}
