//! End-to-end broadcast processor tests
//!
//! These tests drive the processor the way applications do: real producer
//! threads, real per-subscriber consumer tasks, and assertions on the exact
//! signal sequences each subscriber observes.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use relay::{
    BroadcastProcessor, RelayError, Result, Subscriber, Subscription, ThreadPerTaskExecutor,
};

const UNBOUNDED: i64 = i64::MAX;

#[derive(Default)]
struct Events {
    values: Mutex<Vec<u64>>,
    errors: Mutex<Vec<RelayError>>,
    completed: AtomicBool,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
}

impl Events {
    fn values(&self) -> Vec<u64> {
        self.values.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<RelayError> {
        self.errors.lock().unwrap().clone()
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn has_subscription(&self) -> bool {
        self.subscription.lock().unwrap().is_some()
    }

    fn request(&self, n: i64) {
        let subscription = self.subscription.lock().unwrap().clone().unwrap();
        subscription.request(n);
    }

    fn cancel(&self) {
        let subscription = self.subscription.lock().unwrap().clone().unwrap();
        subscription.cancel();
    }

    fn terminal_count(&self) -> usize {
        self.errors.lock().unwrap().len() + usize::from(self.is_completed())
    }
}

struct TestSubscriber {
    events: Arc<Events>,
    initial_request: i64,
    fail_on: Option<u64>,
}

impl TestSubscriber {
    fn new(events: &Arc<Events>, initial_request: i64) -> Box<Self> {
        Box::new(Self {
            events: Arc::clone(events),
            initial_request,
            fail_on: None,
        })
    }

    fn failing_on(events: &Arc<Events>, initial_request: i64, value: u64) -> Box<Self> {
        Box::new(Self {
            events: Arc::clone(events),
            initial_request,
            fail_on: Some(value),
        })
    }
}

impl Subscriber<u64> for TestSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.initial_request != 0 {
            subscription.request(self.initial_request);
        }
        *self.events.subscription.lock().unwrap() = Some(subscription);
    }

    fn on_next(&mut self, value: u64) -> Result<()> {
        if self.fail_on == Some(value) {
            return Err(RelayError::subscriber("intentional failure"));
        }
        self.events.values.lock().unwrap().push(value);
        Ok(())
    }

    fn on_error(&mut self, error: Arc<RelayError>) {
        self.events.errors.lock().unwrap().push((*error).clone());
    }

    fn on_complete(&mut self) {
        self.events.completed.store(true, Ordering::SeqCst);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn assert_eventually(condition: impl Fn() -> bool, what: &str) {
    assert!(
        wait_until(Duration::from_secs(5), condition),
        "timed out waiting for: {what}"
    );
}

#[test]
fn tail_follow_subscriber_misses_earlier_values() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("tail-follow")
        .buffer_size(8)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, 0));

    processor.on_next(1);
    processor.on_next(2);
    processor.on_next(3);

    let b = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&b, 0));

    processor.on_next(4);
    processor.on_next(5);

    assert_eventually(|| a.has_subscription() && b.has_subscription(), "subscriptions");
    a.request(UNBOUNDED);
    b.request(UNBOUNDED);

    assert_eventually(|| a.values().len() == 5, "A to drain");
    assert_eventually(|| b.values().len() == 2, "B to drain");
    assert_eq!(a.values(), vec![1, 2, 3, 4, 5]);
    assert_eq!(b.values(), vec![4, 5]);

    processor.on_complete();
    assert_eventually(|| a.is_completed() && b.is_completed(), "completions");
}

#[test]
fn first_subscriber_replays_history() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("replay")
        .buffer_size(8)
        .build()
        .unwrap();

    processor.on_next(1);
    processor.on_next(2);
    processor.on_next(3);

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, UNBOUNDED));

    assert_eventually(|| a.values().len() == 3, "replayed history");
    assert_eq!(a.values(), vec![1, 2, 3]);
    assert!(!a.is_completed());
}

#[test]
fn producer_blocks_while_subscriber_has_no_demand() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("backpressure")
        .buffer_size(4)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, 0));
    assert_eventually(|| a.has_subscription(), "subscription");

    let produced = Arc::new(AtomicUsize::new(0));
    let producer = {
        let processor = Arc::clone(&processor);
        let produced = Arc::clone(&produced);
        thread::spawn(move || {
            for value in 1..=5u64 {
                processor.on_next(value);
                produced.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // Four values fill the ring; the fifth publish has to wait for the
    // demand-less subscriber
    assert_eventually(|| produced.load(Ordering::SeqCst) == 4, "ring to fill");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(produced.load(Ordering::SeqCst), 4);
    assert!(a.values().is_empty());

    a.request(UNBOUNDED);
    assert_eventually(|| produced.load(Ordering::SeqCst) == 5, "producer to resume");
    assert_eventually(|| a.values().len() == 5, "subscriber to drain");
    assert_eq!(a.values(), vec![1, 2, 3, 4, 5]);
    producer.join().unwrap();
}

#[test]
fn delivery_pauses_until_demand_is_replenished() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("demand")
        .buffer_size(8)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, 2));

    for value in 1..=5u64 {
        processor.on_next(value);
    }

    assert_eventually(|| a.values().len() == 2, "requested prefix");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(a.values(), vec![1, 2]);

    a.request(3);
    assert_eventually(|| a.values().len() == 5, "replenished demand");
    assert_eq!(a.values(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn subscriber_failure_is_isolated() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("isolation")
        .buffer_size(8)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    let b = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::failing_on(&a, UNBOUNDED, 3));
    processor.subscribe(TestSubscriber::new(&b, UNBOUNDED));

    for value in 1..=5u64 {
        processor.on_next(value);
    }
    processor.on_complete();

    assert_eventually(|| a.errors().len() == 1, "A to fail");
    assert_eq!(a.values(), vec![1, 2]);
    assert!(!a.is_completed());
    assert_eq!(
        a.errors(),
        vec![RelayError::subscriber("intentional failure")]
    );

    assert_eventually(|| b.is_completed(), "B to complete");
    assert_eq!(b.values(), vec![1, 2, 3, 4, 5]);
    assert!(b.errors().is_empty());
}

#[test]
fn late_subscriber_is_served_by_cold_replay() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("late")
        .buffer_size(8)
        .build()
        .unwrap();

    processor.on_next(1);
    processor.on_next(2);
    processor.on_next(3);
    processor.on_complete();

    let c = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&c, UNBOUNDED));

    // Replay is driven synchronously by the requesting side
    assert_eq!(c.values(), vec![1, 2, 3]);
    assert!(c.is_completed());
}

#[test]
fn late_subscriber_receives_stored_error_after_tail() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("late-error")
        .buffer_size(8)
        .build()
        .unwrap();

    processor.on_next(1);
    processor.on_next(2);
    processor.on_error(RelayError::unexpected("boom"));

    let c = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&c, UNBOUNDED));

    assert_eq!(c.values(), vec![1, 2]);
    assert_eq!(c.errors(), vec![RelayError::unexpected("boom")]);
    assert!(!c.is_completed());
}

#[test]
fn active_subscriber_receives_terminal_error() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("error")
        .buffer_size(8)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, UNBOUNDED));

    processor.on_next(1);
    processor.on_next(2);
    processor.on_error(RelayError::unexpected("boom"));

    assert_eventually(|| a.errors().len() == 1, "A to observe the error");
    assert_eq!(a.errors(), vec![RelayError::unexpected("boom")]);
    assert!(!a.is_completed());
    // The delivered prefix is whatever drained before the error surfaced
    let prefix = a.values();
    assert!(prefix == vec![1, 2] || prefix == vec![1] || prefix.is_empty());
    assert_eq!(a.terminal_count(), 1);
}

struct CountingUpstream {
    cancels: Arc<AtomicUsize>,
    requested: Arc<AtomicI64>,
}

impl Subscription for CountingUpstream {
    fn request(&self, n: i64) {
        self.requested.fetch_add(n, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn auto_cancel_propagates_upstream_exactly_once() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("auto-cancel")
        .buffer_size(8)
        .auto_cancel(true)
        .build()
        .unwrap();

    let cancels = Arc::new(AtomicUsize::new(0));
    let requested = Arc::new(AtomicI64::new(0));
    processor.on_subscribe(Arc::new(CountingUpstream {
        cancels: Arc::clone(&cancels),
        requested: Arc::clone(&requested),
    }));
    assert_eventually(|| requested.load(Ordering::SeqCst) >= 8, "initial request");

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, UNBOUNDED));
    assert_eventually(|| a.has_subscription(), "A subscription");

    a.cancel();
    assert_eventually(|| cancels.load(Ordering::SeqCst) == 1, "upstream cancel");

    // The processor is still alive; a new subscriber works and no further
    // upstream cancel is ever issued
    let b = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&b, UNBOUNDED));
    assert_eventually(|| b.has_subscription(), "B subscription");

    processor.on_next(9);
    assert_eventually(|| b.values() == vec![9], "B to receive");

    b.cancel();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_subscriber_receives_nothing_further() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("cancel")
        .buffer_size(8)
        .auto_cancel(false)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, UNBOUNDED));

    processor.on_next(1);
    processor.on_next(2);
    assert_eventually(|| a.values().len() == 2, "prefix");

    a.cancel();
    assert_eventually(|| processor.downstream_count() == 0, "teardown");

    processor.on_next(3);
    processor.on_complete();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(a.values(), vec![1, 2]);
    assert_eq!(a.terminal_count(), 0);
}

#[test]
fn invalid_demand_faults_only_the_offender() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("bad-demand")
        .buffer_size(8)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    let b = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, 0));
    processor.subscribe(TestSubscriber::new(&b, UNBOUNDED));
    assert_eventually(|| a.has_subscription(), "A subscription");

    processor.on_next(1);
    processor.on_next(2);
    a.request(-1);

    assert_eventually(|| a.errors().len() == 1, "A to fault");
    assert_eq!(a.errors(), vec![RelayError::InvalidDemand(-1)]);
    assert!(a.values().is_empty());

    processor.on_next(3);
    processor.on_complete();
    assert_eventually(|| b.is_completed(), "B unaffected");
    assert_eq!(b.values(), vec![1, 2, 3]);
}

#[test]
fn all_subscribers_observe_the_same_order_with_shared_producers() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("total-order")
        .buffer_size(1024)
        .shared(true)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    let b = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, UNBOUNDED));
    processor.subscribe(TestSubscriber::new(&b, UNBOUNDED));

    let mut producers = Vec::new();
    for p in 0..2u64 {
        let processor = Arc::clone(&processor);
        producers.push(thread::spawn(move || {
            for i in 0..100u64 {
                processor.on_next(p * 1000 + i);
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }
    processor.on_complete();

    assert_eventually(|| a.is_completed() && b.is_completed(), "both to complete");
    let a_values = a.values();
    let b_values = b.values();
    assert_eq!(a_values.len(), 200);
    assert_eq!(a_values, b_values);

    // Each producer's own values stay in publication order
    for p in 0..2u64 {
        let own: Vec<u64> = a_values
            .iter()
            .copied()
            .filter(|v| v / 1000 == p)
            .collect();
        let mut sorted = own.clone();
        sorted.sort_unstable();
        assert_eq!(own, sorted);
    }
}

#[test]
fn executor_rejection_is_surfaced_to_the_subscriber() {
    init_tracing();
    let executor = Arc::new(ThreadPerTaskExecutor::new());
    executor.shutdown();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("rejected")
        .buffer_size(8)
        .executor(executor)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, 0));

    assert!(a.has_subscription());
    assert_eq!(a.errors(), vec![RelayError::ExecutorShutDown]);
    assert_eq!(processor.downstream_count(), 0);
}

#[test]
fn termination_drains_remaining_values_before_completing() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("drain")
        .buffer_size(8)
        .build()
        .unwrap();

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, 0));
    assert_eventually(|| a.has_subscription(), "subscription");

    for value in 1..=4u64 {
        processor.on_next(value);
    }
    processor.on_complete();

    // No demand yet: the terminal must wait for the prefix
    thread::sleep(Duration::from_millis(50));
    assert!(!a.is_completed());
    assert!(a.values().is_empty());

    a.request(UNBOUNDED);
    assert_eventually(|| a.is_completed(), "drain then complete");
    assert_eq!(a.values(), vec![1, 2, 3, 4]);
    assert_eq!(a.terminal_count(), 1);
}

#[test]
fn introspection_tracks_downstreams() {
    init_tracing();
    let processor = BroadcastProcessor::<u64>::builder()
        .name("introspect")
        .buffer_size(16)
        .build()
        .unwrap();
    assert!(!processor.is_started());

    let a = Arc::new(Events::default());
    processor.subscribe(TestSubscriber::new(&a, UNBOUNDED));
    assert!(processor.is_started());
    assert_eq!(processor.downstream_count(), 1);
    assert_eq!(processor.downstream_positions().len(), 1);

    processor.on_next(1);
    assert_eventually(|| a.values() == vec![1], "delivery");
    assert_eventually(|| processor.pending() == 0, "gating catch-up");

    processor.on_complete();
    assert_eventually(|| processor.downstream_count() == 0, "teardown");
}
