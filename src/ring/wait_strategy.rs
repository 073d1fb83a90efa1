//! Wait strategies for ring buffer consumers
//!
//! This module provides different wait strategies that control how consumers
//! wait for new data in the ring buffer. Each strategy offers different
//! trade-offs between latency, CPU usage, and throughput.
//!
//! All strategies observe an alert flag while waiting: when it is raised the
//! wait aborts with the recoverable [`RelayError::Alerted`], which barriers
//! use for cancellation and termination checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::constants::{
    BLOCKING_WAIT_TIMEOUT_MICROS, PARK_INTERVAL_NANOS, PHASED_SPIN_NANOS, PHASED_YIELD_NANOS,
    SPIN_TRIES,
};
use crate::error::{RelayError, Result};
use crate::ring::{Sequence, WaitStrategyKind};

/// Trait for wait strategies that determine how consumers wait for data
pub trait WaitStrategy: Send + Sync {
    /// Wait until `dependent` has reached `sequence` and return the highest
    /// value observed (which may exceed `sequence`).
    ///
    /// The alert flag is checked on every iteration; a raised alert aborts
    /// the wait with [`RelayError::Alerted`].
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependent: &Sequence,
        alert: &AtomicBool,
    ) -> Result<i64>;

    /// Wake any parked waiters after the cursor has advanced
    fn signal_all_when_blocking(&self);
}

#[inline]
fn check_alert(alert: &AtomicBool) -> Result<()> {
    if alert.load(Ordering::Acquire) {
        Err(RelayError::Alerted)
    } else {
        Ok(())
    }
}

/// Busy spin wait strategy - lowest latency, highest CPU usage
pub struct BusySpinWaitStrategy;

impl BusySpinWaitStrategy {
    /// Create a new busy spin wait strategy
    pub fn new() -> Self {
        Self
    }
}

impl Default for BusySpinWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &Sequence,
        dependent: &Sequence,
        alert: &AtomicBool,
    ) -> Result<i64> {
        loop {
            check_alert(alert)?;
            let available = dependent.get();
            if available >= sequence {
                return Ok(available);
            }
            std::hint::spin_loop();
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for busy spin - no blocking threads to signal
    }
}

/// Yielding wait strategy - moderate CPU usage and latency
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    /// Create a new yielding wait strategy
    pub fn new() -> Self {
        Self {
            spin_tries: SPIN_TRIES,
        }
    }

    /// Create a new yielding wait strategy with a custom spin phase
    pub fn with_spin_tries(spin_tries: u32) -> Self {
        Self { spin_tries }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &Sequence,
        dependent: &Sequence,
        alert: &AtomicBool,
    ) -> Result<i64> {
        let mut counter = self.spin_tries;
        loop {
            check_alert(alert)?;
            let available = dependent.get();
            if available >= sequence {
                return Ok(available);
            }
            if counter > 0 {
                counter -= 1;
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for yielding - waiters wake up on their own
    }
}

/// Parking wait strategy - low CPU usage at the cost of wakeup latency
///
/// Spins briefly, then repeatedly parks the thread for a short interval
/// between availability checks.
pub struct ParkingWaitStrategy {
    park_interval: Duration,
}

impl ParkingWaitStrategy {
    /// Create a new parking wait strategy with the default park interval
    pub fn new() -> Self {
        Self::with_interval(Duration::from_nanos(PARK_INTERVAL_NANOS))
    }

    /// Create a new parking wait strategy with a custom park interval
    pub fn with_interval(park_interval: Duration) -> Self {
        Self { park_interval }
    }
}

impl Default for ParkingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for ParkingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &Sequence,
        dependent: &Sequence,
        alert: &AtomicBool,
    ) -> Result<i64> {
        let backoff = Backoff::new();
        loop {
            check_alert(alert)?;
            let available = dependent.get();
            if available >= sequence {
                return Ok(available);
            }
            if backoff.is_completed() {
                thread::park_timeout(self.park_interval);
            } else {
                backoff.snooze();
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for parking - the park interval bounds wakeup latency
    }
}

/// Lite blocking wait strategy - condition variable with a "signal needed" flag
///
/// Producers take the lock and notify only when a waiter has announced itself,
/// keeping the publish path uncontended while the ring is flowing.
pub struct LiteBlockingWaitStrategy {
    mutex: Mutex<()>,
    condvar: Condvar,
    signal_needed: AtomicBool,
}

impl LiteBlockingWaitStrategy {
    /// Create a new lite blocking wait strategy
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            signal_needed: AtomicBool::new(false),
        }
    }
}

impl Default for LiteBlockingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for LiteBlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &Sequence,
        dependent: &Sequence,
        alert: &AtomicBool,
    ) -> Result<i64> {
        let timeout = Duration::from_micros(BLOCKING_WAIT_TIMEOUT_MICROS);
        if dependent.get() < sequence {
            let mut guard = self.mutex.lock();
            loop {
                check_alert(alert)?;
                self.signal_needed.store(true, Ordering::Release);
                if dependent.get() >= sequence {
                    break;
                }
                // Timed wait: a lost signal only costs one timeout period
                self.condvar.wait_for(&mut guard, timeout);
            }
        }
        Ok(dependent.get())
    }

    fn signal_all_when_blocking(&self) {
        if self.signal_needed.swap(false, Ordering::AcqRel) {
            let _guard = self.mutex.lock();
            self.condvar.notify_all();
        }
    }
}

/// Phased backoff wait strategy - spin, then yield, then fall back
///
/// Transitions by elapsed time: busy-spins for `spin_timeout`, yields for
/// `yield_timeout`, then delegates the remainder of the wait to a blocking
/// fallback strategy.
pub struct PhasedBackoffWaitStrategy {
    spin_timeout: Duration,
    yield_timeout: Duration,
    fallback: Box<dyn WaitStrategy>,
}

impl PhasedBackoffWaitStrategy {
    /// Create a phased backoff strategy with an explicit fallback
    pub fn new(
        spin_timeout: Duration,
        yield_timeout: Duration,
        fallback: Box<dyn WaitStrategy>,
    ) -> Self {
        Self {
            spin_timeout,
            yield_timeout,
            fallback,
        }
    }

    /// Create a phased backoff strategy that falls back to lite blocking
    pub fn with_lite_lock(spin_timeout: Duration, yield_timeout: Duration) -> Self {
        Self::new(
            spin_timeout,
            yield_timeout,
            Box::new(LiteBlockingWaitStrategy::new()),
        )
    }
}

impl Default for PhasedBackoffWaitStrategy {
    fn default() -> Self {
        Self::with_lite_lock(
            Duration::from_nanos(PHASED_SPIN_NANOS),
            Duration::from_nanos(PHASED_YIELD_NANOS),
        )
    }
}

impl WaitStrategy for PhasedBackoffWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependent: &Sequence,
        alert: &AtomicBool,
    ) -> Result<i64> {
        let backoff = Backoff::new();
        let mut start: Option<Instant> = None;
        loop {
            check_alert(alert)?;
            let available = dependent.get();
            if available >= sequence {
                return Ok(available);
            }
            match start {
                // Cheap spins before the first clock read
                None => {
                    if backoff.is_completed() {
                        start = Some(Instant::now());
                    } else {
                        backoff.spin();
                    }
                }
                Some(began) => {
                    let elapsed = began.elapsed();
                    if elapsed < self.spin_timeout {
                        std::hint::spin_loop();
                    } else if elapsed < self.spin_timeout + self.yield_timeout {
                        thread::yield_now();
                    } else {
                        return self.fallback.wait_for(sequence, cursor, dependent, alert);
                    }
                }
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        self.fallback.signal_all_when_blocking();
    }
}

/// Factory for creating wait strategies
pub struct WaitStrategyFactory;

impl WaitStrategyFactory {
    /// Create a wait strategy from the given kind
    pub fn create(kind: WaitStrategyKind) -> Arc<dyn WaitStrategy> {
        match kind {
            WaitStrategyKind::BusySpin => Arc::new(BusySpinWaitStrategy::new()),
            WaitStrategyKind::Yielding => Arc::new(YieldingWaitStrategy::new()),
            WaitStrategyKind::Parking => Arc::new(ParkingWaitStrategy::new()),
            WaitStrategyKind::LiteBlocking => Arc::new(LiteBlockingWaitStrategy::new()),
            WaitStrategyKind::PhasedBackoff => Arc::new(PhasedBackoffWaitStrategy::default()),
        }
    }

    /// Create a strategy optimized for lowest latency
    pub fn low_latency() -> Arc<dyn WaitStrategy> {
        Arc::new(BusySpinWaitStrategy::new())
    }

    /// Create a balanced strategy for moderate latency and CPU usage
    pub fn balanced() -> Arc<dyn WaitStrategy> {
        Arc::new(YieldingWaitStrategy::new())
    }

    /// Create a low-CPU strategy for background processing
    pub fn low_cpu() -> Arc<dyn WaitStrategy> {
        Arc::new(LiteBlockingWaitStrategy::new())
    }
}
