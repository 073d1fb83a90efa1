//! Reactive broadcast streaming over the ring core
//!
//! This module carries the reactive-streams-style contract (subscribe /
//! request / next / complete / error / cancel) and the broadcast processor
//! that implements it. Every active subscriber observes the same
//! totally-ordered sequence of values; each runs on its own dedicated
//! consumer task and paces delivery with its own demand.

pub mod consumer;
pub mod processor;
pub mod replay;

pub use processor::{BroadcastProcessor, ProcessorBuilder, ProcessorSubscriber};
pub use replay::ReplaySource;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_BUFFER_SIZE;
use crate::error::{RelayError, Result};
use crate::ring::WaitStrategyKind;

/// Demand and cancellation handle held by a subscriber
pub trait Subscription: Send + Sync {
    /// Ask for `n` more values. Demand accumulates, saturating at
    /// `i64::MAX` which means unbounded. A non-positive `n` is an error
    /// signalled to the requesting subscriber only.
    fn request(&self, n: i64);

    /// Stop the flow to this subscriber. Idempotent; no further signals are
    /// delivered after the cancellation is observed, not even completion.
    fn cancel(&self);
}

/// Receiver of a stream of values and a terminal signal
pub trait Subscriber<T>: Send {
    /// Called exactly once, before any other signal
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    /// Called for each value. Returning an error fails only this subscriber:
    /// it receives `on_error` and its consumer stops, while other
    /// subscribers continue.
    fn on_next(&mut self, value: T) -> Result<()>;

    /// Terminal failure signal
    fn on_error(&mut self, error: Arc<RelayError>);

    /// Terminal completion signal
    fn on_complete(&mut self);
}

/// Source of a stream of values
pub trait Publisher<T> {
    /// Attach a subscriber to this source
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>);
}

/// One-shot subscription that accepts no demand; handed to subscribers that
/// are rejected before a consumer task could start
pub struct EmptySubscription;

impl Subscription for EmptySubscription {
    fn request(&self, _n: i64) {}

    fn cancel(&self) {}
}

/// Declarative configuration for a broadcast processor
///
/// Non-serializable options (a custom executor, a caller-supplied wait
/// strategy, a slot value supplier) are set on [`ProcessorBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Label used for worker threads
    pub name: String,
    /// Ring capacity; must be a power of 2
    pub buffer_size: usize,
    /// How consumers wait for new data
    pub wait_strategy: WaitStrategyKind,
    /// Select the multi-producer sequencer, allowing concurrent publishers
    pub shared: bool,
    /// Cancel the upstream subscription when the last subscriber leaves
    pub auto_cancel: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "relay".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            wait_strategy: WaitStrategyKind::default(),
            shared: false,
            auto_cancel: true,
        }
    }
}

impl ProcessorConfig {
    /// Create a configuration with the given worker-thread label
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the ring capacity
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 || !buffer_size.is_power_of_two() {
            return Err(RelayError::config("buffer size must be a power of 2"));
        }
        self.buffer_size = buffer_size;
        Ok(self)
    }

    /// Set the wait strategy
    pub fn with_wait_strategy(mut self, kind: WaitStrategyKind) -> Self {
        self.wait_strategy = kind;
        self
    }

    /// Allow concurrent publishers
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Propagate cancellation upstream when the last subscriber leaves
    pub fn with_auto_cancel(mut self, auto_cancel: bool) -> Self {
        self.auto_cancel = auto_cancel;
        self
    }
}
