//! Disruptor-style ring buffer core
//!
//! This module provides the coordination machinery the broadcast processor is
//! built on: padded atomic sequences, producer-side sequencers, the
//! pre-allocated slot ring, consumer-side barriers and pluggable wait
//! strategies.
//!
//! ## Architecture
//!
//! - Pre-allocated power-of-two array of value slots, indexed by `seq & mask`
//! - Atomic sequence counters for the producer cursor and every consumer
//! - Gating sequences for flow control: the cursor never overtakes the
//!   slowest registered consumer by more than the buffer size
//! - Wait strategies for different latency/CPU trade-offs
//!
//! Producers claim slots through a [`Sequencer`], write, then publish;
//! consumers follow the published cursor through a [`SequenceBarrier`].

pub mod barrier;
pub mod buffer;
pub mod sequence;
pub mod sequencer;
pub mod wait_strategy;

pub use barrier::SequenceBarrier;
pub use buffer::{RingBuffer, ValueSupplier};
pub use sequence::Sequence;
pub use sequencer::{MultiProducerSequencer, Sequencer, SingleProducerSequencer};
pub use wait_strategy::{
    BusySpinWaitStrategy, LiteBlockingWaitStrategy, ParkingWaitStrategy,
    PhasedBackoffWaitStrategy, WaitStrategy, WaitStrategyFactory, YieldingWaitStrategy,
};

use serde::{Deserialize, Serialize};

/// Available wait strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitStrategyKind {
    /// Busy spin for lowest latency
    BusySpin,
    /// Spin then yield for balanced latency and CPU usage
    Yielding,
    /// Park between checks for lowest CPU usage
    Parking,
    /// Condition variable with a producer-side "signal needed" flag
    LiteBlocking,
    /// Spin, then yield, then fall back to lite blocking
    PhasedBackoff,
}

impl Default for WaitStrategyKind {
    fn default() -> Self {
        Self::PhasedBackoff
    }
}
