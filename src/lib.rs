//! Relay - multi-producer multi-subscriber broadcast processor
//!
//! Relay fans a stream of values out to any number of subscribers over a
//! bounded, pre-allocated ring buffer in the LMAX Disruptor style. Every
//! active subscriber observes the same totally-ordered sequence of values;
//! each runs on its own dedicated consumer task, paces delivery with
//! reactive-streams demand (`request(n)`), and can cancel independently.
//!
//! ## Key Features
//!
//! - **Pre-allocated ring**: power-of-two slot array, no allocation in
//!   steady state
//! - **Lock-free coordination**: padded atomic sequences with
//!   acquire/release publication between producers and consumers
//! - **Demand-based backpressure**: per-subscriber pending-demand counters
//!   park a consumer without blocking producers
//! - **Pluggable wait strategies**: busy-spin, yielding, parking,
//!   lite-blocking and phased backoff trade CPU for latency
//! - **Lifecycle correctness**: replay for the first subscriber, cold replay
//!   for late subscribers after termination, auto-cancel propagation
//!   upstream when the last subscriber leaves
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use relay::{BroadcastProcessor, WaitStrategyKind};
//!
//! let processor = BroadcastProcessor::<u64>::builder()
//!     .name("ticker")
//!     .buffer_size(1024)
//!     .wait_strategy(WaitStrategyKind::PhasedBackoff)
//!     .shared(false)
//!     .build()
//!     .unwrap();
//!
//! // Producer side
//! processor.on_next(1);
//! processor.on_next(2);
//! processor.on_complete();
//! ```

pub mod constants;
pub mod error;
pub mod executor;
pub mod ring;
pub mod stream;

// Re-export main components
pub use error::{RelayError, Result};
pub use executor::{TaskExecutor, ThreadPerTaskExecutor};
pub use ring::{
    RingBuffer, Sequence, SequenceBarrier, Sequencer, WaitStrategy, WaitStrategyFactory,
    WaitStrategyKind,
};
pub use stream::{
    BroadcastProcessor, ProcessorBuilder, ProcessorConfig, Publisher, ReplaySource, Subscriber,
    Subscription,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
