//! Relay tuning constants
//!
//! This module contains tuning constants and configuration values used
//! throughout the relay library.

/// Default ring buffer size (must be power of 2 for efficient modulo operations)
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Maximum ring buffer size accepted by configuration validation
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Cache line size for alignment optimizations (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Alignment of a padded sequence cell
///
/// Two cache lines, so the counter stays clear of adjacent-line prefetching
/// on modern Intel CPUs.
pub const SEQUENCE_ALIGNMENT: usize = 128;

/// Sequence value meaning "nothing published / consumed yet"
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// Pending-demand value meaning "unbounded; never decremented"
pub const UNBOUNDED_DEMAND: i64 = i64::MAX;

/// Spin iterations before a yielding waiter starts yielding the CPU
pub const SPIN_TRIES: u32 = 100;

/// Interval a parked waiter sleeps between availability checks
pub const PARK_INTERVAL_NANOS: u64 = 1_000;

/// Time a phased waiter spends busy-spinning before it starts yielding
pub const PHASED_SPIN_NANOS: u64 = 10_000;

/// Time a phased waiter spends yielding before falling back to its blocking strategy
pub const PHASED_YIELD_NANOS: u64 = 100_000;

/// Timed wait used by the lite-blocking strategy so that alerts are observed
/// even when a wakeup signal is lost
pub const BLOCKING_WAIT_TIMEOUT_MICROS: u64 = 100;

/// Divisor of the ring capacity that sets the replenishment threshold: the
/// request task asks the upstream for more once consumers have drained
/// `buffer_size - max(buffer_size / REPLENISH_DIVISOR, 1)` slots
pub const REPLENISH_DIVISOR: usize = 4;

/// Validate that all constants are properly configured
pub fn validate_constants() -> Result<(), &'static str> {
    if !DEFAULT_BUFFER_SIZE.is_power_of_two() {
        return Err("DEFAULT_BUFFER_SIZE must be a power of 2");
    }
    if !MAX_BUFFER_SIZE.is_power_of_two() {
        return Err("MAX_BUFFER_SIZE must be a power of 2");
    }
    if CACHE_LINE_SIZE == 0 || !CACHE_LINE_SIZE.is_power_of_two() {
        return Err("CACHE_LINE_SIZE must be a power of 2");
    }
    if SEQUENCE_ALIGNMENT < CACHE_LINE_SIZE || !SEQUENCE_ALIGNMENT.is_power_of_two() {
        return Err("SEQUENCE_ALIGNMENT must be a power of 2 no smaller than a cache line");
    }
    if REPLENISH_DIVISOR == 0 {
        return Err("REPLENISH_DIVISOR must be greater than 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_validation() {
        assert!(validate_constants().is_ok());
    }

    #[test]
    fn test_buffer_sizes_are_powers_of_two() {
        assert!(DEFAULT_BUFFER_SIZE.is_power_of_two());
        assert!(MAX_BUFFER_SIZE.is_power_of_two());
    }

    #[test]
    fn test_sequence_alignment_covers_cache_line() {
        assert!(SEQUENCE_ALIGNMENT >= CACHE_LINE_SIZE);
    }
}
