//! Latch Metrics - Common utilities for allocator telemetry
//!
//! Provides zero-cost abstractions for metrics collection that completely
//! vanish in production builds via feature flags.
//!
//! # Feature Flags
//!
//! - `metrics` - Enable metrics collection (default: disabled)
//!
//! # Usage
//!
//! ```ignore
//! use latch_metrics::{Counter, FrameLedger};
//!
//! let mut counter = Counter::new();
//! counter.increment("chunks_acquired", 1);
//!
//! let mut ledger = FrameLedger::new(120); // Keep the last 120 frames
//! ledger.record(frame, "resident_bytes", resident);
//! ```
//!
//! `RingBuffer` is always available: allocator heuristics depend on it, not
//! just instrumentation. In production builds (without `metrics` feature),
//! counters and ledgers are compiled out to zero overhead.

mod ring_buffer;
#[cfg(feature = "metrics")]
mod counter;
#[cfg(feature = "metrics")]
mod frame_ledger;

pub use ring_buffer::RingBuffer;
#[cfg(feature = "metrics")]
pub use counter::Counter;
#[cfg(feature = "metrics")]
pub use frame_ledger::{FrameLedger, FrameSample};

// ============================================================================
// Macros for conditional compilation
// ============================================================================

/// Execute code only when metrics are enabled
#[macro_export]
macro_rules! metrics {
    ($($tt:tt)*) => {
        #[cfg(feature = "metrics")]
        {
            $($tt)*
        }
    };
}

// ============================================================================
// No-op stubs when metrics disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Clone, Default)]
pub struct Counter;

#[cfg(not(feature = "metrics"))]
impl Counter {
    pub fn new() -> Self { Self }
    pub fn increment(&mut self, _name: &'static str, _value: u64) {}
    pub fn set(&mut self, _name: &'static str, _value: u64) {}
    pub fn get(&self, _name: &str) -> u64 { 0 }
    pub fn reset_all(&mut self) {}
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ { std::iter::empty() }
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSample {
    pub frame: u64,
    pub values: Vec<(&'static str, u64)>,
}

#[cfg(not(feature = "metrics"))]
#[derive(Debug, Clone)]
pub struct FrameLedger;

#[cfg(not(feature = "metrics"))]
impl FrameLedger {
    pub fn new(_capacity: usize) -> Self { Self }
    pub fn record(&mut self, _frame: u64, _name: &'static str, _value: u64) {}
    pub fn latest(&self) -> Option<&FrameSample> { None }
    pub fn history(&self, _name: &str) -> Vec<(u64, u64)> { Vec::new() }
    pub fn len(&self) -> usize { 0 }
    pub fn is_empty(&self) -> bool { true }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_compiles_with_or_without_metrics() {
        let mut _buffer = super::RingBuffer::<u64>::new(10);
        let mut counter = super::Counter::new();
        counter.increment("commits", 1);
        let mut ledger = super::FrameLedger::new(4);
        ledger.record(1, "commits", counter.get("commits"));
    }
}
