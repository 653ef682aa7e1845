//! marlin-observe: host-facing observability counters.
//!
//! Every counter is single-writer (the consensus agent) and multi-reader
//! (the host, operator tooling, tests). Writers publish with `Release`
//! stores and readers load with `Acquire`, so a reader that observes a
//! counter value also observes every agent-side write that preceded it.
//! No counter is ever written from more than one thread.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic event counter (timed-out clients, invalid requests, snapshots).
#[derive(Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one. Single-writer.
    pub fn increment(&self) {
        let v = self.value.load(Ordering::Relaxed);
        self.value.store(v + 1, Ordering::Release);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

/// Gauge holding a small state code (module state, cluster role,
/// control toggle). Values may go up or down.
#[derive(Clone, Default)]
pub struct StateGauge {
    value: Arc<AtomicI64>,
}

impl StateGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(initial: i64) -> Self {
        let gauge = Self::default();
        gauge.set(initial);
        gauge
    }

    /// Single-writer store with release semantics.
    pub fn set(&self, code: i64) {
        self.value.store(code, Ordering::Release);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Compare-and-set from any thread. Used only by the operator side of
    /// the control toggle, where the agent and the operator race by design.
    pub fn compare_and_set(&self, expected: i64, updated: i64) -> bool {
        self.value
            .compare_exchange(expected, updated, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Stream-position counter (commit position, recording positions).
///
/// Positions only move forward; `propose_max` keeps the published value
/// monotonic even when the writer recomputes from raw inputs.
#[derive(Clone, Default)]
pub struct PositionCounter {
    value: Arc<AtomicU64>,
}

impl PositionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional store. Used when the writer re-bases the position,
    /// e.g. on leadership transition.
    pub fn set(&self, position: u64) {
        self.value.store(position, Ordering::Release);
    }

    /// Publish `position` only if it advances the counter.
    /// Returns true when the value moved.
    pub fn propose_max(&self, position: u64) -> bool {
        let current = self.value.load(Ordering::Relaxed);
        if position > current {
            self.value.store(position, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Relaxed load for the writer's own fast path, where the writer
    /// already synchronizes with itself.
    pub fn get_weak(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn state_gauge_set_and_cas() {
        let gauge = StateGauge::with_value(1);
        assert_eq!(gauge.get(), 1);
        gauge.set(3);
        assert_eq!(gauge.get(), 3);

        assert!(gauge.compare_and_set(3, 5));
        assert!(!gauge.compare_and_set(3, 7));
        assert_eq!(gauge.get(), 5);
    }

    #[test]
    fn position_counter_propose_max_is_monotonic() {
        let position = PositionCounter::new();
        assert!(position.propose_max(100));
        assert!(!position.propose_max(50));
        assert!(!position.propose_max(100));
        assert_eq!(position.get(), 100);

        assert!(position.propose_max(160));
        assert_eq!(position.get(), 160);
    }

    #[test]
    fn position_counter_readers_share_writer_value() {
        let position = PositionCounter::new();
        let reader = position.clone();
        position.set(4096);
        assert_eq!(reader.get(), 4096);
    }
}
