//! Cluster clock abstraction.
//!
//! The agent timestamps log entries in the configured [`TimeUnit`] so that
//! replay on any member reproduces identical timestamps. Tests drive a
//! [`ManualClock`] for deterministic timeouts.

use crate::types::TimeUnit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait ClusterClock {
    /// Current cluster time in [`ClusterClock::time_unit`] ticks.
    fn time(&self) -> u64;

    fn time_unit(&self) -> TimeUnit;

    fn time_nanos(&self) -> u64 {
        self.time_unit().to_nanos(self.time())
    }
}

/// Wall-clock time since the Unix epoch.
pub struct SystemClock {
    unit: TimeUnit,
}

impl SystemClock {
    pub fn new(unit: TimeUnit) -> Self {
        Self { unit }
    }
}

impl ClusterClock for SystemClock {
    fn time(&self) -> u64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.unit.from_nanos(nanos)
    }

    fn time_unit(&self) -> TimeUnit {
        self.unit
    }
}

/// Hand-advanced clock for tests. Clones share the same time source.
#[derive(Clone)]
pub struct ManualClock {
    ticks: Arc<AtomicU64>,
    unit: TimeUnit,
}

impl ManualClock {
    pub fn new(unit: TimeUnit) -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            unit,
        }
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Release);
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::AcqRel);
    }

    pub fn advance_nanos(&self, nanos: u64) {
        self.advance(self.unit.from_nanos(nanos).max(1));
    }
}

impl ClusterClock for ManualClock {
    fn time(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn time_unit(&self) -> TimeUnit {
        self.unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(TimeUnit::Milliseconds);
        let view = clock.clone();
        clock.advance(250);
        assert_eq!(view.time(), 250);
        assert_eq!(view.time_nanos(), 250_000_000);
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock::new(TimeUnit::Nanoseconds);
        let a = clock.time();
        let b = clock.time();
        assert!(b >= a);
    }
}
