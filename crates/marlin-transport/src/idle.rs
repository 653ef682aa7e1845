//! Idle strategy for the agent's bounded internal busy-waits.

use std::time::Duration;

const SPIN_LIMIT: u32 = 10;
const YIELD_LIMIT: u32 = 20;
const MIN_PARK: Duration = Duration::from_micros(50);
const MAX_PARK: Duration = Duration::from_millis(1);

/// Spin, then yield, then park with doubling backoff.
///
/// `idle(work_count)` resets the backoff whenever work was done, so the
/// strategy stays hot under load and backs off when quiet.
#[derive(Debug, Default)]
pub struct IdleStrategy {
    spins: u32,
    yields: u32,
    park: Option<Duration>,
}

impl IdleStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = None;
    }

    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
        } else {
            self.idle_step();
        }
    }

    pub fn idle_step(&mut self) {
        if self.spins < SPIN_LIMIT {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.yields < YIELD_LIMIT {
            self.yields += 1;
            std::thread::yield_now();
        } else {
            let park = self.park.unwrap_or(MIN_PARK);
            std::thread::sleep(park);
            self.park = Some((park * 2).min(MAX_PARK));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_resets_on_work() {
        let mut idle = IdleStrategy::new();
        for _ in 0..64 {
            idle.idle(0);
        }
        assert!(idle.park.is_some());

        idle.idle(1);
        assert!(idle.park.is_none());
        assert_eq!(idle.spins, 0);
    }
}
