//! Hashed timer wheel keyed by correlation id.
//!
//! Deadlines are in cluster-time ticks. The wheel is snapshotable and
//! carries the replay reconciliation rule: a cancel replayed for a timer
//! that is not in the wheel bumps a per-correlation expired count, and a
//! later schedule for the same correlation consumes that count instead of
//! scheduling, keeping timer fires idempotent across restart.

use crate::types::CorrelationId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub correlation_id: CorrelationId,
    pub deadline: u64,
}

/// Fixed-spoke hashed wheel. Spoke count is rounded up to a power of two
/// so the tick-to-spoke mapping is a mask.
pub struct TimerWheel {
    tick_resolution: u64,
    spoke_mask: u64,
    spokes: Vec<Vec<TimerEntry>>,
    /// Deadline per live correlation, for cancel and snapshot.
    deadline_by_correlation: HashMap<CorrelationId, u64>,
    /// Replayed-cancel counts awaiting their matching schedule.
    expired_counts: HashMap<CorrelationId, u64>,
    current_tick_time: u64,
}

impl TimerWheel {
    pub fn new(tick_resolution: u64, ticks_per_wheel: usize) -> Self {
        let spoke_count = ticks_per_wheel.next_power_of_two().max(2);
        Self {
            tick_resolution: tick_resolution.max(1),
            spoke_mask: (spoke_count - 1) as u64,
            spokes: (0..spoke_count).map(|_| Vec::new()).collect(),
            deadline_by_correlation: HashMap::new(),
            expired_counts: HashMap::new(),
            current_tick_time: 0,
        }
    }

    fn spoke_index(&self, deadline: u64) -> usize {
        ((deadline / self.tick_resolution) & self.spoke_mask) as usize
    }

    pub fn current_tick_time(&self) -> u64 {
        self.current_tick_time
    }

    pub fn set_current_tick_time(&mut self, now: u64) {
        self.current_tick_time = now;
    }

    pub fn timer_count(&self) -> usize {
        self.deadline_by_correlation.len()
    }

    /// Schedule (or reschedule) a timer. A pending expired count from
    /// replay suppresses the schedule instead.
    pub fn schedule(&mut self, correlation_id: CorrelationId, deadline: u64) {
        if let Some(count) = self.expired_counts.get_mut(&correlation_id) {
            *count -= 1;
            if *count == 0 {
                self.expired_counts.remove(&correlation_id);
            }
            return;
        }

        self.schedule_unchecked(correlation_id, deadline);
    }

    /// Schedule without consulting expired counts. Used by rollback, where
    /// the timer is known to have fired without committing.
    pub fn schedule_unchecked(&mut self, correlation_id: CorrelationId, deadline: u64) {
        self.cancel(correlation_id);
        // A deadline already in the past lands in the current spoke so it
        // fires on the next poll rather than after a wheel revolution.
        let index = self.spoke_index(deadline.max(self.current_tick_time));
        self.spokes[index].push(TimerEntry {
            correlation_id,
            deadline,
        });
        self.deadline_by_correlation.insert(correlation_id, deadline);
    }

    /// Remove a timer. Returns false when no timer was scheduled for the
    /// correlation.
    pub fn cancel(&mut self, correlation_id: CorrelationId) -> bool {
        let Some(deadline) = self.deadline_by_correlation.remove(&correlation_id) else {
            return false;
        };

        let index = self.spoke_index(deadline);
        self.spokes[index].retain(|entry| entry.correlation_id != correlation_id);
        true
    }

    /// A cancel was replayed for a timer not in the wheel; remember it so
    /// the matching schedule replayed later is suppressed.
    pub fn increment_expired_count(&mut self, correlation_id: CorrelationId) {
        *self.expired_counts.entry(correlation_id).or_insert(0) += 1;
    }

    /// Expire timers with `deadline <= now`. The handler appends a timer
    /// event to the log and returns false when flow controlled, in which
    /// case the timer stays scheduled and polling stops for this tick.
    pub fn poll(&mut self, now: u64, mut handler: impl FnMut(CorrelationId) -> bool) -> usize {
        let mut expired = 0;

        loop {
            let spoke = self.spoke_index(self.current_tick_time);
            let mut i = 0;
            while i < self.spokes[spoke].len() {
                let entry = self.spokes[spoke][i];
                if entry.deadline <= now {
                    if !handler(entry.correlation_id) {
                        // Flow controlled: leave the timer in place and
                        // resume from this tick next poll.
                        return expired;
                    }
                    self.spokes[spoke].swap_remove(i);
                    self.deadline_by_correlation.remove(&entry.correlation_id);
                    expired += 1;
                } else {
                    i += 1;
                }
            }

            let next_tick = self.current_tick_time.saturating_add(self.tick_resolution);
            if next_tick > now {
                break;
            }
            self.current_tick_time = next_tick;
        }

        expired
    }

    /// Live entries for snapshotting, in deterministic order.
    pub fn entries(&self) -> Vec<TimerEntry> {
        let mut entries: Vec<TimerEntry> = self
            .deadline_by_correlation
            .iter()
            .map(|(&correlation_id, &deadline)| TimerEntry {
                correlation_id,
                deadline,
            })
            .collect();
        entries.sort_by_key(|entry| (entry.deadline, entry.correlation_id.0));

        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wheel() -> TimerWheel {
        TimerWheel::new(8, 128)
    }

    #[test]
    fn spoke_count_rounds_to_power_of_two() {
        let wheel = TimerWheel::new(8, 100);
        assert_eq!(wheel.spokes.len(), 128);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut wheel = wheel();
        wheel.schedule(CorrelationId(1), 100);
        wheel.schedule(CorrelationId(2), 50);
        wheel.schedule(CorrelationId(3), 200);

        let mut fired = Vec::new();
        let count = wheel.poll(150, |correlation| {
            fired.push(correlation);
            true
        });

        assert_eq!(count, 2);
        assert_eq!(fired, vec![CorrelationId(2), CorrelationId(1)]);
        assert_eq!(wheel.timer_count(), 1);
    }

    #[test]
    fn backpressured_timer_stays_scheduled() {
        let mut wheel = wheel();
        wheel.schedule(CorrelationId(1), 10);
        wheel.schedule(CorrelationId(2), 20);

        // Handler refuses the first expiry: nothing is removed.
        assert_eq!(wheel.poll(100, |_| false), 0);
        assert_eq!(wheel.timer_count(), 2);

        let mut fired = Vec::new();
        wheel.poll(100, |correlation| {
            fired.push(correlation);
            true
        });
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn cancel_removes_timer() {
        let mut wheel = wheel();
        wheel.schedule(CorrelationId(9), 64);
        assert!(wheel.cancel(CorrelationId(9)));
        assert!(!wheel.cancel(CorrelationId(9)));
        assert_eq!(wheel.poll(1_000, |_| true), 0);
    }

    #[test]
    fn reschedule_replaces_deadline() {
        let mut wheel = wheel();
        wheel.schedule(CorrelationId(4), 1_000);
        wheel.schedule(CorrelationId(4), 10);
        assert_eq!(wheel.timer_count(), 1);

        let mut fired = Vec::new();
        wheel.poll(20, |correlation| {
            fired.push(correlation);
            true
        });
        assert_eq!(fired, vec![CorrelationId(4)]);
    }

    #[test]
    fn replayed_cancel_suppresses_later_schedule() {
        let mut wheel = wheel();

        // Replay saw a timer fire that is not in the wheel.
        wheel.increment_expired_count(CorrelationId(7));

        // The schedule replayed afterwards is absorbed.
        wheel.schedule(CorrelationId(7), 10);
        assert_eq!(wheel.timer_count(), 0);
        assert_eq!(wheel.poll(100, |_| true), 0);

        // The next schedule is genuine.
        wheel.schedule(CorrelationId(7), 10);
        assert_eq!(wheel.timer_count(), 1);
    }

    #[test]
    fn entries_snapshot_is_deterministic() {
        let mut wheel = wheel();
        wheel.schedule(CorrelationId(2), 100);
        wheel.schedule(CorrelationId(1), 100);
        wheel.schedule(CorrelationId(3), 50);

        let entries = wheel.entries();
        assert_eq!(
            entries.iter().map(|e| e.correlation_id).collect::<Vec<_>>(),
            vec![CorrelationId(3), CorrelationId(1), CorrelationId(2)]
        );
    }
}
