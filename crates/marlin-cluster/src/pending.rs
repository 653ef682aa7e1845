//! Ring of service-originated messages awaiting log append.
//!
//! Each slot reserves an append-position field overloaded the way the wire
//! format overloads its timestamp slot: [`NOT_APPENDED`] (`i64::MAX`) until
//! the message lands in the log, then the resulting append position. The
//! head offset tracks how far the appender has progressed; sweepers remove
//! slots from the front once their fate is known.

use crate::error::{ClusterError, Result};
use crate::types::SessionId;
use bytes::Bytes;
use std::collections::VecDeque;

/// Sentinel meaning "not yet appended in this term".
pub const NOT_APPENDED: i64 = i64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingServiceMessage {
    /// Service session id stamped at enqueue, monotonic from the reserved
    /// range.
    pub service_session_id: SessionId,
    /// [`NOT_APPENDED`], or the log position the append produced.
    pub append_position: i64,
    pub payload: Bytes,
}

pub struct PendingMessageQueue {
    ring: VecDeque<PendingServiceMessage>,
    head_offset: usize,
    capacity: usize,
}

impl PendingMessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::new(),
            head_offset: 0,
            capacity,
        }
    }

    pub fn size(&self) -> usize {
        self.ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn head_offset(&self) -> usize {
        self.head_offset
    }

    /// Enqueue a service message stamped with its session id.
    pub fn append(&mut self, service_session_id: SessionId, payload: Bytes) -> Result<()> {
        if self.ring.len() >= self.capacity {
            return Err(ClusterError::CapacityExceeded {
                size: self.ring.len(),
            });
        }

        self.ring.push_back(PendingServiceMessage {
            service_session_id,
            append_position: NOT_APPENDED,
            payload,
        });

        Ok(())
    }

    /// Reload a slot from a snapshot. Snapshot slots are always sentinel;
    /// they have not been re-appended in the loading term.
    pub fn load(&mut self, service_session_id: SessionId, payload: Bytes) -> Result<()> {
        self.append(service_session_id, payload)
    }

    /// Drive the appender over un-appended slots from the head offset, up
    /// to `limit` slots. The appender returns the append position (0 when
    /// flow controlled, which stops the pass). Returns slots appended.
    pub fn process_head(
        &mut self,
        limit: usize,
        mut appender: impl FnMut(&PendingServiceMessage) -> u64,
    ) -> usize {
        let mut appended = 0;

        while appended < limit && self.head_offset < self.ring.len() {
            let slot = &self.ring[self.head_offset];
            let position = appender(slot);
            if position == 0 {
                break;
            }

            self.ring[self.head_offset].append_position = position as i64;
            self.head_offset += 1;
            appended += 1;
        }

        appended
    }

    /// Leader sweeper: drop head slots whose append position committed.
    /// Returns slots removed.
    pub fn sweep_committed(&mut self, commit_position: u64) -> usize {
        let mut removed = 0;
        while let Some(front) = self.ring.front() {
            if front.append_position == NOT_APPENDED
                || front.append_position as u64 > commit_position
            {
                break;
            }
            self.ring.pop_front();
            removed += 1;
        }

        self.head_offset = self.head_offset.saturating_sub(removed);
        removed
    }

    /// Follower sweeper: drop head slots whose service session id the
    /// replicated log has already delivered. Returns slots removed.
    pub fn sweep_delivered(&mut self, log_service_session_id: SessionId) -> usize {
        let mut removed = 0;
        while let Some(front) = self.ring.front() {
            if front.service_session_id > log_service_session_id {
                break;
            }
            self.ring.pop_front();
            removed += 1;
        }

        self.head_offset = self.head_offset.saturating_sub(removed);
        removed
    }

    /// Reset every slot to the sentinel and rewind the head offset, so a
    /// later leadership (here or elsewhere) re-appends cleanly.
    pub fn reset_to_not_appended(&mut self) -> usize {
        let mut reset = 0;
        for slot in self.ring.iter_mut() {
            if slot.append_position != NOT_APPENDED {
                slot.append_position = NOT_APPENDED;
                reset += 1;
            }
        }
        self.head_offset = 0;

        reset
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingServiceMessage> {
        self.ring.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64) -> (SessionId, Bytes) {
        (
            SessionId(i64::MIN + id),
            Bytes::from(format!("svc-{id}")),
        )
    }

    fn queue_with(count: i64) -> PendingMessageQueue {
        let mut queue = PendingMessageQueue::new(16);
        for id in 1..=count {
            let (session_id, payload) = message(id);
            queue.append(session_id, payload).unwrap();
        }
        queue
    }

    #[test]
    fn append_rejects_at_capacity() {
        let mut queue = PendingMessageQueue::new(2);
        let (id, payload) = message(1);
        queue.append(id, payload.clone()).unwrap();
        queue.append(id.next(), payload.clone()).unwrap();
        assert!(matches!(
            queue.append(SessionId(i64::MIN + 3), payload),
            Err(ClusterError::CapacityExceeded { size: 2 })
        ));
    }

    #[test]
    fn process_head_records_positions_and_advances() {
        let mut queue = queue_with(3);
        let mut next_position = 100;

        let appended = queue.process_head(2, |_| {
            next_position += 32;
            next_position
        });

        assert_eq!(appended, 2);
        assert_eq!(queue.head_offset(), 2);
        let slots: Vec<i64> = queue.iter().map(|s| s.append_position).collect();
        assert_eq!(slots, vec![132, 164, NOT_APPENDED]);
    }

    #[test]
    fn process_head_stops_on_backpressure() {
        let mut queue = queue_with(3);
        let mut calls = 0;

        let appended = queue.process_head(3, |_| {
            calls += 1;
            if calls == 2 {
                0
            } else {
                64 * calls as u64
            }
        });

        assert_eq!(appended, 1);
        assert_eq!(queue.head_offset(), 1);

        // The refused slot is retried on the next pass.
        let appended = queue.process_head(3, |_| 512);
        assert_eq!(appended, 2);
    }

    #[test]
    fn leader_sweep_removes_committed_head() {
        let mut queue = queue_with(3);
        queue.process_head(3, |slot| {
            // Positions 132, 164, 196.
            100 + 32 * (slot.service_session_id.0 - i64::MIN) as u64
        });

        assert_eq!(queue.sweep_committed(164), 2);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.head_offset(), 1);

        // Nothing else committed: no further removal.
        assert_eq!(queue.sweep_committed(164), 0);
    }

    #[test]
    fn follower_sweep_removes_by_session_id() {
        let mut queue = queue_with(3);
        assert_eq!(queue.sweep_delivered(SessionId(i64::MIN + 2)), 2);
        assert_eq!(queue.size(), 1);
        assert_eq!(
            queue.iter().next().unwrap().service_session_id,
            SessionId(i64::MIN + 3)
        );
    }

    #[test]
    fn reset_rewinds_head_and_sentinels() {
        let mut queue = queue_with(3);
        queue.process_head(2, |_| 4096);

        assert_eq!(queue.reset_to_not_appended(), 2);
        assert_eq!(queue.head_offset(), 0);
        assert!(queue.iter().all(|s| s.append_position == NOT_APPENDED));
    }
}
