//! Bookkeeping for leader-side state that anticipates commit.
//!
//! Every local mutation made at append time (a fired timer, a closed
//! session, an appended service message) is tracked here keyed by its
//! append position. When the commit position passes an entry it is
//! released; when leadership is lost first, [`UncommittedLedger`] hands the
//! entries back so the agent can roll them into a state indistinguishable
//! from one that never appended them.

use crate::session::ClusterSession;
use crate::types::CorrelationId;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UncommittedTimer {
    pub append_position: u64,
    pub correlation_id: CorrelationId,
}

#[derive(Default)]
pub struct UncommittedLedger {
    timers: VecDeque<UncommittedTimer>,
    closed_sessions: VecDeque<ClusterSession>,
    service_message_count: usize,
}

impl UncommittedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_timer(&mut self, append_position: u64, correlation_id: CorrelationId) {
        self.timers.push_back(UncommittedTimer {
            append_position,
            correlation_id,
        });
    }

    pub fn add_closed_session(&mut self, session: ClusterSession) {
        self.closed_sessions.push_back(session);
    }

    pub fn increment_service_messages(&mut self) {
        self.service_message_count += 1;
    }

    pub fn release_service_messages(&mut self, count: usize) {
        self.service_message_count = self.service_message_count.saturating_sub(count);
    }

    pub fn service_message_count(&self) -> usize {
        self.service_message_count
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn closed_session_count(&self) -> usize {
        self.closed_sessions.len()
    }

    /// Drop timers whose append position committed.
    pub fn release_timers_to(&mut self, commit_position: u64) {
        while let Some(front) = self.timers.front() {
            if front.append_position > commit_position {
                break;
            }
            self.timers.pop_front();
        }
    }

    /// Drop closed sessions whose close committed.
    pub fn release_closed_sessions_to(&mut self, commit_position: u64) {
        while let Some(front) = self.closed_sessions.front() {
            match front.closed_log_position() {
                Some(position) if position <= commit_position => {
                    self.closed_sessions.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Take every timer beyond the safe commit for rescheduling; the ledger
    /// empties either way.
    pub fn drain_timers_beyond(&mut self, commit_position: u64) -> Vec<UncommittedTimer> {
        let rolled_back = self
            .timers
            .iter()
            .filter(|t| t.append_position > commit_position)
            .copied()
            .collect();
        self.timers.clear();

        rolled_back
    }

    /// Take every closed session whose close did not commit so it can be
    /// reinstated; committed closes are dropped.
    pub fn drain_sessions_beyond(&mut self, commit_position: u64) -> Vec<ClusterSession> {
        let mut rolled_back = Vec::new();
        while let Some(session) = self.closed_sessions.pop_front() {
            if session.closed_log_position().map_or(true, |p| p > commit_position) {
                rolled_back.push(session);
            }
        }

        rolled_back
    }

    pub fn clear_service_messages(&mut self) {
        self.service_message_count = 0;
    }

    /// Invariant check: no tracked entry at or below the commit position.
    pub fn all_beyond(&self, commit_position: u64) -> bool {
        self.timers.iter().all(|t| t.append_position > commit_position)
            && self.closed_sessions.iter().all(|s| {
                s.closed_log_position()
                    .map_or(true, |p| p > commit_position)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CloseReason;
    use crate::types::SessionId;

    fn closed_session(id: i64, closed_at: u64) -> ClusterSession {
        let mut session = ClusterSession::new(SessionId(id), 102, format!("client-{id}"));
        session.open(closed_at.saturating_sub(64));
        session.close(CloseReason::ClientAction);
        session.set_closed_log_position(closed_at);
        session
    }

    #[test]
    fn release_frees_committed_entries_in_order() {
        let mut ledger = UncommittedLedger::new();
        ledger.add_timer(100, CorrelationId(1));
        ledger.add_timer(200, CorrelationId(2));
        ledger.add_closed_session(closed_session(1, 150));
        ledger.add_closed_session(closed_session(2, 250));

        ledger.release_timers_to(150);
        ledger.release_closed_sessions_to(150);

        assert_eq!(ledger.timer_count(), 1);
        assert_eq!(ledger.closed_session_count(), 1);
        assert!(ledger.all_beyond(150));
    }

    #[test]
    fn drain_returns_only_rolled_back_entries() {
        let mut ledger = UncommittedLedger::new();
        ledger.add_timer(100, CorrelationId(1));
        ledger.add_timer(300, CorrelationId(3));
        ledger.add_closed_session(closed_session(1, 100));
        ledger.add_closed_session(closed_session(3, 300));

        let timers = ledger.drain_timers_beyond(200);
        assert_eq!(timers, vec![UncommittedTimer {
            append_position: 300,
            correlation_id: CorrelationId(3),
        }]);
        assert_eq!(ledger.timer_count(), 0);

        let sessions = ledger.drain_sessions_beyond(200);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id(), SessionId(3));
        assert_eq!(ledger.closed_session_count(), 0);
    }

    #[test]
    fn service_message_count_tracks_releases() {
        let mut ledger = UncommittedLedger::new();
        ledger.increment_service_messages();
        ledger.increment_service_messages();
        ledger.release_service_messages(1);
        assert_eq!(ledger.service_message_count(), 1);
        ledger.clear_service_messages();
        assert_eq!(ledger.service_message_count(), 0);
    }
}
