//! Coordinated cluster termination bookkeeping.

use crate::adapters::ConsensusPublisher;
use crate::member::ClusterMember;
use crate::types::MemberId;

/// Tracks a leader-driven termination: the position everyone must reach,
/// the acks collected, and the overall deadline after which termination
/// proceeds regardless.
pub struct ClusterTermination {
    deadline_ns: u64,
    has_services_terminated: bool,
}

impl ClusterTermination {
    pub fn new(deadline_ns: u64) -> Self {
        Self {
            deadline_ns,
            has_services_terminated: false,
        }
    }

    pub fn set_deadline_ns(&mut self, deadline_ns: u64) {
        self.deadline_ns = deadline_ns;
    }

    pub fn on_services_terminated(&mut self) {
        self.has_services_terminated = true;
    }

    pub fn has_services_terminated(&self) -> bool {
        self.has_services_terminated
    }

    /// Broadcast the termination position to every other member.
    pub fn termination_position(
        &self,
        publisher: &ConsensusPublisher,
        members: &[ClusterMember],
        this_member_id: MemberId,
        log_position: u64,
    ) {
        for member in members {
            if member.id != this_member_id {
                if let Some(publication) = member.publication.as_ref() {
                    publisher.termination_position(publication, log_position);
                }
            }
        }
    }

    /// All members acked, or the deadline passed with services done.
    pub fn can_terminate(&self, members: &[ClusterMember], now_ns: u64) -> bool {
        if !self.has_services_terminated {
            return false;
        }

        let all_acked = members.iter().all(|m| m.has_terminated);
        all_acked || now_ns >= self.deadline_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::parse_members;

    #[test]
    fn terminates_when_all_members_acked() {
        let mut members = parse_members("0,c0,m0,t0,l0|1,c1,m1,t1,l1").unwrap();
        let mut termination = ClusterTermination::new(1_000_000);

        assert!(!termination.can_terminate(&members, 0));

        termination.on_services_terminated();
        assert!(!termination.can_terminate(&members, 0));

        // The leader marks itself terminated; the follower acks later.
        members[0].has_terminated = true;
        assert!(!termination.can_terminate(&members, 0));
        members[1].has_terminated = true;
        assert!(termination.can_terminate(&members, 0));
    }

    #[test]
    fn deadline_overrides_missing_acks() {
        let members = parse_members("0,c0,m0,t0,l0|1,c1,m1,t1,l1").unwrap();
        let mut termination = ClusterTermination::new(500);
        termination.on_services_terminated();

        assert!(!termination.can_terminate(&members, 499));
        assert!(termination.can_terminate(&members, 500));
    }
}
