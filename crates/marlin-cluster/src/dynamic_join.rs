//! Dynamic join: bootstrap an empty node into a running cluster.
//!
//! The joiner announces itself to the configured status endpoints, learns
//! its assigned member id and the active membership, pulls the leader's
//! latest snapshot set into local recordings, and then hands off to a
//! normal (non-initial) election as a passive follower. Promotion to a
//! voting member happens later through a log-replicated JOIN once the
//! leader sees the joiner caught up.

use crate::agent::ConsensusModuleAgent;
use crate::config::CONSENSUS_STREAM_ID;
use crate::error::Result;
use crate::messages::SnapshotTransfer;
use crate::types::{CorrelationId, MemberId};
use marlin_transport::{LogFrame, Publication};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    AnnouncePassive,
    AwaitMembersChange,
    QuerySnapshots,
    AwaitSnapshots,
    Complete,
}

pub struct DynamicJoin {
    state: JoinState,
    correlation_id: CorrelationId,
    status_publications: Vec<Publication>,
    leader_publication: Option<Publication>,
    leader_member_id: MemberId,
    active_members: String,
    time_of_last_send_ns: u64,
}

impl DynamicJoin {
    pub fn new(agent: &mut ConsensusModuleAgent) -> Self {
        let correlation_id = CorrelationId(agent.next_correlation_id());
        let media = agent.media();
        let status_publications = agent
            .config()
            .status_endpoints
            .iter()
            .map(|endpoint| media.add_publication(endpoint, CONSENSUS_STREAM_ID))
            .collect();

        Self {
            state: JoinState::AnnouncePassive,
            correlation_id,
            status_publications,
            leader_publication: None,
            leader_member_id: MemberId::NONE,
            active_members: String::new(),
            time_of_last_send_ns: 0,
        }
    }

    /// Drive the join. Returns true once snapshots are local and the agent
    /// should transition to election.
    pub fn do_work(&mut self, agent: &mut ConsensusModuleAgent, now_ns: u64) -> Result<bool> {
        let resend_interval = agent.config().election_canvass_interval.as_nanos() as u64;

        match self.state {
            JoinState::AnnouncePassive => {
                if now_ns >= self.time_of_last_send_ns + resend_interval {
                    self.time_of_last_send_ns = now_ns;
                    let endpoints = agent.this_member_endpoints_without_id();
                    let message = crate::messages::ConsensusMessage::AddPassiveMember {
                        correlation_id: self.correlation_id,
                        member_endpoints: endpoints,
                    };
                    for publication in &self.status_publications {
                        agent.consensus_publisher().send(publication, &message);
                    }
                    self.state = JoinState::AwaitMembersChange;
                }
                Ok(false)
            }
            JoinState::AwaitMembersChange => {
                if now_ns >= self.time_of_last_send_ns + resend_interval * 8 {
                    // Announcement may have been lost; go again.
                    self.state = JoinState::AnnouncePassive;
                }
                Ok(false)
            }
            JoinState::QuerySnapshots => {
                let message = crate::messages::ConsensusMessage::SnapshotRecordingQuery {
                    correlation_id: self.correlation_id,
                    request_member_id: agent.member_id(),
                };
                if let Some(publication) = self.leader_publication.as_ref() {
                    if agent.consensus_publisher().send(publication, &message) {
                        self.time_of_last_send_ns = now_ns;
                        self.state = JoinState::AwaitSnapshots;
                    }
                }
                Ok(false)
            }
            JoinState::AwaitSnapshots => {
                if now_ns >= self.time_of_last_send_ns + resend_interval * 8 {
                    self.state = JoinState::QuerySnapshots;
                }
                Ok(false)
            }
            JoinState::Complete => Ok(true),
        }
    }

    /// The leader (via its passive-member pass) confirmed the add and
    /// assigned this node its member id.
    pub fn on_cluster_members_change(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        correlation_id: CorrelationId,
        leader_member_id: MemberId,
        active_members: &str,
        passive_members: &str,
    ) {
        if correlation_id != self.correlation_id || self.state != JoinState::AwaitMembersChange {
            return;
        }

        let own_endpoints = agent.this_member_endpoints_without_id();
        let Some(assigned_id) = find_assigned_member_id(passive_members, &own_endpoints) else {
            return;
        };

        agent.adopt_member_id(assigned_id);
        self.leader_member_id = leader_member_id;
        self.active_members = active_members.to_string();

        if let Ok(members) = crate::member::parse_members(active_members) {
            if let Some(leader) = crate::member::find_member(&members, leader_member_id) {
                self.leader_publication = Some(
                    agent
                        .media()
                        .add_publication(&leader.member_facing_endpoint, CONSENSUS_STREAM_ID),
                );
            }
        }

        tracing::info!(
            member_id = %assigned_id,
            leader = %leader_member_id,
            "joined as passive member"
        );

        self.state = JoinState::QuerySnapshots;
    }

    /// The leader answered with its latest snapshot set; adopt it into the
    /// local archive and finish.
    pub fn on_snapshot_recordings(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        correlation_id: CorrelationId,
        member_endpoints: &str,
        snapshots: Vec<SnapshotTransfer>,
    ) -> Result<()> {
        if correlation_id != self.correlation_id || self.state != JoinState::AwaitSnapshots {
            return Ok(());
        }

        if !member_endpoints.is_empty() {
            self.active_members = member_endpoints.to_string();
        }

        for transfer in snapshots {
            let frames = transfer
                .frames
                .into_iter()
                .map(|(end_position, payload)| LogFrame {
                    end_position,
                    payload,
                })
                .collect();

            let local_recording_id = agent
                .archive()
                .record_frames(transfer.start_position, frames)?;

            let mut snapshot = transfer.metadata;
            snapshot.recording_id = local_recording_id;
            agent.add_retrieved_snapshot(snapshot);
        }

        self.state = JoinState::Complete;
        Ok(())
    }

    pub fn leader_member_id(&self) -> MemberId {
        self.leader_member_id
    }

    pub fn active_members(&self) -> &str {
        &self.active_members
    }
}

/// Find this node's assigned id by matching its endpoints within the
/// passive-member list.
fn find_assigned_member_id(passive_members: &str, own_endpoints: &str) -> Option<MemberId> {
    crate::member::parse_members(passive_members)
        .ok()?
        .iter()
        .find(|m| {
            format!(
                "{},{},{},{}",
                m.client_facing_endpoint, m.member_facing_endpoint, m.transfer_endpoint, m.log_endpoint
            ) == own_endpoints
        })
        .map(|m| m.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigned_member_id_is_found_by_endpoints() {
        let passive = "3,c3,m3,t3,l3|4,c4,m4,t4,l4";
        assert_eq!(
            find_assigned_member_id(passive, "c4,m4,t4,l4"),
            Some(MemberId(4))
        );
        assert_eq!(find_assigned_member_id(passive, "c9,m9,t9,l9"), None);
    }
}
