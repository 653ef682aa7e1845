//! Cluster membership: members, endpoint encoding and quorum math.
//!
//! Membership changes are log-replicated as endpoint strings so every
//! member derives the same member set at the same log position. A member's
//! endpoints string is `id,client,member,transfer,log`; a membership string
//! joins entries with `|`.

use crate::config::CONSENSUS_STREAM_ID;
use crate::error::{ClusterError, Result};
use crate::types::{CorrelationId, MemberId};
use marlin_archive::ReplaySessionId;
use marlin_transport::{Media, Publication};

/// One cluster member as seen by the agent.
#[derive(Debug)]
pub struct ClusterMember {
    pub id: MemberId,
    pub client_facing_endpoint: String,
    pub member_facing_endpoint: String,
    pub transfer_endpoint: String,
    pub log_endpoint: String,

    /// Consensus publication to this member, absent until wired.
    pub publication: Option<Publication>,

    pub is_leader: bool,
    pub has_requested_join: bool,
    pub has_requested_remove: bool,
    pub has_terminated: bool,

    /// Last append position this member reported.
    pub log_position: u64,
    pub time_of_last_append_position_ns: u64,

    /// Pending passive-add acknowledgement correlation.
    pub correlation_id: CorrelationId,

    /// Active catch-up replay toward this member, if any.
    pub catchup_replay_session_id: Option<ReplaySessionId>,

    /// Log position at which a requested removal takes effect.
    pub removal_position: Option<u64>,
}

impl ClusterMember {
    pub fn new(
        id: MemberId,
        client_facing_endpoint: impl Into<String>,
        member_facing_endpoint: impl Into<String>,
        transfer_endpoint: impl Into<String>,
        log_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id,
            client_facing_endpoint: client_facing_endpoint.into(),
            member_facing_endpoint: member_facing_endpoint.into(),
            transfer_endpoint: transfer_endpoint.into(),
            log_endpoint: log_endpoint.into(),
            publication: None,
            is_leader: false,
            has_requested_join: false,
            has_requested_remove: false,
            has_terminated: false,
            log_position: 0,
            time_of_last_append_position_ns: 0,
            correlation_id: CorrelationId::NONE,
            catchup_replay_session_id: None,
            removal_position: None,
        }
    }

    /// Parse a single `id,client,member,transfer,log` entry.
    pub fn parse_endpoints(entry: &str) -> Result<ClusterMember> {
        let parts: Vec<&str> = entry.split(',').collect();
        if parts.len() != 5 {
            return Err(ClusterError::Configuration {
                detail: format!("member endpoints must have 5 fields: {entry}"),
            });
        }

        let id: i32 = parts[0].parse().map_err(|_| ClusterError::Configuration {
            detail: format!("invalid member id: {}", parts[0]),
        })?;

        Ok(ClusterMember::new(
            MemberId(id),
            parts[1],
            parts[2],
            parts[3],
            parts[4],
        ))
    }

    /// Re-encode this member's endpoints entry.
    pub fn endpoints(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.id.0,
            self.client_facing_endpoint,
            self.member_facing_endpoint,
            self.transfer_endpoint,
            self.log_endpoint
        )
    }

    /// Open the consensus publication to this member if not already open.
    pub fn ensure_publication(&mut self, media: &Media) {
        if self.publication.is_none() {
            self.publication =
                Some(media.add_publication(&self.member_facing_endpoint, CONSENSUS_STREAM_ID));
        }
    }

    pub fn close_publication(&mut self) {
        self.publication = None;
    }
}

/// Parse a `|`-joined membership string. Empty input is an empty set.
pub fn parse_members(members: &str) -> Result<Vec<ClusterMember>> {
    if members.is_empty() {
        return Ok(Vec::new());
    }

    members.split('|').map(ClusterMember::parse_endpoints).collect()
}

/// Encode a member set back into the membership string form used in
/// membership-change log entries.
pub fn encode_as_string(members: &[ClusterMember]) -> String {
    members
        .iter()
        .map(ClusterMember::endpoints)
        .collect::<Vec<_>>()
        .join("|")
}

/// `id=endpoint` list clients use to find the cluster after a redirect.
pub fn client_facing_endpoints(members: &[ClusterMember]) -> String {
    members
        .iter()
        .map(|m| format!("{}={}", m.id.0, m.client_facing_endpoint))
        .collect::<Vec<_>>()
        .join(",")
}

/// Quorum size for `member_count` voting members.
pub fn quorum_threshold(member_count: usize) -> usize {
    member_count / 2 + 1
}

/// The position replicated to a quorum: rank positions descending and take
/// the `threshold`-th largest.
pub fn quorum_position(members: &[ClusterMember]) -> u64 {
    if members.is_empty() {
        return 0;
    }

    let mut positions: Vec<u64> = members.iter().map(|m| m.log_position).collect();
    positions.sort_unstable_by(|a, b| b.cmp(a));
    positions[quorum_threshold(members.len()) - 1]
}

/// True while append-position heartbeats from a quorum (the leader counts
/// itself) are fresher than `timeout_ns`.
pub fn has_active_quorum(members: &[ClusterMember], now_ns: u64, timeout_ns: u64) -> bool {
    let active = members
        .iter()
        .filter(|m| now_ns <= m.time_of_last_append_position_ns + timeout_ns)
        .count();

    active >= quorum_threshold(members.len())
}

pub fn high_member_id(members: &[ClusterMember]) -> i32 {
    members.iter().map(|m| m.id.0).max().unwrap_or(-1)
}

pub fn find_member(members: &[ClusterMember], id: MemberId) -> Option<&ClusterMember> {
    members.iter().find(|m| m.id == id)
}

pub fn find_member_mut(members: &mut [ClusterMember], id: MemberId) -> Option<&mut ClusterMember> {
    members.iter_mut().find(|m| m.id == id)
}

pub fn remove_member(members: &mut Vec<ClusterMember>, id: MemberId) -> Option<ClusterMember> {
    members
        .iter()
        .position(|m| m.id == id)
        .map(|index| members.remove(index))
}

/// True when no existing member already claims these endpoints.
pub fn is_not_duplicate_endpoint(members: &[ClusterMember], endpoints: &str) -> bool {
    !members.iter().any(|m| m.endpoints() == endpoints)
}

/// Open consensus publications from `this_member` to every other member.
pub fn add_consensus_publications(
    members: &mut [ClusterMember],
    this_member_id: MemberId,
    media: &Media,
) {
    for member in members.iter_mut() {
        if member.id != this_member_id {
            member.ensure_publication(media);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members_string() -> String {
        "0,c0,m0,t0,l0|1,c1,m1,t1,l1|2,c2,m2,t2,l2".to_string()
    }

    #[test]
    fn parse_and_encode_round_trip() {
        let members = parse_members(&members_string()).unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[1].id, MemberId(1));
        assert_eq!(members[1].log_endpoint, "l1");
        assert_eq!(encode_as_string(&members), members_string());
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        assert!(parse_members("0,c0,m0").is_err());
        assert!(parse_members("x,c0,m0,t0,l0").is_err());
    }

    #[test]
    fn quorum_threshold_is_majority() {
        assert_eq!(quorum_threshold(1), 1);
        assert_eq!(quorum_threshold(3), 2);
        assert_eq!(quorum_threshold(4), 3);
        assert_eq!(quorum_threshold(5), 3);
    }

    #[test]
    fn quorum_position_takes_ranked_majority() {
        let mut members = parse_members(&members_string()).unwrap();
        members[0].log_position = 960;
        members[1].log_position = 640;
        members[2].log_position = 320;

        // Two of three members are at 640 or beyond.
        assert_eq!(quorum_position(&members), 640);

        members[2].log_position = 960;
        assert_eq!(quorum_position(&members), 960);
    }

    #[test]
    fn active_quorum_requires_fresh_heartbeats() {
        let mut members = parse_members(&members_string()).unwrap();
        for member in members.iter_mut() {
            member.time_of_last_append_position_ns = 1_000;
        }

        assert!(has_active_quorum(&members, 1_500, 1_000));

        members[1].time_of_last_append_position_ns = 0;
        members[2].time_of_last_append_position_ns = 0;
        assert!(!has_active_quorum(&members, 5_000, 1_000));
    }

    #[test]
    fn client_facing_endpoint_list() {
        let members = parse_members(&members_string()).unwrap();
        assert_eq!(client_facing_endpoints(&members), "0=c0,1=c1,2=c2");
    }
}
