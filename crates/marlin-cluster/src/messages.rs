//! Semantic message sets between the module and its collaborators, plus the
//! framed replicated-log entry union.
//!
//! Frames on every channel are bincode-encoded; the wire bit layout is not
//! part of the contract, the message set is.

use crate::types::{CorrelationId, LeadershipTermId, MemberId, SemanticVersion, SessionId, TimeUnit};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub fn encode<T: Serialize>(message: &T) -> Bytes {
    Bytes::from(bincode::serialize(message).expect("message encodes"))
}

pub fn decode<T: DeserializeOwned>(frame: &Bytes) -> Result<T, bincode::Error> {
    bincode::deserialize(frame)
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    ClientAction,
    ServiceAction,
    Timeout,
}

/// Egress event codes delivered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCode {
    Ok,
    Error,
    Redirect,
    Closed,
    AuthenticationRejected,
}

/// Log-replicated control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterAction {
    Suspend,
    Resume,
    Snapshot,
}

/// Membership change kinds, replicated through the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Join,
    Quit,
}

/// Client-to-module ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IngressMessage {
    SessionConnect {
        correlation_id: CorrelationId,
        response_stream_id: i32,
        protocol_version: SemanticVersion,
        response_channel: String,
        credentials: Bytes,
    },
    SessionClose {
        leadership_term_id: LeadershipTermId,
        session_id: SessionId,
    },
    SessionMessage {
        leadership_term_id: LeadershipTermId,
        session_id: SessionId,
        payload: Bytes,
    },
    SessionKeepAlive {
        leadership_term_id: LeadershipTermId,
        session_id: SessionId,
    },
    ChallengeResponse {
        correlation_id: CorrelationId,
        session_id: SessionId,
        credentials: Bytes,
    },
    /// Admin query for the current membership, answered on the session's
    /// response channel.
    ClusterMembersQuery {
        correlation_id: CorrelationId,
        session_id: SessionId,
    },
}

/// Module-to-client egress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EgressMessage {
    SessionEvent {
        correlation_id: CorrelationId,
        session_id: SessionId,
        leadership_term_id: LeadershipTermId,
        leader_member_id: MemberId,
        code: EventCode,
        detail: String,
    },
    Challenge {
        correlation_id: CorrelationId,
        session_id: SessionId,
        encoded_challenge: Bytes,
    },
    NewLeader {
        session_id: SessionId,
        leadership_term_id: LeadershipTermId,
        leader_member_id: MemberId,
        ingress_endpoints: String,
    },
}

/// A snapshot carried between members during dynamic join: the recording
/// metadata plus the recorded frames as `(end_position, payload)` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTransfer {
    pub metadata: marlin_archive::Snapshot,
    pub start_position: u64,
    pub frames: Vec<(u64, Bytes)>,
}

/// Member-status traffic, symmetric between members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsensusMessage {
    CanvassPosition {
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    },
    RequestVote {
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        candidate_term_id: LeadershipTermId,
        candidate_member_id: MemberId,
    },
    Vote {
        candidate_term_id: LeadershipTermId,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        candidate_member_id: MemberId,
        follower_member_id: MemberId,
        vote: bool,
    },
    NewLeadershipTerm {
        log_leadership_term_id: LeadershipTermId,
        leadership_term_id: LeadershipTermId,
        term_base_log_position: u64,
        /// Leader's current append position; a joiner behind this requests
        /// catch-up.
        append_position: u64,
        timestamp: u64,
        leader_member_id: MemberId,
        log_session_id: i32,
        is_startup: bool,
    },
    AppendPosition {
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    },
    CommitPosition {
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        leader_member_id: MemberId,
    },
    CatchupPosition {
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    },
    StopCatchup {
        leadership_term_id: LeadershipTermId,
        follower_member_id: MemberId,
    },
    AddPassiveMember {
        correlation_id: CorrelationId,
        member_endpoints: String,
    },
    ClusterMemberChange {
        correlation_id: CorrelationId,
        leader_member_id: MemberId,
        active_members: String,
        passive_members: String,
    },
    SnapshotRecordingQuery {
        correlation_id: CorrelationId,
        request_member_id: MemberId,
    },
    SnapshotRecordings {
        correlation_id: CorrelationId,
        member_endpoints: String,
        snapshots: Vec<SnapshotTransfer>,
    },
    JoinCluster {
        leadership_term_id: LeadershipTermId,
        member_id: MemberId,
    },
    RemoveMember {
        member_id: MemberId,
        is_passive: bool,
    },
    TerminationPosition { log_position: u64 },
    TerminationAck {
        log_position: u64,
        member_id: MemberId,
    },
    BackupQuery {
        correlation_id: CorrelationId,
        response_stream_id: i32,
        protocol_version: SemanticVersion,
        response_channel: String,
        credentials: Bytes,
    },
    BackupResponse {
        correlation_id: CorrelationId,
        log_recording_id: i64,
        last_leadership_term_id: LeadershipTermId,
        last_term_base_log_position: u64,
        commit_position: u64,
        leader_member_id: MemberId,
        cluster_members: String,
        snapshots: Vec<marlin_archive::Snapshot>,
    },
}

/// Service-to-module messages on the consensus-module stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceMessage {
    Ack {
        log_position: u64,
        timestamp: u64,
        ack_id: i64,
        relevant_id: i64,
        service_id: i32,
    },
    CloseSession { session_id: SessionId },
    SessionMessage {
        leadership_term_id: LeadershipTermId,
        payload: Bytes,
    },
    ScheduleTimer {
        correlation_id: CorrelationId,
        deadline: u64,
    },
    CancelTimer { correlation_id: CorrelationId },
    ClusterMembersQuery { correlation_id: CorrelationId },
}

/// Module-to-service control messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceControlMessage {
    JoinLog {
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        max_log_position: u64,
        member_id: MemberId,
        log_session_id: i32,
        log_channel: String,
        is_startup: bool,
    },
    TerminationPosition { log_position: u64 },
    ClusterMembersResponse {
        correlation_id: CorrelationId,
        leader_member_id: MemberId,
        active_members: String,
        passive_members: String,
    },
}

/// Entries framed onto the replicated log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    SessionOpen {
        leadership_term_id: LeadershipTermId,
        correlation_id: CorrelationId,
        session_id: SessionId,
        timestamp: u64,
        response_stream_id: i32,
        response_channel: String,
    },
    SessionClose {
        leadership_term_id: LeadershipTermId,
        session_id: SessionId,
        timestamp: u64,
        close_reason: CloseReason,
    },
    SessionMessage {
        leadership_term_id: LeadershipTermId,
        session_id: SessionId,
        timestamp: u64,
        payload: Bytes,
    },
    Timer {
        leadership_term_id: LeadershipTermId,
        correlation_id: CorrelationId,
        timestamp: u64,
    },
    ClusterAction {
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
        action: ClusterAction,
    },
    NewLeadershipTerm {
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
        term_base_log_position: u64,
        leader_member_id: MemberId,
        log_session_id: i32,
        time_unit: TimeUnit,
        app_version: SemanticVersion,
    },
    MembershipChange {
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
        leader_member_id: MemberId,
        cluster_size: u32,
        change_type: ChangeType,
        member_id: MemberId,
        members: String,
    },
}
