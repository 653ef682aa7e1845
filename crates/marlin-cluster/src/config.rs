//! Cluster configuration: timeouts, limits and channel naming.

use crate::error::{ClusterError, Result};
use crate::types::{MemberId, SemanticVersion, TimeUnit};
use rand::Rng;
use std::time::Duration;

/// Stream id for member-to-member consensus traffic.
pub const CONSENSUS_STREAM_ID: i32 = 100;
/// Stream id for client ingress.
pub const INGRESS_STREAM_ID: i32 = 101;
/// Stream id for client egress (response channels).
pub const EGRESS_STREAM_ID: i32 = 102;
/// Stream id for the replicated log.
pub const LOG_STREAM_ID: i32 = 103;
/// Stream id for module-to-service control messages.
pub const SERVICE_STREAM_ID: i32 = 104;
/// Stream id for service-to-module messages.
pub const CONSENSUS_MODULE_STREAM_ID: i32 = 105;
/// Stream id for snapshot streams.
pub const SNAPSHOT_STREAM_ID: i32 = 106;

/// Consensus module configuration.
///
/// Defaults mirror production values; tests shrink the timeouts and drive a
/// manual clock.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This member's id, or [`MemberId::NONE`] when joining dynamically.
    pub member_id: MemberId,

    /// Active membership as an endpoints string:
    /// `id,client,member,transfer,log` entries joined by `|`.
    /// Empty when the node bootstraps through dynamic join.
    pub members: String,

    /// Member-facing endpoints to query when `members` is empty and this
    /// node must join an existing cluster.
    pub status_endpoints: Vec<String>,

    /// Channel the hosted services and the module share, unique per node.
    pub service_control_channel: String,

    /// Directory for the recording log and mark file.
    pub cluster_dir: std::path::PathBuf,

    /// Application version stamped into log headers and snapshots.
    /// A major mismatch on replay is fatal.
    pub app_version: SemanticVersion,

    /// Protocol version clients must match on the major component.
    pub protocol_version: SemanticVersion,

    /// Unit of the cluster clock and of every timestamp in the log.
    pub time_unit: TimeUnit,

    /// Idle client sessions are closed after this long without activity.
    pub session_timeout: Duration,

    /// Cadence at which the leader re-broadcasts its commit position.
    pub leader_heartbeat_interval: Duration,

    /// A follower without leader contact for this long enters election;
    /// a leader without a quorum of append positions for this long does
    /// the same.
    pub leader_heartbeat_timeout: Duration,

    /// Interval between canvass rounds while electing.
    pub election_canvass_interval: Duration,

    /// Bounds for the randomized nomination fallback when the ranked
    /// favourite fails to nominate.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,

    /// Catch-up replay is considered stalled after this long without an
    /// append-position advance.
    pub catchup_timeout: Duration,

    /// Overall budget for coordinated termination.
    pub termination_timeout: Duration,

    /// Cadence for mark-file activity timestamps.
    pub mark_file_update_interval: Duration,

    /// Timer-wheel tick resolution.
    pub wheel_tick_resolution: Duration,

    /// Timer-wheel spoke count, rounded up to a power of two.
    pub ticks_per_wheel: usize,

    /// Pending plus open sessions are capped at this count.
    pub max_concurrent_sessions: usize,

    /// Pending service-message ring capacity in messages.
    pub pending_message_capacity: usize,

    /// Number of hosted services acking log positions.
    pub service_count: usize,

    /// 0 = no fsync, 1 = fdatasync, 2 = full fsync on snapshot appends.
    pub file_sync_level: u8,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            member_id: MemberId(0),
            members: String::new(),
            status_endpoints: Vec::new(),
            service_control_channel: "service-control".to_string(),
            cluster_dir: std::path::PathBuf::from("cluster"),
            app_version: SemanticVersion::new(1, 0, 0),
            protocol_version: SemanticVersion::new(1, 0, 0),
            time_unit: TimeUnit::Milliseconds,
            session_timeout: Duration::from_secs(10),
            leader_heartbeat_interval: Duration::from_millis(200),
            leader_heartbeat_timeout: Duration::from_secs(10),
            election_canvass_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1_000),
            catchup_timeout: Duration::from_secs(10),
            termination_timeout: Duration::from_secs(5),
            mark_file_update_interval: Duration::from_secs(1),
            wheel_tick_resolution: Duration::from_millis(8),
            ticks_per_wheel: 128,
            max_concurrent_sessions: 10,
            pending_message_capacity: 512,
            service_count: 1,
            file_sync_level: 0,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.leader_heartbeat_interval >= self.leader_heartbeat_timeout {
            return Err(ClusterError::Configuration {
                detail: format!(
                    "leader_heartbeat_interval {:?} must be < leader_heartbeat_timeout {:?}",
                    self.leader_heartbeat_interval, self.leader_heartbeat_timeout
                ),
            });
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ClusterError::Configuration {
                detail: format!(
                    "election_timeout_min {:?} must be < election_timeout_max {:?}",
                    self.election_timeout_min, self.election_timeout_max
                ),
            });
        }

        if self.members.is_empty() && self.status_endpoints.is_empty() {
            return Err(ClusterError::Configuration {
                detail: "either members or status_endpoints must be set".to_string(),
            });
        }

        if self.max_concurrent_sessions == 0 || self.pending_message_capacity == 0 {
            return Err(ClusterError::Configuration {
                detail: "session and pending-message limits must be positive".to_string(),
            });
        }

        Ok(())
    }

    /// Randomized fallback nomination timeout, distinct per member so the
    /// ranked favourite is given first chance.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_nanos() as u64;
        let max = self.election_timeout_max.as_nanos() as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(min..=max))
    }

    pub fn session_timeout_ns(&self) -> u64 {
        self.session_timeout.as_nanos() as u64
    }

    pub fn leader_heartbeat_interval_ns(&self) -> u64 {
        self.leader_heartbeat_interval.as_nanos() as u64
    }

    pub fn leader_heartbeat_timeout_ns(&self) -> u64 {
        self.leader_heartbeat_timeout.as_nanos() as u64
    }

    pub fn catchup_timeout_ns(&self) -> u64 {
        self.catchup_timeout.as_nanos() as u64
    }

    pub fn termination_timeout_ns(&self) -> u64 {
        self.termination_timeout.as_nanos() as u64
    }

    pub fn mark_file_update_interval_ns(&self) -> u64 {
        self.mark_file_update_interval.as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ClusterConfig {
        ClusterConfig {
            members: "0,c0,m0,t0,l0".to_string(),
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn default_with_members_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn heartbeat_interval_must_undercut_timeout() {
        let mut config = valid_config();
        config.leader_heartbeat_interval = Duration::from_secs(20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_membership_requires_status_endpoints() {
        let mut config = valid_config();
        config.members.clear();
        assert!(config.validate().is_err());

        config.status_endpoints = vec!["m1".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn random_election_timeout_in_bounds() {
        let config = valid_config();
        for _ in 0..50 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }
}
