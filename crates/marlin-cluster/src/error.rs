//! Cluster error model.
//!
//! Every error kind carries a disposition [`Category`]: fatal errors close
//! the module and run the termination hook, recoverable errors trigger an
//! election, warnings are counted and logged. Errors never unwind across a
//! `do_work` boundary unless they are fatal.

use crate::types::{SemanticVersion, SessionId, TimeUnit};
use marlin_observe::Counter;
use thiserror::Error;

/// Disposition of an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Terminate the module.
    Fatal,
    /// Enter election and carry on.
    Recoverable,
    /// Count, log, continue.
    Warn,
}

#[derive(Error, Debug)]
pub enum ClusterError {
    /// A publication, subscription or the messaging client closed under us.
    #[error("transport closed: {detail}")]
    TransportClosed { detail: String },

    /// A recording ended while the module still depended on it.
    #[error("recording {recording_id} stopped unexpectedly")]
    RecordingStopped { recording_id: i64 },

    /// Replayed log or snapshot carries an incompatible application major.
    #[error("incompatible version: ours {ours}, log {theirs}")]
    IncompatibleVersion {
        ours: SemanticVersion,
        theirs: SemanticVersion,
    },

    /// Replayed log or snapshot timestamps use a different clock unit.
    #[error("incompatible time unit: ours {ours}, log {theirs}")]
    IncompatibleTimeUnit { ours: TimeUnit, theirs: TimeUnit },

    /// Pending service-message ring cannot accept another message.
    #[error("pending service message capacity exceeded: {size}")]
    CapacityExceeded { size: usize },

    /// No append-position heartbeat from a quorum of followers.
    #[error("inactive follower quorum")]
    QuorumLost,

    /// Follower observed no leader activity within the timeout.
    #[error("leader heartbeat timeout")]
    LeaderHeartbeatTimeout,

    /// A message implying a different leadership arrangement, e.g. a vote
    /// request or commit position from a newer term.
    #[error("unexpected role message: {detail}")]
    UnexpectedRoleMessage { detail: String },

    /// A service acknowledged a snapshot at the wrong log position.
    #[error("invalid service ack: service {service_id} acked {actual:?}, expected {expected}")]
    SnapshotInvalidAck {
        service_id: i32,
        expected: u64,
        actual: Option<u64>,
    },

    /// Archive control operation failed.
    #[error("archive: {source}")]
    Archive {
        #[from]
        source: marlin_archive::ArchiveError,
    },

    /// A frame failed to encode or decode.
    #[error("codec: {source}")]
    Codec {
        #[from]
        source: bincode::Error,
    },

    /// An idle session passed its timeout.
    #[error("session {session_id} timed out")]
    SessionTimeout { session_id: SessionId },

    /// Invalid configuration.
    #[error("configuration: {detail}")]
    Configuration { detail: String },

    /// The log image closed while entries remained to consume.
    #[error("log disconnected from leader: {detail}")]
    LogDisconnected { detail: String },
}

impl ClusterError {
    pub fn category(&self) -> Category {
        match self {
            ClusterError::TransportClosed { .. }
            | ClusterError::RecordingStopped { .. }
            | ClusterError::IncompatibleVersion { .. }
            | ClusterError::IncompatibleTimeUnit { .. }
            | ClusterError::CapacityExceeded { .. }
            | ClusterError::SnapshotInvalidAck { .. }
            | ClusterError::Configuration { .. } => Category::Fatal,

            ClusterError::QuorumLost
            | ClusterError::LeaderHeartbeatTimeout
            | ClusterError::UnexpectedRoleMessage { .. }
            | ClusterError::LogDisconnected { .. } => Category::Recoverable,

            ClusterError::Archive { .. }
            | ClusterError::Codec { .. }
            | ClusterError::SessionTimeout { .. } => Category::Warn,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Error sink that counts every error and logs it at a level matching its
/// category.
#[derive(Clone, Default)]
pub struct CountedErrorHandler {
    errors: Counter,
}

impl CountedErrorHandler {
    pub fn new(errors: Counter) -> Self {
        Self { errors }
    }

    pub fn on_error(&self, error: &ClusterError) {
        self.errors.increment();
        match error.category() {
            Category::Fatal => tracing::error!(%error, "fatal cluster error"),
            Category::Recoverable => tracing::warn!(%error, "recoverable cluster error"),
            Category::Warn => tracing::warn!(%error, "cluster warning"),
        }
    }

    pub fn error_count(&self) -> u64 {
        self.errors.get()
    }
}
