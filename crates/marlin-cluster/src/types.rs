//! Core cluster types: term, member, session and correlation identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for "no value" id fields, matching the wire convention.
pub const NULL_VALUE: i64 = -1;

/// Leadership term identifier (monotonically increasing).
///
/// Identifies a contiguous period of leadership by one member. A fresh
/// cluster starts before any term at [`LeadershipTermId::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeadershipTermId(pub i64);

impl LeadershipTermId {
    pub const NONE: LeadershipTermId = LeadershipTermId(NULL_VALUE);

    pub fn next(self) -> LeadershipTermId {
        LeadershipTermId(self.0 + 1)
    }

    pub fn is_none(self) -> bool {
        self.0 == NULL_VALUE
    }
}

impl fmt::Display for LeadershipTermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Cluster member identifier, unique within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub i32);

impl MemberId {
    pub const NONE: MemberId = MemberId(-1);

    pub fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Cluster session identifier.
///
/// Client sessions get leader-assigned ids counting up from 1. Service
/// sessions draw from a reserved range counting up from `i64::MIN + 1`,
/// so the two ranges can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub i64);

impl SessionId {
    pub const NONE: SessionId = SessionId(NULL_VALUE);

    /// First id of the reserved service-session range.
    pub const FIRST_SERVICE_SESSION: SessionId = SessionId(i64::MIN + 1);

    pub fn next(self) -> SessionId {
        SessionId(self.0 + 1)
    }

    /// True for ids drawn from the reserved service-session range.
    pub fn is_service_session(self) -> bool {
        self.0 < 0 && self.0 != NULL_VALUE
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Correlation identifier for request/response pairing and timer keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub i64);

impl CorrelationId {
    pub const NONE: CorrelationId = CorrelationId(NULL_VALUE);
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Unit of the cluster clock. Timestamps in log entries and snapshots are
/// expressed in this unit; mixing units across a log is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
}

impl TimeUnit {
    pub fn to_nanos(self, ticks: u64) -> u64 {
        match self {
            TimeUnit::Nanoseconds => ticks,
            TimeUnit::Microseconds => ticks * 1_000,
            TimeUnit::Milliseconds => ticks * 1_000_000,
        }
    }

    pub fn from_nanos(self, nanos: u64) -> u64 {
        match self {
            TimeUnit::Nanoseconds => nanos,
            TimeUnit::Microseconds => nanos / 1_000,
            TimeUnit::Milliseconds => nanos / 1_000_000,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeUnit::Nanoseconds => write!(f, "ns"),
            TimeUnit::Microseconds => write!(f, "us"),
            TimeUnit::Milliseconds => write!(f, "ms"),
        }
    }
}

/// Semantic version carried by protocol handshakes, log headers and
/// snapshots. Compatibility is judged on the major component only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl SemanticVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_compatible_with(self, other: SemanticVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leadership_term_ordering() {
        assert!(LeadershipTermId(2) > LeadershipTermId(1));
        assert!(LeadershipTermId(0) > LeadershipTermId::NONE);
        assert_eq!(LeadershipTermId::NONE.next(), LeadershipTermId(0));
    }

    #[test]
    fn service_session_range_is_disjoint_from_client_range() {
        let first = SessionId::FIRST_SERVICE_SESSION;
        assert!(first.is_service_session());
        assert!(first.next().is_service_session());
        assert!(!SessionId(1).is_service_session());
        assert!(!SessionId::NONE.is_service_session());
    }

    #[test]
    fn time_unit_conversions() {
        assert_eq!(TimeUnit::Milliseconds.to_nanos(5), 5_000_000);
        assert_eq!(TimeUnit::Milliseconds.from_nanos(5_000_000), 5);
        assert_eq!(TimeUnit::Nanoseconds.to_nanos(42), 42);
    }

    #[test]
    fn version_compatibility_is_major_only() {
        let ours = SemanticVersion::new(1, 3, 0);
        assert!(ours.is_compatible_with(SemanticVersion::new(1, 0, 9)));
        assert!(!ours.is_compatible_with(SemanticVersion::new(2, 3, 0)));
    }
}
