//! Consensus-module snapshot stream: taker and loader.
//!
//! A snapshot is a framed stream recorded by the archive: a BEGIN marker,
//! the module state, membership, every OPEN or CLOSED session, the timer
//! wheel, the pending service-message ring, and an END marker. Loading is
//! the symmetric walk, validating the app-version major and the time unit
//! before any state is applied.

use crate::error::{ClusterError, Result};
use crate::messages::{decode, encode, CloseReason};
use crate::session::{ClusterSession, SessionState};
use crate::timer_wheel::TimerEntry;
use crate::types::{CorrelationId, LeadershipTermId, SemanticVersion, SessionId, TimeUnit};
use bytes::Bytes;
use marlin_transport::{IdleStrategy, LogFrame, LogPublication};
use serde::{Deserialize, Serialize};

/// Type id in snapshot BEGIN/END markers for the consensus module.
pub const SNAPSHOT_TYPE_ID: i64 = 1;

/// One frame of the snapshot stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotFrame {
    Begin {
        snapshot_type_id: i64,
        log_position: u64,
        leadership_term_id: LeadershipTermId,
        time_unit: TimeUnit,
        app_version: SemanticVersion,
    },
    ConsensusModuleState {
        next_session_id: SessionId,
        next_service_session_id: SessionId,
        log_service_session_id: SessionId,
        pending_message_count: u32,
    },
    ClusterMembers {
        member_id: i32,
        high_member_id: i32,
        members: String,
    },
    Session {
        session_id: SessionId,
        correlation_id: CorrelationId,
        opened_log_position: u64,
        time_of_last_activity_ns: u64,
        close_reason: Option<CloseReason>,
        response_stream_id: i32,
        response_channel: String,
    },
    Timer {
        correlation_id: CorrelationId,
        deadline: u64,
    },
    PendingMessage {
        service_session_id: SessionId,
        payload: Bytes,
    },
    End {
        snapshot_type_id: i64,
        log_position: u64,
        leadership_term_id: LeadershipTermId,
        time_unit: TimeUnit,
        app_version: SemanticVersion,
    },
}

/// Emits the snapshot stream onto an exclusive publication being recorded
/// by the archive. Appends spin on flow control with the idle strategy.
pub struct SnapshotTaker<'a> {
    publication: &'a mut LogPublication,
    idle: IdleStrategy,
}

impl<'a> SnapshotTaker<'a> {
    pub fn new(publication: &'a mut LogPublication) -> Self {
        Self {
            publication,
            idle: IdleStrategy::new(),
        }
    }

    fn append(&mut self, frame: &SnapshotFrame) -> Result<()> {
        let payload = encode(frame);
        loop {
            if self.publication.try_append(&payload) > 0 {
                self.idle.reset();
                return Ok(());
            }
            if !self.publication.is_connected() {
                return Err(ClusterError::TransportClosed {
                    detail: "snapshot publication closed".to_string(),
                });
            }
            self.idle.idle_step();
        }
    }

    pub fn mark_begin(
        &mut self,
        log_position: u64,
        leadership_term_id: LeadershipTermId,
        time_unit: TimeUnit,
        app_version: SemanticVersion,
    ) -> Result<()> {
        self.append(&SnapshotFrame::Begin {
            snapshot_type_id: SNAPSHOT_TYPE_ID,
            log_position,
            leadership_term_id,
            time_unit,
            app_version,
        })
    }

    pub fn snapshot_consensus_module_state(
        &mut self,
        next_session_id: SessionId,
        next_service_session_id: SessionId,
        log_service_session_id: SessionId,
        pending_message_count: u32,
    ) -> Result<()> {
        self.append(&SnapshotFrame::ConsensusModuleState {
            next_session_id,
            next_service_session_id,
            log_service_session_id,
            pending_message_count,
        })
    }

    pub fn snapshot_cluster_members(
        &mut self,
        member_id: i32,
        high_member_id: i32,
        members: &str,
    ) -> Result<()> {
        self.append(&SnapshotFrame::ClusterMembers {
            member_id,
            high_member_id,
            members: members.to_string(),
        })
    }

    /// Only OPEN and CLOSED sessions belong in a snapshot; pending
    /// handshakes are not replicated state.
    pub fn snapshot_session(&mut self, session: &ClusterSession) -> Result<()> {
        debug_assert!(matches!(
            session.state(),
            SessionState::Open | SessionState::Closed
        ));

        self.append(&SnapshotFrame::Session {
            session_id: session.id(),
            correlation_id: session.correlation_id(),
            opened_log_position: session.opened_log_position().unwrap_or(0),
            time_of_last_activity_ns: session.time_of_last_activity_ns(),
            close_reason: if session.state() == SessionState::Closed {
                session.close_reason()
            } else {
                None
            },
            response_stream_id: session.response_stream_id(),
            response_channel: session.response_channel().to_string(),
        })
    }

    pub fn snapshot_timer(&mut self, entry: TimerEntry) -> Result<()> {
        self.append(&SnapshotFrame::Timer {
            correlation_id: entry.correlation_id,
            deadline: entry.deadline,
        })
    }

    pub fn snapshot_pending_message(
        &mut self,
        service_session_id: SessionId,
        payload: Bytes,
    ) -> Result<()> {
        self.append(&SnapshotFrame::PendingMessage {
            service_session_id,
            payload,
        })
    }

    pub fn mark_end(
        &mut self,
        log_position: u64,
        leadership_term_id: LeadershipTermId,
        time_unit: TimeUnit,
        app_version: SemanticVersion,
    ) -> Result<()> {
        self.append(&SnapshotFrame::End {
            snapshot_type_id: SNAPSHOT_TYPE_ID,
            log_position,
            leadership_term_id,
            time_unit,
            app_version,
        })
    }
}

/// A fully parsed consensus-module snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusModuleSnapshot {
    pub log_position: u64,
    pub leadership_term_id: LeadershipTermId,
    pub next_session_id: SessionId,
    pub next_service_session_id: SessionId,
    pub log_service_session_id: SessionId,
    pub pending_message_count: u32,
    pub member_id: i32,
    pub high_member_id: i32,
    pub members: String,
    pub sessions: Vec<SessionSnapshot>,
    pub timers: Vec<TimerEntry>,
    pub pending_messages: Vec<(SessionId, Bytes)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub correlation_id: CorrelationId,
    pub opened_log_position: u64,
    pub time_of_last_activity_ns: u64,
    pub close_reason: Option<CloseReason>,
    pub response_stream_id: i32,
    pub response_channel: String,
}

/// Parse and validate a recorded snapshot frame stream.
pub fn load_snapshot(
    frames: &[LogFrame],
    our_version: SemanticVersion,
    our_time_unit: TimeUnit,
) -> Result<ConsensusModuleSnapshot> {
    let mut iter = frames.iter();

    let begin = iter
        .next()
        .ok_or_else(|| ClusterError::Configuration {
            detail: "snapshot stream is empty".to_string(),
        })
        .and_then(|f| decode::<SnapshotFrame>(&f.payload).map_err(ClusterError::from))?;

    let (log_position, leadership_term_id) = match begin {
        SnapshotFrame::Begin {
            snapshot_type_id,
            log_position,
            leadership_term_id,
            time_unit,
            app_version,
        } => {
            if snapshot_type_id != SNAPSHOT_TYPE_ID {
                return Err(ClusterError::Configuration {
                    detail: format!("unexpected snapshot type {snapshot_type_id}"),
                });
            }
            if !our_version.is_compatible_with(app_version) {
                return Err(ClusterError::IncompatibleVersion {
                    ours: our_version,
                    theirs: app_version,
                });
            }
            if time_unit != our_time_unit {
                return Err(ClusterError::IncompatibleTimeUnit {
                    ours: our_time_unit,
                    theirs: time_unit,
                });
            }
            (log_position, leadership_term_id)
        }
        other => {
            return Err(ClusterError::Configuration {
                detail: format!("snapshot does not start with BEGIN: {other:?}"),
            })
        }
    };

    let mut snapshot = ConsensusModuleSnapshot {
        log_position,
        leadership_term_id,
        next_session_id: SessionId(1),
        next_service_session_id: SessionId::FIRST_SERVICE_SESSION,
        log_service_session_id: SessionId(i64::MIN),
        pending_message_count: 0,
        member_id: -1,
        high_member_id: -1,
        members: String::new(),
        sessions: Vec::new(),
        timers: Vec::new(),
        pending_messages: Vec::new(),
    };

    let mut ended = false;
    for frame in iter {
        match decode::<SnapshotFrame>(&frame.payload)? {
            SnapshotFrame::ConsensusModuleState {
                next_session_id,
                next_service_session_id,
                log_service_session_id,
                pending_message_count,
            } => {
                snapshot.next_session_id = next_session_id;
                snapshot.next_service_session_id = next_service_session_id;
                snapshot.log_service_session_id = log_service_session_id;
                snapshot.pending_message_count = pending_message_count;
            }
            SnapshotFrame::ClusterMembers {
                member_id,
                high_member_id,
                members,
            } => {
                snapshot.member_id = member_id;
                snapshot.high_member_id = high_member_id;
                snapshot.members = members;
            }
            SnapshotFrame::Session {
                session_id,
                correlation_id,
                opened_log_position,
                time_of_last_activity_ns,
                close_reason,
                response_stream_id,
                response_channel,
            } => snapshot.sessions.push(SessionSnapshot {
                session_id,
                correlation_id,
                opened_log_position,
                time_of_last_activity_ns,
                close_reason,
                response_stream_id,
                response_channel,
            }),
            SnapshotFrame::Timer {
                correlation_id,
                deadline,
            } => snapshot.timers.push(TimerEntry {
                correlation_id,
                deadline,
            }),
            SnapshotFrame::PendingMessage {
                service_session_id,
                payload,
            } => snapshot.pending_messages.push((service_session_id, payload)),
            SnapshotFrame::End {
                log_position: end_position,
                ..
            } => {
                if end_position != log_position {
                    return Err(ClusterError::Configuration {
                        detail: format!(
                            "snapshot END at {end_position} does not match BEGIN at {log_position}"
                        ),
                    });
                }
                ended = true;
                break;
            }
            SnapshotFrame::Begin { .. } => {
                return Err(ClusterError::Configuration {
                    detail: "nested snapshot BEGIN".to_string(),
                })
            }
        }
    }

    if !ended {
        return Err(ClusterError::Configuration {
            detail: "snapshot ended unexpectedly".to_string(),
        });
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marlin_transport::SharedLogBuffer;

    fn take_basic_snapshot(buffer: &SharedLogBuffer) {
        let mut publication = LogPublication::new(1, 0);
        publication.add_destination("snapshot", buffer.clone());
        let mut taker = SnapshotTaker::new(&mut publication);

        let version = SemanticVersion::new(1, 0, 0);
        taker
            .mark_begin(4096, LeadershipTermId(2), TimeUnit::Milliseconds, version)
            .unwrap();
        taker
            .snapshot_consensus_module_state(
                SessionId(12),
                SessionId(i64::MIN + 5),
                SessionId(i64::MIN + 3),
                1,
            )
            .unwrap();
        taker
            .snapshot_cluster_members(0, 2, "0,c0,m0,t0,l0|1,c1,m1,t1,l1")
            .unwrap();
        taker
            .snapshot_timer(TimerEntry {
                correlation_id: CorrelationId(44),
                deadline: 9_000,
            })
            .unwrap();
        taker
            .snapshot_pending_message(SessionId(i64::MIN + 4), Bytes::from_static(b"svc"))
            .unwrap();
        taker
            .mark_end(4096, LeadershipTermId(2), TimeUnit::Milliseconds, version)
            .unwrap();
    }

    fn frames(buffer: &SharedLogBuffer) -> Vec<LogFrame> {
        buffer.frames_between(0, buffer.end_position())
    }

    #[test]
    fn snapshot_round_trips() {
        let buffer = SharedLogBuffer::new(0, 1 << 20);
        take_basic_snapshot(&buffer);

        let snapshot = load_snapshot(
            &frames(&buffer),
            SemanticVersion::new(1, 2, 3),
            TimeUnit::Milliseconds,
        )
        .unwrap();

        assert_eq!(snapshot.log_position, 4096);
        assert_eq!(snapshot.leadership_term_id, LeadershipTermId(2));
        assert_eq!(snapshot.next_session_id, SessionId(12));
        assert_eq!(snapshot.log_service_session_id, SessionId(i64::MIN + 3));
        assert_eq!(snapshot.timers.len(), 1);
        assert_eq!(snapshot.pending_messages.len(), 1);
        assert_eq!(snapshot.high_member_id, 2);
    }

    #[test]
    fn version_major_mismatch_is_fatal() {
        let buffer = SharedLogBuffer::new(0, 1 << 20);
        take_basic_snapshot(&buffer);

        let result = load_snapshot(
            &frames(&buffer),
            SemanticVersion::new(2, 0, 0),
            TimeUnit::Milliseconds,
        );
        assert!(matches!(
            result,
            Err(ClusterError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn time_unit_mismatch_is_fatal() {
        let buffer = SharedLogBuffer::new(0, 1 << 20);
        take_basic_snapshot(&buffer);

        let result = load_snapshot(
            &frames(&buffer),
            SemanticVersion::new(1, 0, 0),
            TimeUnit::Nanoseconds,
        );
        assert!(matches!(
            result,
            Err(ClusterError::IncompatibleTimeUnit { .. })
        ));
    }

    #[test]
    fn truncated_snapshot_is_rejected() {
        let buffer = SharedLogBuffer::new(0, 1 << 20);
        take_basic_snapshot(&buffer);

        let mut frames = frames(&buffer);
        frames.pop();
        let result = load_snapshot(
            &frames,
            SemanticVersion::new(1, 0, 0),
            TimeUnit::Milliseconds,
        );
        assert!(result.is_err());
    }
}
