//! Leader-side typed appends onto the replicated log stream.
//!
//! Every append returns the resulting stream position, or 0 when the
//! publication is flow controlled, which is the caller's signal to retry
//! on a later tick without mutating any other state.

use crate::messages::{encode, ChangeType, ClusterAction, CloseReason, LogEntry};
use crate::session::ClusterSession;
use crate::types::{CorrelationId, LeadershipTermId, MemberId, SemanticVersion, SessionId, TimeUnit};
use bytes::Bytes;
use marlin_transport::{LogPublication, SharedLogBuffer};

#[derive(Default)]
pub struct LogPublisher {
    publication: Option<LogPublication>,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, publication: LogPublication) {
        self.publication = Some(publication);
    }

    pub fn disconnect(&mut self) {
        if let Some(mut publication) = self.publication.take() {
            publication.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.publication
            .as_ref()
            .map(LogPublication::is_connected)
            .unwrap_or(false)
    }

    pub fn position(&self) -> u64 {
        self.publication
            .as_ref()
            .map(LogPublication::position)
            .unwrap_or(0)
    }

    pub fn session_id(&self) -> i32 {
        self.publication
            .as_ref()
            .map(LogPublication::session_id)
            .unwrap_or(0)
    }

    pub fn add_passive_follower(&mut self, log_endpoint: &str, buffer: SharedLogBuffer) {
        if let Some(publication) = self.publication.as_mut() {
            publication.add_destination(log_endpoint, buffer);
        }
    }

    pub fn remove_passive_follower(&mut self, log_endpoint: &str) {
        if let Some(publication) = self.publication.as_mut() {
            publication.remove_destination(log_endpoint);
        }
    }

    fn append(&mut self, entry: &LogEntry) -> u64 {
        match self.publication.as_mut() {
            Some(publication) => publication.try_append(&encode(entry)),
            None => 0,
        }
    }

    pub fn append_session_open(
        &mut self,
        session: &ClusterSession,
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
    ) -> u64 {
        self.append(&LogEntry::SessionOpen {
            leadership_term_id,
            correlation_id: session.correlation_id(),
            session_id: session.id(),
            timestamp,
            response_stream_id: session.response_stream_id(),
            response_channel: session.response_channel().to_string(),
        })
    }

    pub fn append_session_close(
        &mut self,
        session: &ClusterSession,
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
    ) -> u64 {
        let close_reason = session.close_reason().unwrap_or(CloseReason::ClientAction);
        self.append(&LogEntry::SessionClose {
            leadership_term_id,
            session_id: session.id(),
            timestamp,
            close_reason,
        })
    }

    pub fn append_message(
        &mut self,
        leadership_term_id: LeadershipTermId,
        session_id: SessionId,
        timestamp: u64,
        payload: Bytes,
    ) -> u64 {
        self.append(&LogEntry::SessionMessage {
            leadership_term_id,
            session_id,
            timestamp,
            payload,
        })
    }

    pub fn append_timer(
        &mut self,
        correlation_id: CorrelationId,
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
    ) -> u64 {
        self.append(&LogEntry::Timer {
            leadership_term_id,
            correlation_id,
            timestamp,
        })
    }

    pub fn append_cluster_action(
        &mut self,
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
        action: ClusterAction,
    ) -> u64 {
        self.append(&LogEntry::ClusterAction {
            leadership_term_id,
            timestamp,
            action,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_new_leadership_term_event(
        &mut self,
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
        term_base_log_position: u64,
        leader_member_id: MemberId,
        log_session_id: i32,
        time_unit: TimeUnit,
        app_version: SemanticVersion,
    ) -> u64 {
        self.append(&LogEntry::NewLeadershipTerm {
            leadership_term_id,
            timestamp,
            term_base_log_position,
            leader_member_id,
            log_session_id,
            time_unit,
            app_version,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_membership_change_event(
        &mut self,
        leadership_term_id: LeadershipTermId,
        timestamp: u64,
        leader_member_id: MemberId,
        cluster_size: u32,
        change_type: ChangeType,
        member_id: MemberId,
        members: String,
    ) -> u64 {
        self.append(&LogEntry::MembershipChange {
            leadership_term_id,
            timestamp,
            leader_member_id,
            cluster_size,
            change_type,
            member_id,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::decode;
    use marlin_transport::aligned_frame_length;

    fn publisher_with_buffer() -> (LogPublisher, SharedLogBuffer) {
        let buffer = SharedLogBuffer::new(0, 1 << 20);
        let mut publication = LogPublication::new(42, 0);
        publication.add_destination("log", buffer.clone());

        let mut publisher = LogPublisher::new();
        publisher.connect(publication);
        (publisher, buffer)
    }

    #[test]
    fn disconnected_publisher_returns_zero() {
        let mut publisher = LogPublisher::new();
        assert_eq!(
            publisher.append_timer(CorrelationId(1), LeadershipTermId(0), 10),
            0
        );
    }

    #[test]
    fn appends_advance_position_and_frame_the_entry() {
        let (mut publisher, buffer) = publisher_with_buffer();

        let position = publisher.append_timer(CorrelationId(5), LeadershipTermId(2), 77);
        assert!(position > 0);
        assert_eq!(publisher.position(), position);

        let frame = buffer.frame_after(0).unwrap();
        assert_eq!(frame.end_position, position);
        assert_eq!(
            position,
            aligned_frame_length(frame.payload.len())
        );

        let entry: LogEntry = decode(&frame.payload).unwrap();
        assert_eq!(
            entry,
            LogEntry::Timer {
                leadership_term_id: LeadershipTermId(2),
                correlation_id: CorrelationId(5),
                timestamp: 77,
            }
        );
    }

    #[test]
    fn flow_control_leaves_position_unchanged() {
        let buffer = SharedLogBuffer::new(0, 64);
        let mut publication = LogPublication::new(1, 0);
        publication.add_destination("log", buffer.clone());
        let mut publisher = LogPublisher::new();
        publisher.connect(publication);

        // Window fits one frame; the second append is refused until the
        // consumer drains.
        let first = publisher.append_timer(CorrelationId(1), LeadershipTermId(0), 1);
        assert!(first > 0);
        let second = publisher.append_timer(CorrelationId(2), LeadershipTermId(0), 2);
        assert_eq!(second, 0);
        assert_eq!(publisher.position(), first);

        buffer.set_consumer_position(first);
        assert!(publisher.append_timer(CorrelationId(2), LeadershipTermId(0), 2) > 0);
    }
}
