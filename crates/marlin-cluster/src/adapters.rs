//! Channel adapters and publishers around the agent.
//!
//! Each adapter decodes one channel's frames into its message set; each
//! publisher encodes one message set onto its channel. The agent stays a
//! pure sink/source of typed messages.

use crate::messages::{
    decode, encode, ConsensusMessage, EgressMessage, EventCode, IngressMessage, ServiceControlMessage,
    ServiceMessage,
};
use crate::session::ClusterSession;
use crate::types::{CorrelationId, LeadershipTermId, MemberId, SessionId};
use bytes::Bytes;
use marlin_observe::Counter;
use marlin_transport::{Publication, Subscription};

/// Client ingress: decoded one frame at a time so the agent can abort and
/// retry a frame that could not be appended this tick.
pub struct IngressAdapter {
    subscription: Option<Subscription>,
    invalid_requests: Counter,
}

impl IngressAdapter {
    pub fn new(invalid_requests: Counter) -> Self {
        Self {
            subscription: None,
            invalid_requests,
        }
    }

    pub fn connect(&mut self, subscription: Subscription) {
        self.subscription = Some(subscription);
    }

    pub fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.subscription.is_some()
    }

    /// Next decodable ingress message, counting garbage frames as invalid
    /// requests.
    pub fn next(&mut self) -> Option<IngressMessage> {
        let subscription = self.subscription.as_ref()?;
        loop {
            let frame = subscription.next_frame()?;
            match decode::<IngressMessage>(&frame) {
                Ok(message) => return Some(message),
                Err(error) => {
                    self.invalid_requests.increment();
                    tracing::warn!(%error, "dropping undecodable ingress frame");
                }
            }
        }
    }

    /// Push a message back for the next tick after an aborted append.
    pub fn return_to_head(&self, message: &IngressMessage) {
        if let Some(subscription) = self.subscription.as_ref() {
            subscription.return_to_head(encode(message));
        }
    }
}

/// Egress to clients over their per-session response channels.
#[derive(Default)]
pub struct EgressPublisher;

impl EgressPublisher {
    pub fn send_event(
        &self,
        session: &ClusterSession,
        leadership_term_id: LeadershipTermId,
        leader_member_id: MemberId,
        code: EventCode,
        detail: &str,
    ) -> bool {
        let Some(publication) = session.response_publication() else {
            return false;
        };

        publication.try_offer(encode(&EgressMessage::SessionEvent {
            correlation_id: session.correlation_id(),
            session_id: session.id(),
            leadership_term_id,
            leader_member_id,
            code,
            detail: detail.to_string(),
        }))
    }

    pub fn send_challenge(&self, session: &ClusterSession, encoded_challenge: Bytes) -> bool {
        let Some(publication) = session.response_publication() else {
            return false;
        };

        publication.try_offer(encode(&EgressMessage::Challenge {
            correlation_id: session.correlation_id(),
            session_id: session.id(),
            encoded_challenge,
        }))
    }

    pub fn new_leader(
        &self,
        session: &ClusterSession,
        leadership_term_id: LeadershipTermId,
        leader_member_id: MemberId,
        ingress_endpoints: &str,
    ) -> bool {
        let Some(publication) = session.response_publication() else {
            return false;
        };

        publication.try_offer(encode(&EgressMessage::NewLeader {
            session_id: session.id(),
            leadership_term_id,
            leader_member_id,
            ingress_endpoints: ingress_endpoints.to_string(),
        }))
    }
}

/// Member-status publisher: one method per message, mirroring the set in
/// [`ConsensusMessage`]. All return false on back pressure.
#[derive(Default)]
pub struct ConsensusPublisher;

impl ConsensusPublisher {
    pub fn send(&self, publication: &Publication, message: &ConsensusMessage) -> bool {
        publication.try_offer(encode(message))
    }

    pub fn canvass_position(
        &self,
        publication: &Publication,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::CanvassPosition {
                log_leadership_term_id,
                log_position,
                follower_member_id,
            },
        )
    }

    pub fn request_vote(
        &self,
        publication: &Publication,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        candidate_term_id: LeadershipTermId,
        candidate_member_id: MemberId,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::RequestVote {
                log_leadership_term_id,
                log_position,
                candidate_term_id,
                candidate_member_id,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn vote(
        &self,
        publication: &Publication,
        candidate_term_id: LeadershipTermId,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        candidate_member_id: MemberId,
        follower_member_id: MemberId,
        vote: bool,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::Vote {
                candidate_term_id,
                log_leadership_term_id,
                log_position,
                candidate_member_id,
                follower_member_id,
                vote,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_leadership_term(
        &self,
        publication: &Publication,
        log_leadership_term_id: LeadershipTermId,
        leadership_term_id: LeadershipTermId,
        term_base_log_position: u64,
        append_position: u64,
        timestamp: u64,
        leader_member_id: MemberId,
        log_session_id: i32,
        is_startup: bool,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::NewLeadershipTerm {
                log_leadership_term_id,
                leadership_term_id,
                term_base_log_position,
                append_position,
                timestamp,
                leader_member_id,
                log_session_id,
                is_startup,
            },
        )
    }

    pub fn append_position(
        &self,
        publication: &Publication,
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::AppendPosition {
                leadership_term_id,
                log_position,
                follower_member_id,
            },
        )
    }

    pub fn commit_position(
        &self,
        publication: &Publication,
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        leader_member_id: MemberId,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::CommitPosition {
                leadership_term_id,
                log_position,
                leader_member_id,
            },
        )
    }

    pub fn catchup_position(
        &self,
        publication: &Publication,
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::CatchupPosition {
                leadership_term_id,
                log_position,
                follower_member_id,
            },
        )
    }

    pub fn stop_catchup(
        &self,
        publication: &Publication,
        leadership_term_id: LeadershipTermId,
        follower_member_id: MemberId,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::StopCatchup {
                leadership_term_id,
                follower_member_id,
            },
        )
    }

    pub fn termination_position(&self, publication: &Publication, log_position: u64) -> bool {
        self.send(
            publication,
            &ConsensusMessage::TerminationPosition { log_position },
        )
    }

    pub fn termination_ack(
        &self,
        publication: &Publication,
        log_position: u64,
        member_id: MemberId,
    ) -> bool {
        self.send(
            publication,
            &ConsensusMessage::TerminationAck {
                log_position,
                member_id,
            },
        )
    }
}

/// Member-status consumption.
pub struct ConsensusAdapter {
    subscription: Subscription,
}

impl ConsensusAdapter {
    pub fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    pub fn poll(&mut self, limit: usize) -> Vec<ConsensusMessage> {
        let mut messages = Vec::new();
        self.subscription.poll(limit, |frame| {
            match decode::<ConsensusMessage>(&frame) {
                Ok(message) => messages.push(message),
                Err(error) => {
                    tracing::warn!(%error, "dropping undecodable consensus frame")
                }
            }
        });

        messages
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }
}

/// Module-to-service control publisher.
pub struct ServiceProxy {
    publication: Publication,
}

impl ServiceProxy {
    pub fn new(publication: Publication) -> Self {
        Self { publication }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn join_log(
        &self,
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        max_log_position: u64,
        member_id: MemberId,
        log_session_id: i32,
        log_channel: &str,
        is_startup: bool,
    ) -> bool {
        self.publication
            .try_offer(encode(&ServiceControlMessage::JoinLog {
                leadership_term_id,
                log_position,
                max_log_position,
                member_id,
                log_session_id,
                log_channel: log_channel.to_string(),
                is_startup,
            }))
    }

    pub fn termination_position(&self, log_position: u64) -> bool {
        self.publication
            .try_offer(encode(&ServiceControlMessage::TerminationPosition {
                log_position,
            }))
    }

    pub fn cluster_members_response(
        &self,
        correlation_id: CorrelationId,
        leader_member_id: MemberId,
        active_members: &str,
        passive_members: &str,
    ) -> bool {
        self.publication
            .try_offer(encode(&ServiceControlMessage::ClusterMembersResponse {
                correlation_id,
                leader_member_id,
                active_members: active_members.to_string(),
                passive_members: passive_members.to_string(),
            }))
    }
}

/// Service-to-module consumption.
pub struct ServiceAdapter {
    subscription: Subscription,
}

impl ServiceAdapter {
    pub fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    pub fn poll(&mut self, limit: usize) -> Vec<ServiceMessage> {
        let mut messages = Vec::new();
        self.subscription.poll(limit, |frame| {
            match decode::<ServiceMessage>(&frame) {
                Ok(message) => messages.push(message),
                Err(error) => tracing::warn!(%error, "dropping undecodable service frame"),
            }
        });

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marlin_transport::Media;

    #[test]
    fn ingress_adapter_counts_invalid_frames() {
        let media = Media::new();
        let publication = media.add_publication("ingress", 1);
        let subscription = media.add_subscription("ingress", 1);

        let invalid = Counter::new();
        let mut adapter = IngressAdapter::new(invalid.clone());
        adapter.connect(subscription);

        publication.try_offer(Bytes::from_static(&[0xde, 0xad]));
        publication.try_offer(encode(&IngressMessage::SessionKeepAlive {
            leadership_term_id: LeadershipTermId(0),
            session_id: SessionId(1),
        }));

        let message = adapter.next().unwrap();
        assert!(matches!(message, IngressMessage::SessionKeepAlive { .. }));
        assert_eq!(invalid.get(), 1);
        assert!(adapter.next().is_none());
    }

    #[test]
    fn ingress_return_to_head_redelivers() {
        let media = Media::new();
        let publication = media.add_publication("ingress", 1);
        let subscription = media.add_subscription("ingress", 1);

        let mut adapter = IngressAdapter::new(Counter::new());
        adapter.connect(subscription);

        publication.try_offer(encode(&IngressMessage::SessionKeepAlive {
            leadership_term_id: LeadershipTermId(3),
            session_id: SessionId(9),
        }));

        let message = adapter.next().unwrap();
        adapter.return_to_head(&message);

        match adapter.next().unwrap() {
            IngressMessage::SessionKeepAlive { session_id, .. } => {
                assert_eq!(session_id, SessionId(9))
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn consensus_round_trip() {
        let media = Media::new();
        let publication = media.add_publication("m1:member", 1);
        let mut adapter = ConsensusAdapter::new(media.add_subscription("m1:member", 1));

        let publisher = ConsensusPublisher;
        assert!(publisher.commit_position(&publication, LeadershipTermId(4), 2048, MemberId(0)));

        let messages = adapter.poll(8);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            ConsensusMessage::CommitPosition {
                leadership_term_id: LeadershipTermId(4),
                log_position: 2048,
                leader_member_id: MemberId(0),
            }
        ));
    }
}
