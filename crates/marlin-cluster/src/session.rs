//! Cluster sessions and the authenticator seam.
//!
//! A session reaches `Open` only after its SessionOpen entry is appended at
//! a known log position; once `Closed` no further entries reference its id
//! except the committing close.

use crate::messages::{CloseReason, EventCode};
use crate::types::{CorrelationId, SessionId};
use bytes::Bytes;
use marlin_transport::{Media, Publication};

/// Per-session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connected,
    Challenged,
    Authenticated,
    Open,
    Rejected,
    Closed,
}

/// A client (or backup) session tracked by the consensus module.
#[derive(Debug)]
pub struct ClusterSession {
    id: SessionId,
    correlation_id: CorrelationId,
    response_stream_id: i32,
    response_channel: String,
    response_publication: Option<Publication>,
    state: SessionState,
    opened_log_position: Option<u64>,
    closed_log_position: Option<u64>,
    time_of_last_activity_ns: u64,
    close_reason: Option<CloseReason>,
    has_new_leader_event_pending: bool,
    is_backup_session: bool,
    event_code: EventCode,
    response_detail: String,
    pending_challenge: Option<Bytes>,
}

impl ClusterSession {
    pub fn new(id: SessionId, response_stream_id: i32, response_channel: String) -> Self {
        Self {
            id,
            correlation_id: CorrelationId::NONE,
            response_stream_id,
            response_channel,
            response_publication: None,
            state: SessionState::Init,
            opened_log_position: None,
            closed_log_position: None,
            time_of_last_activity_ns: 0,
            close_reason: None,
            has_new_leader_event_pending: false,
            is_backup_session: false,
            event_code: EventCode::Ok,
            response_detail: String::new(),
            pending_challenge: None,
        }
    }

    /// Rebuild a session from a snapshot frame. A recorded close reason
    /// restores the session as `Closed`, otherwise as `Open`.
    #[allow(clippy::too_many_arguments)]
    pub fn loaded(
        id: SessionId,
        correlation_id: CorrelationId,
        opened_log_position: u64,
        time_of_last_activity_ns: u64,
        close_reason: Option<CloseReason>,
        response_stream_id: i32,
        response_channel: String,
    ) -> Self {
        let mut session = Self::new(id, response_stream_id, response_channel);
        session.correlation_id = correlation_id;
        session.opened_log_position = Some(opened_log_position);
        session.time_of_last_activity_ns = time_of_last_activity_ns;
        session.close_reason = close_reason;
        session.state = if close_reason.is_some() {
            SessionState::Closed
        } else {
            SessionState::Open
        };

        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn response_stream_id(&self) -> i32 {
        self.response_stream_id
    }

    pub fn response_channel(&self) -> &str {
        &self.response_channel
    }

    pub fn opened_log_position(&self) -> Option<u64> {
        self.opened_log_position
    }

    pub fn closed_log_position(&self) -> Option<u64> {
        self.closed_log_position
    }

    pub fn set_closed_log_position(&mut self, position: u64) {
        self.closed_log_position = Some(position);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn time_of_last_activity_ns(&self) -> u64 {
        self.time_of_last_activity_ns
    }

    pub fn set_time_of_last_activity_ns(&mut self, now_ns: u64) {
        self.time_of_last_activity_ns = now_ns;
    }

    pub fn last_activity(&mut self, now_ns: u64, correlation_id: CorrelationId) {
        self.time_of_last_activity_ns = now_ns;
        self.correlation_id = correlation_id;
    }

    pub fn has_new_leader_event_pending(&self) -> bool {
        self.has_new_leader_event_pending
    }

    pub fn set_new_leader_event_pending(&mut self, pending: bool) {
        self.has_new_leader_event_pending = pending;
    }

    /// Challenge bytes queued by the authenticator, delivered once by the
    /// agent on the response channel.
    pub fn take_pending_challenge(&mut self) -> Option<Bytes> {
        self.pending_challenge.take()
    }

    pub fn mark_as_backup_session(&mut self) {
        self.is_backup_session = true;
    }

    pub fn is_backup_session(&self) -> bool {
        self.is_backup_session
    }

    pub fn event_code(&self) -> EventCode {
        self.event_code
    }

    pub fn response_detail(&self) -> &str {
        &self.response_detail
    }

    /// Open the response publication toward the client.
    pub fn connect(&mut self, media: &Media) {
        if self.response_publication.is_none() {
            self.response_publication =
                Some(media.add_publication(&self.response_channel, self.response_stream_id));
        }
    }

    pub fn disconnect(&mut self) {
        self.response_publication = None;
    }

    pub fn response_publication(&self) -> Option<&Publication> {
        self.response_publication.as_ref()
    }

    pub fn is_response_publication_connected(&self) -> bool {
        self.response_publication
            .as_ref()
            .map(Publication::is_connected)
            .unwrap_or(false)
    }

    fn transition(&mut self, new_state: SessionState) {
        if self.state != new_state {
            tracing::trace!(session_id = %self.id, from = ?self.state, to = ?new_state, "session state");
            self.state = new_state;
        }
    }

    pub fn connected(&mut self) {
        if self.state == SessionState::Init {
            self.transition(SessionState::Connected);
        }
    }

    pub fn challenged(&mut self) {
        if matches!(self.state, SessionState::Init | SessionState::Connected) {
            self.transition(SessionState::Challenged);
        }
    }

    pub fn authenticated(&mut self) {
        if self.state != SessionState::Rejected {
            self.transition(SessionState::Authenticated);
        }
    }

    /// The SessionOpen entry landed at `log_position`.
    pub fn open(&mut self, log_position: u64) {
        self.opened_log_position = Some(log_position);
        self.transition(SessionState::Open);
    }

    pub fn reject(&mut self, code: EventCode, detail: impl Into<String>) {
        self.event_code = code;
        self.response_detail = detail.into();
        self.transition(SessionState::Rejected);
    }

    /// Mark the session closed. The response publication stays connected
    /// so the closing event can still reach the client; callers disconnect
    /// once the session leaves the live collections.
    pub fn close(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
        self.transition(SessionState::Closed);
    }
}

/// Handle an authenticator drives a session's handshake through.
pub struct SessionProxy<'a> {
    session: &'a mut ClusterSession,
}

impl<'a> SessionProxy<'a> {
    pub fn new(session: &'a mut ClusterSession) -> Self {
        Self { session }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn authenticate(&mut self) {
        self.session.authenticated();
    }

    /// Issue a challenge the client must answer. The challenge bytes are
    /// delivered on the session's response channel by the agent.
    pub fn challenge(&mut self, encoded_challenge: Bytes) {
        self.session.event_code = EventCode::Ok;
        self.session.response_detail = String::new();
        self.session.challenged();
        self.session.pending_challenge = Some(encoded_challenge);
    }

    pub fn reject(&mut self, detail: impl Into<String>) {
        self.session
            .reject(EventCode::AuthenticationRejected, detail);
    }
}

/// Pluggable session authentication.
///
/// All calls are non-blocking; a slow authenticator keeps the session in
/// the pending queue across ticks.
pub trait Authenticator {
    /// Credentials arrived with a connect request.
    fn on_connect_request(&mut self, session_id: SessionId, credentials: &Bytes, now_ms: u64);

    /// Credentials arrived answering a challenge.
    fn on_challenge_response(&mut self, session_id: SessionId, credentials: &Bytes, now_ms: u64);

    /// The session's response channel is reachable; authenticate, challenge
    /// or reject via the proxy.
    fn on_connected_session(&mut self, proxy: &mut SessionProxy<'_>, now_ms: u64);

    /// A previously challenged session is awaiting a verdict.
    fn on_challenged_session(&mut self, proxy: &mut SessionProxy<'_>, now_ms: u64);
}

/// Accepts every session without challenge.
#[derive(Default)]
pub struct AllowAllAuthenticator;

impl Authenticator for AllowAllAuthenticator {
    fn on_connect_request(&mut self, _session_id: SessionId, _credentials: &Bytes, _now_ms: u64) {}

    fn on_challenge_response(&mut self, _session_id: SessionId, _credentials: &Bytes, _now_ms: u64) {
    }

    fn on_connected_session(&mut self, proxy: &mut SessionProxy<'_>, _now_ms: u64) {
        proxy.authenticate();
    }

    fn on_challenged_session(&mut self, proxy: &mut SessionProxy<'_>, _now_ms: u64) {
        proxy.authenticate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EGRESS_STREAM_ID;

    fn session() -> ClusterSession {
        ClusterSession::new(SessionId(1), EGRESS_STREAM_ID, "client-1".to_string())
    }

    #[test]
    fn handshake_walks_the_state_machine() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Init);

        session.connected();
        assert_eq!(session.state(), SessionState::Connected);

        session.challenged();
        assert_eq!(session.state(), SessionState::Challenged);

        session.authenticated();
        assert_eq!(session.state(), SessionState::Authenticated);

        session.open(4096);
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.opened_log_position(), Some(4096));
    }

    #[test]
    fn rejected_session_cannot_authenticate() {
        let mut session = session();
        session.reject(EventCode::Error, "bad version");
        session.authenticated();
        assert_eq!(session.state(), SessionState::Rejected);
        assert_eq!(session.response_detail(), "bad version");
    }

    #[test]
    fn close_records_first_reason() {
        let mut session = session();
        session.open(64);
        session.close(CloseReason::Timeout);
        session.close(CloseReason::ClientAction);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Timeout));
    }

    #[test]
    fn loaded_session_state_follows_close_reason() {
        let open = ClusterSession::loaded(
            SessionId(5),
            CorrelationId(9),
            128,
            1_000,
            None,
            EGRESS_STREAM_ID,
            "client-5".to_string(),
        );
        assert_eq!(open.state(), SessionState::Open);

        let closed = ClusterSession::loaded(
            SessionId(6),
            CorrelationId(10),
            256,
            2_000,
            Some(CloseReason::Timeout),
            EGRESS_STREAM_ID,
            "client-6".to_string(),
        );
        assert_eq!(closed.state(), SessionState::Closed);
    }

    #[test]
    fn allow_all_authenticates_on_connect() {
        let mut session = session();
        session.connected();

        let mut authenticator = AllowAllAuthenticator;
        let mut proxy = SessionProxy::new(&mut session);
        authenticator.on_connected_session(&mut proxy, 0);
        assert_eq!(session.state(), SessionState::Authenticated);
    }
}
