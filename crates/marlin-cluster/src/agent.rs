//! The consensus module agent: run loop, module-state and role machines.
//!
//! Single-threaded and cooperatively polled. Each `do_work` tick runs a
//! bounded-frequency slow tick (timeouts, counters, control toggle) and a
//! fast tick (I/O polling and consensus work), dispatched in priority
//! order: dynamic join, then election, then normal consensus work.
//!
//! The agent owns every piece of mutable consensus state on its node; the
//! only cross-thread data are the single-writer counters in
//! [`ClusterCounters`].

use crate::adapters::{
    ConsensusAdapter, ConsensusPublisher, EgressPublisher, IngressAdapter, ServiceAdapter,
    ServiceProxy,
};
use crate::clock::ClusterClock;
use crate::config::{ClusterConfig, CONSENSUS_MODULE_STREAM_ID, CONSENSUS_STREAM_ID, INGRESS_STREAM_ID, LOG_STREAM_ID, SERVICE_STREAM_ID, SNAPSHOT_STREAM_ID};
use crate::dynamic_join::DynamicJoin;
use crate::election::Election;
use crate::error::{Category, ClusterError, CountedErrorHandler, Result};
use crate::log_adapter::{LogAdapter, PollAction};
use crate::log_publisher::LogPublisher;
use crate::mark_file::MarkFile;
use crate::member::{
    self, find_member, find_member_mut, ClusterMember,
};
use crate::messages::{
    ChangeType, CloseReason, ClusterAction, ConsensusMessage, EventCode, IngressMessage, LogEntry,
    ServiceMessage, SnapshotTransfer,
};
use crate::pending::PendingMessageQueue;
use crate::session::{Authenticator, ClusterSession, SessionProxy, SessionState};
use crate::snapshot::{load_snapshot, SnapshotTaker};
use crate::termination::ClusterTermination;
use crate::timer_wheel::TimerWheel;
use crate::types::{CorrelationId, LeadershipTermId, MemberId, SessionId};
use crate::uncommitted::UncommittedLedger;
use bytes::Bytes;
use marlin_archive::{Archive, RecordingId, RecordingLog, RecoveryPlan, SubscriptionId, CONSENSUS_MODULE_SERVICE_ID};
use marlin_observe::{Counter, PositionCounter, StateGauge};
use marlin_transport::{IdleStrategy, LogPublication, Media, SharedLogBuffer};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const SLOW_TICK_INTERVAL_NS: u64 = Duration::from_millis(10).as_nanos() as u64;
const SERVICE_MESSAGE_LIMIT: usize = 20;
const INGRESS_FRAGMENT_LIMIT: usize = 16;
const LOG_FRAGMENT_LIMIT: usize = 64;
const CONSENSUS_FRAGMENT_LIMIT: usize = 32;
const SESSION_INVALID_VERSION_MSG: &str = "invalid client version";
const SESSION_LIMIT_MSG: &str = "concurrent session limit";

/// Module state, in counter-code order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Init,
    Active,
    Suspended,
    Snapshot,
    Quitting,
    Terminating,
    Closed,
}

impl ModuleState {
    pub fn code(self) -> i64 {
        match self {
            ModuleState::Init => 0,
            ModuleState::Active => 1,
            ModuleState::Suspended => 2,
            ModuleState::Snapshot => 3,
            ModuleState::Quitting => 4,
            ModuleState::Terminating => 5,
            ModuleState::Closed => 6,
        }
    }
}

/// Cluster role as published on the role counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn code(self) -> i64 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
        }
    }
}

/// Operator control-toggle values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    Inactive,
    Neutral,
    Suspend,
    Resume,
    Snapshot,
    Shutdown,
    Abort,
}

impl ToggleState {
    pub fn code(self) -> i64 {
        match self {
            ToggleState::Inactive => 0,
            ToggleState::Neutral => 1,
            ToggleState::Suspend => 2,
            ToggleState::Resume => 3,
            ToggleState::Snapshot => 4,
            ToggleState::Shutdown => 5,
            ToggleState::Abort => 6,
        }
    }

    pub fn from_code(code: i64) -> ToggleState {
        match code {
            1 => ToggleState::Neutral,
            2 => ToggleState::Suspend,
            3 => ToggleState::Resume,
            4 => ToggleState::Snapshot,
            5 => ToggleState::Shutdown,
            6 => ToggleState::Abort,
            _ => ToggleState::Inactive,
        }
    }
}

/// Host-observable counters, all single-writer from the agent.
#[derive(Clone, Default)]
pub struct ClusterCounters {
    pub module_state: StateGauge,
    pub cluster_role: StateGauge,
    pub commit_position: PositionCounter,
    pub control_toggle: StateGauge,
    pub snapshots: Counter,
    pub timed_out_clients: Counter,
    pub invalid_requests: Counter,
    pub errors: Counter,
}

/// Everything the agent is constructed from.
pub struct AgentContext {
    pub config: ClusterConfig,
    pub media: Media,
    pub archive: Archive,
    pub clock: Arc<dyn ClusterClock>,
    pub counters: ClusterCounters,
    pub authenticator: Box<dyn Authenticator>,
    pub termination_hook: Box<dyn FnMut()>,
    /// Invoked during internal busy-waits, standing in for the messaging
    /// client conductor; test harnesses pump co-hosted services here.
    pub client_invoker: Option<Box<dyn FnMut()>>,
}

#[derive(Debug, Clone, Copy)]
struct ServiceAck {
    ack_id: i64,
    log_position: u64,
    relevant_id: i64,
}

struct ServiceAckQueues {
    queues: Vec<VecDeque<ServiceAck>>,
}

impl ServiceAckQueues {
    fn new(service_count: usize) -> Self {
        Self {
            queues: (0..service_count).map(|_| VecDeque::new()).collect(),
        }
    }

    fn offer(&mut self, service_id: i32, ack: ServiceAck) {
        if let Some(queue) = self.queues.get_mut(service_id as usize) {
            queue.push_back(ack);
        }
    }

    fn has_reached(&self, log_position: u64, ack_id: i64) -> bool {
        self.queues.iter().all(|queue| {
            queue
                .front()
                .map(|ack| ack.ack_id == ack_id && ack.log_position == log_position)
                .unwrap_or(false)
        })
    }

    fn remove_head(&mut self) -> Vec<ServiceAck> {
        self.queues
            .iter_mut()
            .filter_map(VecDeque::pop_front)
            .collect()
    }
}

pub struct ConsensusModuleAgent {
    config: ClusterConfig,
    media: Media,
    archive: Archive,
    recording_log: RecordingLog,
    clock: Arc<dyn ClusterClock>,
    counters: ClusterCounters,
    error_handler: CountedErrorHandler,
    authenticator: Box<dyn Authenticator>,
    termination_hook: Box<dyn FnMut()>,
    client_invoker: Option<Box<dyn FnMut()>>,
    idle: IdleStrategy,

    state: ModuleState,
    role: Role,
    leadership_term_id: LeadershipTermId,

    member_id: MemberId,
    high_member_id: i32,
    cluster_members: Vec<ClusterMember>,
    passive_members: Vec<ClusterMember>,
    leader_member_id: MemberId,
    client_facing_endpoints: String,
    this_member_endpoints: String,
    pending_member_removals: usize,

    next_session_id: SessionId,
    session_by_id: BTreeMap<SessionId, ClusterSession>,
    pending_sessions: Vec<ClusterSession>,
    rejected_sessions: Vec<ClusterSession>,
    redirect_sessions: Vec<ClusterSession>,

    next_service_session_id: SessionId,
    log_service_session_id: SessionId,
    pending_service_messages: PendingMessageQueue,

    timer_wheel: TimerWheel,
    uncommitted: UncommittedLedger,

    log_publisher: LogPublisher,
    log_adapter: LogAdapter,
    log_recording_id: Option<RecordingId>,
    log_subscription_id: Option<SubscriptionId>,
    catchup_in_progress: bool,

    notified_commit_position: u64,
    last_append_position: u64,
    expected_ack_position: u64,
    service_ack_id: i64,
    termination_position: Option<u64>,

    time_of_last_slow_tick_ns: u64,
    time_of_last_log_update_ns: u64,
    time_of_last_append_position_ns: u64,
    time_of_last_mark_file_update_ns: u64,

    ingress_adapter: IngressAdapter,
    egress_publisher: EgressPublisher,
    consensus_adapter: ConsensusAdapter,
    consensus_publisher: ConsensusPublisher,
    service_proxy: ServiceProxy,
    service_adapter: ServiceAdapter,
    service_acks: ServiceAckQueues,

    recovery_plan: RecoveryPlan,
    election: Option<Election>,
    dynamic_join: Option<DynamicJoin>,
    dynamic_join_snapshots: Vec<marlin_archive::Snapshot>,
    pending_join_term: Option<LeadershipTermId>,
    cluster_termination: Option<ClusterTermination>,
    mark_file: MarkFile,
    next_correlation_id: i64,
}

impl ConsensusModuleAgent {
    pub fn new(ctx: AgentContext) -> Result<Self> {
        let AgentContext {
            config,
            media,
            archive,
            clock,
            counters,
            authenticator,
            termination_hook,
            client_invoker,
        } = ctx;

        config.validate()?;
        std::fs::create_dir_all(&config.cluster_dir)
            .map_err(marlin_archive::ArchiveError::from)?;

        let mut cluster_members = member::parse_members(&config.members)?;
        let member_id = config.member_id;

        let this_member_endpoints = if let Some(this_member) =
            find_member(&cluster_members, member_id)
        {
            this_member.endpoints()
        } else if !config.members.is_empty() {
            return Err(ClusterError::Configuration {
                detail: format!("member {member_id} not in configured membership"),
            });
        } else {
            String::new()
        };

        let member_facing_endpoint = if this_member_endpoints.is_empty() {
            // Dynamic join: this node's own endpoints come through the
            // status-endpoints side; derive a unique member endpoint from
            // the service-control channel.
            format!("{}:member", config.service_control_channel)
        } else {
            find_member(&cluster_members, member_id)
                .map(|m| m.member_facing_endpoint.clone())
                .unwrap_or_default()
        };

        let consensus_adapter = ConsensusAdapter::new(
            media.add_subscription(&member_facing_endpoint, CONSENSUS_STREAM_ID),
        );
        member::add_consensus_publications(&mut cluster_members, member_id, &media);

        let service_proxy = ServiceProxy::new(
            media.add_publication(&config.service_control_channel, SERVICE_STREAM_ID),
        );
        let service_adapter = ServiceAdapter::new(
            media.add_subscription(&config.service_control_channel, CONSENSUS_MODULE_STREAM_ID),
        );

        let mark_file = MarkFile::create(&config.cluster_dir, member_id.0)?;
        let recording_log = RecordingLog::open(&config.cluster_dir)?;

        let high_member_id = member::high_member_id(&cluster_members);
        let wheel_resolution = config
            .time_unit
            .from_nanos(config.wheel_tick_resolution.as_nanos() as u64)
            .max(1);

        let counters_clone = counters.clone();
        let mut agent = Self {
            error_handler: CountedErrorHandler::new(counters.errors.clone()),
            ingress_adapter: IngressAdapter::new(counters.invalid_requests.clone()),
            egress_publisher: EgressPublisher,
            consensus_publisher: ConsensusPublisher,
            consensus_adapter,
            service_proxy,
            service_adapter,
            service_acks: ServiceAckQueues::new(config.service_count),
            timer_wheel: TimerWheel::new(wheel_resolution, config.ticks_per_wheel),
            pending_service_messages: PendingMessageQueue::new(config.pending_message_capacity),
            uncommitted: UncommittedLedger::new(),
            log_publisher: LogPublisher::new(),
            log_adapter: LogAdapter::new(),
            log_recording_id: None,
            log_subscription_id: None,
            catchup_in_progress: false,
            state: ModuleState::Init,
            role: Role::Follower,
            leadership_term_id: LeadershipTermId::NONE,
            member_id,
            high_member_id,
            cluster_members,
            passive_members: Vec::new(),
            leader_member_id: MemberId::NONE,
            client_facing_endpoints: String::new(),
            this_member_endpoints,
            pending_member_removals: 0,
            next_session_id: SessionId(1),
            session_by_id: BTreeMap::new(),
            pending_sessions: Vec::new(),
            rejected_sessions: Vec::new(),
            redirect_sessions: Vec::new(),
            next_service_session_id: SessionId::FIRST_SERVICE_SESSION,
            log_service_session_id: SessionId(i64::MIN),
            notified_commit_position: 0,
            last_append_position: 0,
            expected_ack_position: 0,
            service_ack_id: 0,
            termination_position: None,
            time_of_last_slow_tick_ns: 0,
            time_of_last_log_update_ns: 0,
            time_of_last_append_position_ns: 0,
            time_of_last_mark_file_update_ns: 0,
            recovery_plan: RecoveryPlan::default(),
            election: None,
            dynamic_join: None,
            dynamic_join_snapshots: Vec::new(),
            pending_join_term: None,
            cluster_termination: None,
            mark_file,
            next_correlation_id: 1,
            idle: IdleStrategy::new(),
            config,
            media,
            archive,
            recording_log,
            clock,
            counters: counters_clone,
            authenticator,
            termination_hook,
            client_invoker,
        };

        agent.counters.module_state.set(ModuleState::Init.code());
        agent.counters.cluster_role.set(Role::Follower.code());
        agent.client_facing_endpoints = member::client_facing_endpoints(&agent.cluster_members);
        agent.leader_member_id = agent.member_id;

        Ok(agent)
    }

    // --- accessors ------------------------------------------------------

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn media(&self) -> &Media {
        &self.media
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn leader_member_id(&self) -> MemberId {
        self.leader_member_id
    }

    pub fn module_state(&self) -> ModuleState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leadership_term_id(&self) -> LeadershipTermId {
        self.leadership_term_id
    }

    pub fn commit_position(&self) -> u64 {
        self.counters.commit_position.get()
    }

    pub fn members(&self) -> &[ClusterMember] {
        &self.cluster_members
    }

    pub fn passive_member_count(&self) -> usize {
        self.passive_members.len()
    }

    pub fn active_member_count(&self) -> usize {
        self.cluster_members.len()
    }

    pub fn is_election_active(&self) -> bool {
        self.election.is_some()
    }

    pub fn open_session_ids(&self) -> Vec<SessionId> {
        self.session_by_id
            .values()
            .filter(|s| s.state() == SessionState::Open)
            .map(|s| s.id())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.session_by_id.len()
    }

    pub fn pending_service_message_count(&self) -> usize {
        self.pending_service_messages.size()
    }

    pub fn uncommitted_timer_count(&self) -> usize {
        self.uncommitted.timer_count()
    }

    pub fn uncommitted_closed_session_count(&self) -> usize {
        self.uncommitted.closed_session_count()
    }

    pub fn uncommitted_service_message_count(&self) -> usize {
        self.uncommitted.service_message_count()
    }

    pub fn timer_count(&self) -> usize {
        self.timer_wheel.timer_count()
    }

    pub fn log_service_session_id(&self) -> SessionId {
        self.log_service_session_id
    }

    pub fn next_service_session_id(&self) -> SessionId {
        self.next_service_session_id
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.time_nanos()
    }

    pub(crate) fn consensus_publisher(&self) -> &ConsensusPublisher {
        &self.consensus_publisher
    }

    pub(crate) fn next_correlation_id(&mut self) -> i64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    pub(crate) fn this_member_endpoints_without_id(&self) -> String {
        let endpoints = if self.this_member_endpoints.is_empty() {
            let base = &self.config.service_control_channel;
            format!(
                "{base}:client,{base}:member,{base}:transfer,{base}:log"
            )
        } else {
            self.this_member_endpoints
                .splitn(2, ',')
                .nth(1)
                .unwrap_or_default()
                .to_string()
        };

        endpoints
    }

    pub(crate) fn adopt_member_id(&mut self, member_id: MemberId) {
        self.member_id = member_id;
        self.mark_file.set_member_id(member_id.0);
        if self.this_member_endpoints.is_empty() {
            self.this_member_endpoints =
                format!("{},{}", member_id.0, self.this_member_endpoints_without_id());
        }
    }

    pub(crate) fn add_retrieved_snapshot(&mut self, snapshot: marlin_archive::Snapshot) {
        self.dynamic_join_snapshots.push(snapshot);
    }

    // --- lifecycle ------------------------------------------------------

    pub fn on_start(&mut self) -> Result<()> {
        if self.cluster_members.is_empty() && !self.config.status_endpoints.is_empty() {
            self.dynamic_join = Some(DynamicJoin::new(self));
            return Ok(());
        }

        self.recovery_plan = self
            .recording_log
            .create_recovery_plan(&self.archive, self.config.service_count)?;

        if let Some(snapshot) = self.recovery_plan.snapshots.first().cloned() {
            self.recover_from_snapshot(&snapshot)?;
        }

        let expected = self.expected_ack_position;
        self.await_service_acks_at(expected)?;

        if self.recovery_plan.has_replay() {
            self.replay_local_log()?;
        }

        if self.state != ModuleState::Suspended {
            self.transition_state(ModuleState::Active);
        }

        self.election = Some(Election::new(
            true,
            LeadershipTermId(self.recovery_plan.last_leadership_term_id),
            self.recovery_plan.appended_log_position,
        ));

        Ok(())
    }

    pub fn do_work(&mut self) -> Result<usize> {
        if self.state == ModuleState::Closed {
            return Ok(0);
        }

        match self.do_work_inner() {
            Ok(work) => Ok(work),
            Err(error) => match error.category() {
                Category::Fatal => {
                    self.on_fatal(&error);
                    Err(error)
                }
                Category::Recoverable => {
                    self.error_handler.on_error(&error);
                    self.enter_election();
                    Ok(1)
                }
                Category::Warn => {
                    self.error_handler.on_error(&error);
                    Ok(1)
                }
            },
        }
    }

    fn do_work_inner(&mut self) -> Result<usize> {
        let now = self.clock.time();
        let now_ns = self.clock.time_nanos();
        let mut work = 0;

        if now_ns >= self.time_of_last_slow_tick_ns + SLOW_TICK_INTERVAL_NS {
            self.time_of_last_slow_tick_ns = now_ns;
            work += self.slow_tick_work(now_ns / 1_000_000, now_ns)?;
        }

        work += self.poll_consensus_adapter(now_ns)?;

        if self.dynamic_join.is_some() {
            let mut dynamic_join = self.dynamic_join.take().expect("present");
            let done = dynamic_join.do_work(self, now_ns)?;
            if done {
                self.dynamic_join_complete(&dynamic_join)?;
            } else {
                self.dynamic_join = Some(dynamic_join);
            }
            work += 1;
        } else if self.election.is_some() {
            let mut election = self.election.take().expect("present");
            let done = election.do_work(self, now_ns)?;
            if !done {
                self.election = Some(election);
            }
            work += 1;
        } else {
            work += self.consensus_work(now, now_ns)?;
        }

        Ok(work)
    }

    /// Close every owned resource; each close proceeds even if an earlier
    /// one failed.
    pub fn on_close(&mut self) {
        for session in self.session_by_id.values_mut() {
            session.disconnect();
        }
        self.ingress_adapter.close();
        self.log_publisher.disconnect();
        self.log_adapter.disconnect();
        for member in self
            .cluster_members
            .iter_mut()
            .chain(self.passive_members.iter_mut())
        {
            member.close_publication();
        }
    }

    fn on_fatal(&mut self, error: &ClusterError) {
        self.error_handler.on_error(error);
        self.transition_state(ModuleState::Closed);
        (self.termination_hook)();
    }

    // --- state machines -------------------------------------------------

    fn transition_state(&mut self, new_state: ModuleState) {
        if new_state != self.state {
            tracing::debug!(member_id = %self.member_id, from = ?self.state, to = ?new_state, "module state");
            self.state = new_state;
            self.counters.module_state.set(new_state.code());
        }
    }

    pub(crate) fn set_role(&mut self, new_role: Role) {
        if new_role != self.role {
            tracing::info!(member_id = %self.member_id, from = ?self.role, to = ?new_role, "cluster role");
            self.role = new_role;
            self.counters.cluster_role.set(new_role.code());
        }
    }

    fn set_leadership_term_id(&mut self, leadership_term_id: LeadershipTermId) {
        self.leadership_term_id = leadership_term_id;
    }

    // --- ticks ----------------------------------------------------------

    fn slow_tick_work(&mut self, now_ms: u64, now_ns: u64) -> Result<usize> {
        let mut work = 0;

        if let Some(invoker) = self.client_invoker.as_mut() {
            invoker();
        }

        if !self.archive.is_connected() {
            return Err(ClusterError::TransportClosed {
                detail: "local archive not connected".to_string(),
            });
        }

        if now_ns >= self.time_of_last_mark_file_update_ns + self.config.mark_file_update_interval_ns()
        {
            self.mark_file.update_activity_timestamp(now_ms)?;
            self.time_of_last_mark_file_update_ns = now_ns;
        }

        work += self.process_redirect_sessions(now_ns);
        work += self.process_rejected_sessions(now_ns);

        if self.election.is_some() || self.dynamic_join.is_some() {
            return Ok(work);
        }

        if self.role == Role::Leader {
            work += self.check_control_toggle(now_ns);

            if self.state == ModuleState::Active {
                work += self.process_pending_sessions(now_ms, now_ns);
                work += self.check_sessions(now_ns);
                work += self.process_passive_members();

                if !member::has_active_quorum(
                    &self.cluster_members,
                    now_ns,
                    self.config.leader_heartbeat_timeout_ns(),
                ) {
                    return Err(ClusterError::QuorumLost);
                }
            } else if self.state == ModuleState::Terminating {
                let can_terminate = self
                    .cluster_termination
                    .as_ref()
                    .map(|t| t.can_terminate(&self.cluster_members, now_ns))
                    .unwrap_or(false);
                if can_terminate {
                    let position = self.termination_position.unwrap_or(0);
                    self.terminate_cluster(position)?;
                }
            }
        } else if matches!(self.state, ModuleState::Active | ModuleState::Suspended) {
            if let Some(position) = self.termination_position {
                if self.log_adapter.position() >= position {
                    self.service_proxy.termination_position(position);
                    self.transition_state(ModuleState::Terminating);
                }
            }

            if self.catchup_in_progress
                && now_ns
                    >= self.time_of_last_append_position_ns + self.config.catchup_timeout_ns()
            {
                self.catchup_in_progress = false;
                self.error_handler
                    .on_error(&ClusterError::UnexpectedRoleMessage {
                        detail: "catch-up replay stalled".to_string(),
                    });
            }

            if now_ns >= self.time_of_last_log_update_ns + self.config.leader_heartbeat_timeout_ns()
            {
                return Err(ClusterError::LeaderHeartbeatTimeout);
            }
        }

        Ok(work)
    }

    fn consensus_work(&mut self, now: u64, now_ns: u64) -> Result<usize> {
        let mut work = 0;

        if self.role == Role::Leader && self.state == ModuleState::Active {
            work += self.poll_timers(now);
            work += self.append_pending_service_messages(now);
            work += self.poll_ingress(now, now_ns);
        } else if self.role == Role::Follower
            && matches!(self.state, ModuleState::Active | ModuleState::Suspended)
        {
            work += self.poll_ingress(now, now_ns);

            let limit = self.notified_commit_position.min(self.local_append_position());
            let consumed = self.poll_log(limit)?;
            if consumed == 0 && self.log_adapter.is_image_closed() {
                return Err(ClusterError::LogDisconnected {
                    detail: format!(
                        "log_position={} commit_position={} leadership_term_id={} leader={}",
                        self.log_adapter.position(),
                        self.counters.commit_position.get_weak(),
                        self.leadership_term_id,
                        self.leader_member_id,
                    ),
                });
            }
            work += consumed;
        }

        work += self.update_member_position(now_ns);
        work += self.poll_service_adapter()?;

        Ok(work)
    }

    // --- control toggle -------------------------------------------------

    fn check_control_toggle(&mut self, now_ns: u64) -> usize {
        let now = self.clock.time();
        match ToggleState::from_code(self.counters.control_toggle.get()) {
            ToggleState::Suspend => {
                if self.state == ModuleState::Active && self.append_action(ClusterAction::Suspend, now)
                {
                    self.transition_state(ModuleState::Suspended);
                }
            }
            ToggleState::Resume => {
                if self.state == ModuleState::Suspended
                    && self.append_action(ClusterAction::Resume, now)
                {
                    self.transition_state(ModuleState::Active);
                    self.counters.control_toggle.set(ToggleState::Neutral.code());
                }
            }
            ToggleState::Snapshot => {
                if self.state == ModuleState::Active
                    && self.append_action(ClusterAction::Snapshot, now)
                {
                    self.transition_state(ModuleState::Snapshot);
                }
            }
            ToggleState::Shutdown => {
                if self.state == ModuleState::Active
                    && self.append_action(ClusterAction::Snapshot, now)
                {
                    let position = self.log_publisher.position();
                    let mut termination =
                        ClusterTermination::new(now_ns + self.config.termination_timeout_ns());
                    termination.termination_position(
                        &self.consensus_publisher,
                        &self.cluster_members,
                        self.member_id,
                        position,
                    );
                    self.cluster_termination = Some(termination);
                    self.termination_position = Some(position);
                    self.transition_state(ModuleState::Snapshot);
                }
            }
            ToggleState::Abort => {
                if self.state == ModuleState::Active {
                    let position = self.log_publisher.position();
                    let mut termination =
                        ClusterTermination::new(now_ns + self.config.termination_timeout_ns());
                    termination.termination_position(
                        &self.consensus_publisher,
                        &self.cluster_members,
                        self.member_id,
                        position,
                    );
                    self.cluster_termination = Some(termination);
                    self.termination_position = Some(position);
                    self.service_proxy.termination_position(position);
                    self.transition_state(ModuleState::Terminating);
                }
            }
            ToggleState::Neutral | ToggleState::Inactive => return 0,
        }

        1
    }

    fn append_action(&mut self, action: ClusterAction, timestamp: u64) -> bool {
        self.log_publisher
            .append_cluster_action(self.leadership_term_id, timestamp, action)
            > 0
    }

    // --- ingress --------------------------------------------------------

    fn poll_ingress(&mut self, now: u64, now_ns: u64) -> usize {
        if !self.ingress_adapter.is_connected() {
            return 0;
        }

        let mut work = 0;
        for _ in 0..INGRESS_FRAGMENT_LIMIT {
            let Some(message) = self.ingress_adapter.next() else {
                break;
            };

            match self.on_ingress_message(message, now, now_ns) {
                PollOutcome::Continue => work += 1,
                PollOutcome::Abort(message) => {
                    self.ingress_adapter.return_to_head(&message);
                    break;
                }
            }
        }

        work
    }

    fn on_ingress_message(
        &mut self,
        message: IngressMessage,
        now: u64,
        now_ns: u64,
    ) -> PollOutcome {
        match message {
            IngressMessage::SessionConnect {
                correlation_id,
                response_stream_id,
                protocol_version,
                response_channel,
                credentials,
            } => {
                self.on_session_connect(
                    correlation_id,
                    response_stream_id,
                    protocol_version,
                    response_channel,
                    credentials,
                    now,
                    now_ns,
                );
                PollOutcome::Continue
            }
            IngressMessage::SessionClose {
                leadership_term_id,
                session_id,
            } => {
                self.on_session_close(leadership_term_id, session_id, now);
                PollOutcome::Continue
            }
            IngressMessage::SessionMessage {
                leadership_term_id,
                session_id,
                payload,
            } => {
                if leadership_term_id != self.leadership_term_id || self.role != Role::Leader {
                    return PollOutcome::Continue;
                }

                let Some(session) = self.session_by_id.get(&session_id) else {
                    return PollOutcome::Continue;
                };
                if session.state() == SessionState::Closed {
                    return PollOutcome::Continue;
                }

                if session.state() == SessionState::Open {
                    let position = self.log_publisher.append_message(
                        leadership_term_id,
                        session_id,
                        now,
                        payload.clone(),
                    );
                    if position > 0 {
                        if let Some(session) = self.session_by_id.get_mut(&session_id) {
                            session.set_time_of_last_activity_ns(now_ns);
                        }
                        return PollOutcome::Continue;
                    }

                    return PollOutcome::Abort(IngressMessage::SessionMessage {
                        leadership_term_id,
                        session_id,
                        payload,
                    });
                }

                PollOutcome::Continue
            }
            IngressMessage::SessionKeepAlive {
                leadership_term_id,
                session_id,
            } => {
                if self.role == Role::Leader && leadership_term_id == self.leadership_term_id {
                    if let Some(session) = self.session_by_id.get_mut(&session_id) {
                        if session.state() == SessionState::Open {
                            session.set_time_of_last_activity_ns(now_ns);
                        }
                    }
                }
                PollOutcome::Continue
            }
            IngressMessage::ChallengeResponse {
                correlation_id,
                session_id,
                credentials,
            } => {
                self.on_challenge_response(correlation_id, session_id, &credentials, now, now_ns);
                PollOutcome::Continue
            }
            IngressMessage::ClusterMembersQuery {
                correlation_id,
                session_id,
            } => {
                if self.role == Role::Leader {
                    let mut open = false;
                    if let Some(session) = self.session_by_id.get_mut(&session_id) {
                        if session.state() == SessionState::Open {
                            session.last_activity(now_ns, correlation_id);
                            open = true;
                        }
                    }
                    if open {
                        let members = member::encode_as_string(&self.cluster_members);
                        if let Some(session) = self.session_by_id.get(&session_id) {
                            self.egress_publisher.send_event(
                                session,
                                self.leadership_term_id,
                                self.leader_member_id,
                                EventCode::Ok,
                                &members,
                            );
                        }
                    }
                }
                PollOutcome::Continue
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_session_connect(
        &mut self,
        correlation_id: CorrelationId,
        response_stream_id: i32,
        protocol_version: crate::types::SemanticVersion,
        response_channel: String,
        credentials: Bytes,
        now: u64,
        now_ns: u64,
    ) {
        let session_id = if self.role == Role::Leader {
            let id = self.next_session_id;
            self.next_session_id = self.next_session_id.next();
            id
        } else {
            SessionId::NONE
        };

        let mut session = ClusterSession::new(session_id, response_stream_id, response_channel);
        session.last_activity(now_ns, correlation_id);
        session.connect(&self.media);

        if self.role != Role::Leader {
            self.redirect_sessions.push(session);
            return;
        }

        if !self.config.protocol_version.is_compatible_with(protocol_version) {
            let detail = format!(
                "{SESSION_INVALID_VERSION_MSG} {protocol_version}, cluster is {}",
                self.config.protocol_version
            );
            session.reject(EventCode::Error, detail);
            self.rejected_sessions.push(session);
        } else if self.pending_sessions.len() + self.session_by_id.len()
            >= self.config.max_concurrent_sessions
        {
            session.reject(EventCode::Error, SESSION_LIMIT_MSG);
            self.rejected_sessions.push(session);
        } else {
            self.authenticator.on_connect_request(
                session.id(),
                &credentials,
                self.config.time_unit.to_nanos(now) / 1_000_000,
            );
            self.pending_sessions.push(session);
        }
    }

    fn on_session_close(
        &mut self,
        leadership_term_id: LeadershipTermId,
        session_id: SessionId,
        now: u64,
    ) {
        if leadership_term_id != self.leadership_term_id || self.role != Role::Leader {
            return;
        }

        let Some(mut session) = self.session_by_id.remove(&session_id) else {
            return;
        };

        session.close(CloseReason::ClientAction);
        let position =
            self.log_publisher
                .append_session_close(&session, leadership_term_id, now);
        if position > 0 {
            session.set_closed_log_position(position);
            session.disconnect();
            self.uncommitted.add_closed_session(session);
        } else {
            // Retried by the session sweep; keep it in the map as closed.
            self.session_by_id.insert(session_id, session);
        }
    }

    fn on_challenge_response(
        &mut self,
        correlation_id: CorrelationId,
        session_id: SessionId,
        credentials: &Bytes,
        now: u64,
        now_ns: u64,
    ) {
        if self.role != Role::Leader {
            return;
        }

        let now_ms = self.config.time_unit.to_nanos(now) / 1_000_000;
        let Self {
            pending_sessions,
            authenticator,
            ..
        } = self;

        for session in pending_sessions.iter_mut() {
            if session.id() == session_id && session.state() == SessionState::Challenged {
                session.last_activity(now_ns, correlation_id);
                authenticator.on_challenge_response(session_id, credentials, now_ms);
                break;
            }
        }
    }

    // --- pending / rejected / redirect sessions -------------------------

    fn process_pending_sessions(&mut self, now_ms: u64, now_ns: u64) -> usize {
        let mut work = 0;
        let mut index = 0;

        while index < self.pending_sessions.len() {
            let mut reject = false;
            let mut open = false;
            let mut backup_ready = false;
            let mut timed_out = false;

            {
                let Self {
                    pending_sessions,
                    authenticator,
                    egress_publisher,
                    config,
                    ..
                } = self;
                let session = &mut pending_sessions[index];

                if matches!(session.state(), SessionState::Init | SessionState::Connected)
                    && session.is_response_publication_connected()
                {
                    session.connected();
                    let mut proxy = SessionProxy::new(session);
                    authenticator.on_connected_session(&mut proxy, now_ms);
                }

                if session.state() == SessionState::Challenged
                    && session.is_response_publication_connected()
                {
                    if let Some(challenge) = session.take_pending_challenge() {
                        egress_publisher.send_challenge(session, challenge);
                    }
                    let mut proxy = SessionProxy::new(session);
                    authenticator.on_challenged_session(&mut proxy, now_ms);
                }

                match session.state() {
                    SessionState::Authenticated => {
                        if session.is_backup_session() {
                            backup_ready = true;
                        } else {
                            open = true;
                        }
                        work += 1;
                    }
                    SessionState::Rejected => reject = true,
                    _ => {
                        if now_ns
                            > session.time_of_last_activity_ns() + config.session_timeout_ns()
                        {
                            timed_out = true;
                        }
                    }
                }
            }

            if backup_ready {
                if self.send_backup_response_for(index) {
                    let mut session = self.pending_sessions.swap_remove(index);
                    session.disconnect();
                } else {
                    index += 1;
                }
                continue;
            }
            if open {
                let mut session = self.pending_sessions.swap_remove(index);
                session.set_time_of_last_activity_ns(now_ns);
                let position = self.log_publisher.append_session_open(
                    &session,
                    self.leadership_term_id,
                    self.clock.time(),
                );
                if position > 0 {
                    session.open(position);
                    self.egress_publisher.send_event(
                        &session,
                        self.leadership_term_id,
                        self.member_id,
                        EventCode::Ok,
                        "",
                    );
                }
                self.session_by_id.insert(session.id(), session);
                continue;
            }
            if reject {
                let session = self.pending_sessions.swap_remove(index);
                self.rejected_sessions.push(session);
                work += 1;
                continue;
            }
            if timed_out {
                let mut session = self.pending_sessions.swap_remove(index);
                session.disconnect();
                self.counters.timed_out_clients.increment();
                work += 1;
                continue;
            }

            index += 1;
        }

        work
    }

    /// Answer a backup session with the recovery summary, then close it.
    fn send_backup_response_for(&mut self, index: usize) -> bool {
        let session = &self.pending_sessions[index];
        let Some(publication) = session.response_publication() else {
            return false;
        };

        let last_entry = self.recording_log.find_last_term();
        let response = ConsensusMessage::BackupResponse {
            correlation_id: session.correlation_id(),
            log_recording_id: self
                .recovery_plan
                .log
                .as_ref()
                .map(|l| l.recording_id)
                .unwrap_or(-1),
            last_leadership_term_id: LeadershipTermId(
                last_entry.map(|e| e.leadership_term_id).unwrap_or(-1),
            ),
            last_term_base_log_position: last_entry
                .map(|e| e.term_base_log_position)
                .unwrap_or(0),
            commit_position: self.counters.commit_position.get_weak(),
            leader_member_id: self.leader_member_id,
            cluster_members: member::encode_as_string(&self.cluster_members),
            snapshots: self.recovery_plan.snapshots.clone(),
        };

        self.consensus_publisher.send(publication, &response)
    }

    fn process_rejected_sessions(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        let mut index = 0;

        while index < self.rejected_sessions.len() {
            let session = &self.rejected_sessions[index];
            let sent = self.egress_publisher.send_event(
                session,
                self.leadership_term_id,
                self.leader_member_id,
                session.event_code(),
                session.response_detail(),
            );

            if sent
                || now_ns > session.time_of_last_activity_ns() + self.config.session_timeout_ns()
            {
                let mut session = self.rejected_sessions.swap_remove(index);
                session.disconnect();
                work += 1;
            } else {
                index += 1;
            }
        }

        work
    }

    fn process_redirect_sessions(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        let mut index = 0;

        while index < self.redirect_sessions.len() {
            let session = &self.redirect_sessions[index];
            let sent = self.egress_publisher.send_event(
                session,
                self.leadership_term_id,
                self.leader_member_id,
                EventCode::Redirect,
                &self.client_facing_endpoints,
            );

            if sent
                || now_ns > session.time_of_last_activity_ns() + self.config.session_timeout_ns()
            {
                let mut session = self.redirect_sessions.swap_remove(index);
                session.disconnect();
                work += 1;
            } else {
                index += 1;
            }
        }

        work
    }

    fn check_sessions(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        let session_ids: Vec<SessionId> = self.session_by_id.keys().copied().collect();

        for session_id in session_ids {
            let Some(mut session) = self.session_by_id.remove(&session_id) else {
                continue;
            };

            let timed_out =
                now_ns > session.time_of_last_activity_ns() + self.config.session_timeout_ns();

            if timed_out {
                work += 1;
                match session.state() {
                    SessionState::Open => {
                        session.close(CloseReason::Timeout);
                        if self.append_session_close_committing(&mut session) {
                            self.counters.timed_out_clients.increment();
                        } else {
                            self.session_by_id.insert(session_id, session);
                        }
                    }
                    SessionState::Closed => {
                        let was_timeout = session.close_reason() == Some(CloseReason::Timeout);
                        if self.append_session_close_committing(&mut session) {
                            if was_timeout {
                                self.counters.timed_out_clients.increment();
                            }
                        } else {
                            self.session_by_id.insert(session_id, session);
                        }
                    }
                    _ => {
                        session.disconnect();
                    }
                }
                continue;
            }

            if session.state() == SessionState::Authenticated {
                // An earlier open-append was flow controlled; retry.
                let position = self.log_publisher.append_session_open(
                    &session,
                    self.leadership_term_id,
                    self.clock.time(),
                );
                if position > 0 {
                    session.open(position);
                }
                work += 1;
            } else if session.has_new_leader_event_pending() {
                if self.egress_publisher.new_leader(
                    &session,
                    self.leadership_term_id,
                    self.leader_member_id,
                    &self.client_facing_endpoints,
                ) {
                    session.set_new_leader_event_pending(false);
                }
                work += 1;
            }

            self.session_by_id.insert(session_id, session);
        }

        work
    }

    /// Append a close for `session`; on success the close is tracked as
    /// uncommitted and the caller must not reinsert the session.
    fn append_session_close_committing(&mut self, session: &mut ClusterSession) -> bool {
        let position = self.log_publisher.append_session_close(
            session,
            self.leadership_term_id,
            self.clock.time(),
        );
        if position == 0 {
            return false;
        }

        let reason = session
            .close_reason()
            .unwrap_or(CloseReason::Timeout);
        self.egress_publisher.send_event(
            session,
            self.leadership_term_id,
            self.member_id,
            EventCode::Closed,
            &format!("{reason:?}"),
        );
        session.set_closed_log_position(position);
        session.disconnect();

        let owned = std::mem::replace(
            session,
            ClusterSession::new(SessionId::NONE, 0, String::new()),
        );
        self.uncommitted.add_closed_session(owned);

        true
    }

    // --- timers and service messages ------------------------------------

    fn poll_timers(&mut self, now: u64) -> usize {
        let Self {
            timer_wheel,
            log_publisher,
            uncommitted,
            leadership_term_id,
            ..
        } = self;

        timer_wheel.poll(now, |correlation_id| {
            let position = log_publisher.append_timer(correlation_id, *leadership_term_id, now);
            if position > 0 {
                uncommitted.add_timer(position, correlation_id);
                true
            } else {
                false
            }
        })
    }

    fn append_pending_service_messages(&mut self, now: u64) -> usize {
        let Self {
            pending_service_messages,
            log_publisher,
            uncommitted,
            leadership_term_id,
            log_service_session_id,
            ..
        } = self;

        pending_service_messages.process_head(SERVICE_MESSAGE_LIMIT, |slot| {
            let position = log_publisher.append_message(
                *leadership_term_id,
                slot.service_session_id,
                now,
                slot.payload.clone(),
            );
            if position > 0 {
                uncommitted.increment_service_messages();
                *log_service_session_id = slot.service_session_id;
            }
            position
        })
    }

    // --- service channel ------------------------------------------------

    fn poll_service_adapter(&mut self) -> Result<usize> {
        let messages = self.service_adapter.poll(CONSENSUS_FRAGMENT_LIMIT);
        let count = messages.len();
        for message in messages {
            self.on_service_message(message)?;
        }

        Ok(count)
    }

    fn on_service_message(&mut self, message: ServiceMessage) -> Result<()> {
        match message {
            ServiceMessage::Ack {
                log_position,
                timestamp,
                ack_id,
                relevant_id,
                service_id,
            } => self.on_service_ack(log_position, timestamp, ack_id, relevant_id, service_id),
            ServiceMessage::CloseSession { session_id } => {
                self.on_service_close_session(session_id);
                Ok(())
            }
            ServiceMessage::SessionMessage {
                leadership_term_id,
                payload,
            } => {
                if leadership_term_id == self.leadership_term_id {
                    let session_id = self.next_service_session_id;
                    self.next_service_session_id = self.next_service_session_id.next();
                    self.pending_service_messages.append(session_id, payload)?;
                }
                Ok(())
            }
            ServiceMessage::ScheduleTimer {
                correlation_id,
                deadline,
            } => {
                self.timer_wheel.schedule(correlation_id, deadline);
                Ok(())
            }
            ServiceMessage::CancelTimer { correlation_id } => {
                self.timer_wheel.cancel(correlation_id);
                Ok(())
            }
            ServiceMessage::ClusterMembersQuery { correlation_id } => {
                self.service_proxy.cluster_members_response(
                    correlation_id,
                    self.leader_member_id,
                    &member::encode_as_string(&self.cluster_members),
                    &member::encode_as_string(&self.passive_members),
                );
                Ok(())
            }
        }
    }

    fn on_service_close_session(&mut self, session_id: SessionId) {
        let Some(mut session) = self.session_by_id.remove(&session_id) else {
            return;
        };

        session.close(CloseReason::ServiceAction);
        if self.role == Role::Leader {
            let position = self.log_publisher.append_session_close(
                &session,
                self.leadership_term_id,
                self.clock.time(),
            );
            if position > 0 {
                self.egress_publisher.send_event(
                    &session,
                    self.leadership_term_id,
                    self.member_id,
                    EventCode::Closed,
                    "ServiceAction",
                );
                session.set_closed_log_position(position);
                session.disconnect();
                self.uncommitted.add_closed_session(session);
                return;
            }
        }

        self.session_by_id.insert(session_id, session);
    }

    fn on_service_ack(
        &mut self,
        log_position: u64,
        timestamp: u64,
        ack_id: i64,
        relevant_id: i64,
        service_id: i32,
    ) -> Result<()> {
        self.service_acks.offer(
            service_id,
            ServiceAck {
                ack_id,
                log_position,
                relevant_id,
            },
        );

        if !self.service_acks.has_reached(log_position, self.service_ack_id) {
            return Ok(());
        }

        match self.state {
            ModuleState::Snapshot => {
                let service_acks = self.consume_service_acks(log_position, service_id)?;
                self.service_ack_id += 1;
                self.take_snapshot(timestamp, log_position, &service_acks)?;

                let now_ns = self.clock.time_nanos();
                if self.termination_position.is_none() {
                    self.transition_state(ModuleState::Active);
                    self.counters.control_toggle.set(ToggleState::Neutral.code());
                    for session in self.session_by_id.values_mut() {
                        session.set_time_of_last_activity_ns(now_ns);
                    }
                } else {
                    let position = self.termination_position.unwrap_or(log_position);
                    self.service_proxy.termination_position(position);
                    if let Some(termination) = self.cluster_termination.as_mut() {
                        termination.set_deadline_ns(now_ns + self.config.termination_timeout_ns());
                    }
                    self.transition_state(ModuleState::Terminating);
                }
            }
            ModuleState::Quitting => {
                self.transition_state(ModuleState::Closed);
                (self.termination_hook)();
            }
            ModuleState::Terminating => {
                let can_terminate = match self.cluster_termination.as_mut() {
                    None => {
                        // Follower: tell the leader and go.
                        if let Some(leader) =
                            find_member(&self.cluster_members, self.leader_member_id)
                        {
                            if let Some(publication) = leader.publication.as_ref() {
                                self.consensus_publisher.termination_ack(
                                    publication,
                                    log_position,
                                    self.member_id,
                                );
                            }
                        }
                        true
                    }
                    Some(termination) => {
                        termination.on_services_terminated();
                        if let Some(this_member) =
                            find_member_mut(&mut self.cluster_members, self.member_id)
                        {
                            this_member.has_terminated = true;
                        }
                        termination.can_terminate(&self.cluster_members, self.clock.time_nanos())
                    }
                };

                if can_terminate {
                    self.terminate_cluster(log_position)?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn consume_service_acks(&mut self, log_position: u64, service_id: i32) -> Result<Vec<ServiceAck>> {
        let acks = self.service_acks.remove_head();
        if acks.len() != self.config.service_count
            || acks.iter().any(|ack| ack.log_position != log_position)
        {
            return Err(ClusterError::SnapshotInvalidAck {
                service_id,
                expected: log_position,
                actual: acks.first().map(|a| a.log_position),
            });
        }

        Ok(acks)
    }

    fn terminate_cluster(&mut self, log_position: u64) -> Result<()> {
        self.recording_log
            .commit_log_position(self.leadership_term_id.0, log_position)?;
        self.transition_state(ModuleState::Closed);
        (self.termination_hook)();

        Ok(())
    }

    // --- consensus channel ----------------------------------------------

    fn poll_consensus_adapter(&mut self, now_ns: u64) -> Result<usize> {
        let messages = self.consensus_adapter.poll(CONSENSUS_FRAGMENT_LIMIT);
        let count = messages.len();
        for message in messages {
            self.on_consensus_message(message, now_ns)?;
        }

        Ok(count)
    }

    fn on_consensus_message(&mut self, message: ConsensusMessage, now_ns: u64) -> Result<()> {
        match message {
            ConsensusMessage::CanvassPosition {
                log_leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                self.on_canvass_position(log_leadership_term_id, log_position, follower_member_id)
            }
            ConsensusMessage::RequestVote {
                log_leadership_term_id,
                log_position,
                candidate_term_id,
                candidate_member_id,
            } => self.on_request_vote(
                log_leadership_term_id,
                log_position,
                candidate_term_id,
                candidate_member_id,
            ),
            ConsensusMessage::Vote {
                candidate_term_id,
                follower_member_id,
                vote,
                ..
            } => {
                if let Some(mut election) = self.election.take() {
                    election.on_vote(candidate_term_id, follower_member_id, vote);
                    self.election = Some(election);
                }
                Ok(())
            }
            ConsensusMessage::NewLeadershipTerm {
                log_leadership_term_id: _,
                leadership_term_id,
                term_base_log_position,
                append_position,
                timestamp: _,
                leader_member_id,
                log_session_id,
                is_startup,
            } => self.on_new_leadership_term(
                leadership_term_id,
                term_base_log_position,
                append_position,
                leader_member_id,
                log_session_id,
                is_startup,
                now_ns,
            ),
            ConsensusMessage::AppendPosition {
                leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                self.on_append_position(leadership_term_id, log_position, follower_member_id, now_ns);
                Ok(())
            }
            ConsensusMessage::CommitPosition {
                leadership_term_id,
                log_position,
                leader_member_id,
            } => self.on_commit_position(leadership_term_id, log_position, leader_member_id, now_ns),
            ConsensusMessage::CatchupPosition {
                leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                self.on_catchup_position(leadership_term_id, log_position, follower_member_id);
                Ok(())
            }
            ConsensusMessage::StopCatchup {
                leadership_term_id,
                follower_member_id,
            } => {
                if follower_member_id == self.member_id
                    && leadership_term_id == self.leadership_term_id
                {
                    self.catchup_in_progress = false;
                }
                Ok(())
            }
            ConsensusMessage::AddPassiveMember {
                correlation_id,
                member_endpoints,
            } => {
                self.on_add_passive_member(correlation_id, &member_endpoints);
                Ok(())
            }
            ConsensusMessage::ClusterMemberChange {
                correlation_id,
                leader_member_id,
                active_members,
                passive_members,
            } => {
                if let Some(mut dynamic_join) = self.dynamic_join.take() {
                    dynamic_join.on_cluster_members_change(
                        self,
                        correlation_id,
                        leader_member_id,
                        &active_members,
                        &passive_members,
                    );
                    self.dynamic_join = Some(dynamic_join);
                }
                Ok(())
            }
            ConsensusMessage::SnapshotRecordingQuery {
                correlation_id,
                request_member_id,
            } => {
                self.on_snapshot_recording_query(correlation_id, request_member_id);
                Ok(())
            }
            ConsensusMessage::SnapshotRecordings {
                correlation_id,
                member_endpoints,
                snapshots,
            } => {
                if let Some(mut dynamic_join) = self.dynamic_join.take() {
                    dynamic_join.on_snapshot_recordings(
                        self,
                        correlation_id,
                        &member_endpoints,
                        snapshots,
                    )?;
                    self.dynamic_join = Some(dynamic_join);
                }
                Ok(())
            }
            ConsensusMessage::JoinCluster {
                leadership_term_id,
                member_id,
            } => {
                self.on_join_cluster(leadership_term_id, member_id);
                Ok(())
            }
            ConsensusMessage::RemoveMember {
                member_id,
                is_passive,
            } => {
                self.on_remove_member(member_id, is_passive);
                Ok(())
            }
            ConsensusMessage::TerminationPosition { log_position } => {
                if self.role == Role::Follower {
                    self.termination_position = Some(log_position);
                }
                Ok(())
            }
            ConsensusMessage::TerminationAck {
                log_position,
                member_id,
            } => self.on_termination_ack(log_position, member_id),
            ConsensusMessage::BackupQuery {
                correlation_id,
                response_stream_id,
                protocol_version,
                response_channel,
                credentials,
            } => {
                self.on_backup_query(
                    correlation_id,
                    response_stream_id,
                    protocol_version,
                    response_channel,
                    credentials,
                );
                Ok(())
            }
            ConsensusMessage::BackupResponse { .. } => Ok(()),
        }
    }

    fn on_canvass_position(
        &mut self,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    ) -> Result<()> {
        if let Some(mut election) = self.election.take() {
            election.on_canvass_position(log_leadership_term_id, log_position, follower_member_id);
            self.election = Some(election);
            return Ok(());
        }

        if self.role == Role::Leader && log_leadership_term_id <= self.leadership_term_id {
            // A laggard (or a passive joiner) is canvassing; point it at
            // the current term.
            let term_base = if log_leadership_term_id < self.leadership_term_id {
                self.recording_log
                    .find_term_entry(log_leadership_term_id.0 + 1)
                    .map(|e| e.term_base_log_position)
                    .unwrap_or(log_position)
            } else {
                self.log_publisher.position()
            };

            self.publish_new_leadership_term(
                follower_member_id,
                log_leadership_term_id,
                self.leadership_term_id,
                term_base,
                self.log_publisher.session_id(),
                false,
            );
        }

        Ok(())
    }

    fn on_request_vote(
        &mut self,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        candidate_term_id: LeadershipTermId,
        candidate_member_id: MemberId,
    ) -> Result<()> {
        if let Some(mut election) = self.election.take() {
            election.on_request_vote(
                self,
                log_leadership_term_id,
                log_position,
                candidate_term_id,
                candidate_member_id,
            );
            self.election = Some(election);
            return Ok(());
        }

        if candidate_term_id > self.leadership_term_id {
            self.error_handler
                .on_error(&ClusterError::UnexpectedRoleMessage {
                    detail: format!("vote request for term {candidate_term_id}"),
                });
            self.enter_election();
            if let Some(mut election) = self.election.take() {
                election.on_request_vote(
                    self,
                    log_leadership_term_id,
                    log_position,
                    candidate_term_id,
                    candidate_member_id,
                );
                self.election = Some(election);
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_new_leadership_term(
        &mut self,
        leadership_term_id: LeadershipTermId,
        term_base_log_position: u64,
        append_position: u64,
        leader_member_id: MemberId,
        log_session_id: i32,
        is_startup: bool,
        now_ns: u64,
    ) -> Result<()> {
        if let Some(mut election) = self.election.take() {
            election.on_new_leadership_term(
                self,
                leadership_term_id,
                term_base_log_position,
                append_position,
                leader_member_id,
                log_session_id,
                is_startup,
            );
            self.election = Some(election);
            return Ok(());
        }

        if self.role == Role::Follower
            && leadership_term_id == self.leadership_term_id
            && leader_member_id == self.leader_member_id
        {
            // Accepted only from the recorded leader for the term.
            self.time_of_last_log_update_ns = now_ns;
            self.notified_commit_position = self.notified_commit_position.max(append_position);
        } else if leadership_term_id > self.leadership_term_id {
            self.error_handler
                .on_error(&ClusterError::UnexpectedRoleMessage {
                    detail: format!("new leadership term {leadership_term_id}"),
                });
            self.enter_election();
        }

        Ok(())
    }

    fn on_append_position(
        &mut self,
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
        now_ns: u64,
    ) {
        if self.role != Role::Leader || leadership_term_id != self.leadership_term_id {
            return;
        }

        let leader_position = self.log_publisher.position();
        let mut completed_catchup = None;

        if let Some(follower) = self.find_any_member_mut(follower_member_id) {
            follower.log_position = log_position;
            follower.time_of_last_append_position_ns = now_ns;

            if let Some(replay_session) = follower.catchup_replay_session_id {
                if log_position >= leader_position {
                    completed_catchup = Some((follower_member_id, replay_session));
                }
            }
        }

        if let Some((member_id, replay_session)) = completed_catchup {
            if self.archive.stop_replay(replay_session).is_ok() {
                if let Some(follower) = self.find_any_member_mut(member_id) {
                    if let Some(publication) = follower.publication.as_ref() {
                        let publication = publication.clone();
                        if self.consensus_publisher.stop_catchup(
                            &publication,
                            self.leadership_term_id,
                            member_id,
                        ) {
                            if let Some(follower) = self.find_any_member_mut(member_id) {
                                follower.catchup_replay_session_id = None;
                            }
                        }
                    }
                }
            }
        }
    }

    fn on_commit_position(
        &mut self,
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        leader_member_id: MemberId,
        now_ns: u64,
    ) -> Result<()> {
        if self.election.is_some() {
            return Ok(());
        }

        if self.role == Role::Follower
            && leadership_term_id == self.leadership_term_id
            && leader_member_id == self.leader_member_id
        {
            self.time_of_last_log_update_ns = now_ns;
            self.notified_commit_position = log_position;
        } else if leadership_term_id > self.leadership_term_id {
            self.error_handler
                .on_error(&ClusterError::UnexpectedRoleMessage {
                    detail: format!("commit position from term {leadership_term_id}"),
                });
            self.enter_election();
        }

        Ok(())
    }

    fn on_catchup_position(
        &mut self,
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    ) {
        if self.role != Role::Leader || leadership_term_id != self.leadership_term_id {
            return;
        }

        let Some(recording_id) = self.log_recording_id else {
            return;
        };

        let Some(follower) = self.find_any_member_mut(follower_member_id) else {
            return;
        };
        if follower.catchup_replay_session_id.is_some() {
            return;
        }

        let log_endpoint = follower.log_endpoint.clone();
        let destination = self.media.log_buffer(&log_endpoint, LOG_STREAM_ID);
        match self.archive.start_replay(recording_id, log_position, &destination) {
            Ok(replay_session_id) => {
                if let Some(follower) = self.find_any_member_mut(follower_member_id) {
                    follower.catchup_replay_session_id = Some(replay_session_id);
                }
            }
            Err(error) => {
                // Catch-up failure is survivable; clear state and warn.
                self.error_handler.on_error(&error.into());
            }
        }
    }

    fn on_add_passive_member(&mut self, correlation_id: CorrelationId, member_endpoints: &str) {
        if self.election.is_some() {
            return;
        }

        if self.role == Role::Leader {
            let all_endpoints: Vec<&str> = member_endpoints.split(',').collect();
            if all_endpoints.len() != 4 {
                return;
            }

            let duplicate = self
                .passive_members
                .iter()
                .chain(self.cluster_members.iter())
                .any(|m| m.client_facing_endpoint == all_endpoints[0]);
            if duplicate {
                return;
            }

            self.high_member_id += 1;
            let mut new_member = ClusterMember::new(
                MemberId(self.high_member_id),
                all_endpoints[0],
                all_endpoints[1],
                all_endpoints[2],
                all_endpoints[3],
            );
            new_member.correlation_id = correlation_id;
            new_member.ensure_publication(&self.media);

            let log_buffer = self.media.log_buffer(&new_member.log_endpoint, LOG_STREAM_ID);
            self.log_publisher
                .add_passive_follower(&new_member.log_endpoint.clone(), log_buffer);

            self.passive_members.push(new_member);
        } else if let Some(leader) = find_member(&self.cluster_members, self.leader_member_id) {
            if let Some(publication) = leader.publication.as_ref() {
                self.consensus_publisher.send(
                    publication,
                    &ConsensusMessage::AddPassiveMember {
                        correlation_id,
                        member_endpoints: member_endpoints.to_string(),
                    },
                );
            }
        }
    }

    fn on_snapshot_recording_query(&mut self, correlation_id: CorrelationId, request_member_id: MemberId) {
        if self.election.is_some() || self.role != Role::Leader {
            return;
        }

        let Some(requester) = self.find_any_member(request_member_id) else {
            return;
        };
        let Some(publication) = requester.publication.clone() else {
            return;
        };

        let mut snapshots = Vec::new();
        for snapshot in &self.recovery_plan.snapshots {
            let Ok(frames) = self.archive.recorded_frames(snapshot.recording_id) else {
                continue;
            };
            let Ok(start_position) = self.archive.recording_start_position(snapshot.recording_id)
            else {
                continue;
            };

            snapshots.push(SnapshotTransfer {
                metadata: snapshot.clone(),
                start_position,
                frames: frames
                    .into_iter()
                    .map(|f| (f.end_position, f.payload))
                    .collect(),
            });
        }

        self.consensus_publisher.send(
            &publication,
            &ConsensusMessage::SnapshotRecordings {
                correlation_id,
                member_endpoints: member::encode_as_string(&self.cluster_members),
                snapshots,
            },
        );
    }

    fn on_join_cluster(&mut self, leadership_term_id: LeadershipTermId, member_id: MemberId) {
        if self.election.is_some() || self.role != Role::Leader {
            return;
        }

        let snapshot_leadership_term_id = self
            .recovery_plan
            .snapshots
            .first()
            .map(|s| LeadershipTermId(s.leadership_term_id))
            .unwrap_or(LeadershipTermId::NONE);

        if leadership_term_id > snapshot_leadership_term_id {
            return;
        }

        let media = self.media.clone();
        let mut log_follower = None;
        if let Some(passive) = self
            .passive_members
            .iter_mut()
            .find(|m| m.id == member_id)
        {
            if !passive.has_requested_join {
                passive.ensure_publication(&media);
                log_follower = Some(passive.log_endpoint.clone());
                passive.has_requested_join = true;
            }
        }

        if let Some(log_endpoint) = log_follower {
            let buffer = self.media.log_buffer(&log_endpoint, LOG_STREAM_ID);
            self.log_publisher.add_passive_follower(&log_endpoint, buffer);
        }
    }

    fn on_remove_member(&mut self, member_id: MemberId, is_passive: bool) {
        if self.election.is_some() || self.role != Role::Leader {
            return;
        }

        if is_passive {
            if let Some(mut member) = member::remove_member(&mut self.passive_members, member_id) {
                member.close_publication();
                self.log_publisher.remove_passive_follower(&member.log_endpoint);
            }
            return;
        }

        if find_member(&self.cluster_members, member_id).is_none() {
            return;
        }

        let mut remaining: Vec<String> = Vec::new();
        for member in &self.cluster_members {
            if member.id != member_id {
                remaining.push(member.endpoints());
            }
        }
        let new_members_string = remaining.join("|");
        let now = self.clock.time();

        let position = self.log_publisher.append_membership_change_event(
            self.leadership_term_id,
            now,
            self.member_id,
            (self.cluster_members.len() - 1) as u32,
            ChangeType::Quit,
            member_id,
            new_members_string,
        );

        if position > 0 {
            self.time_of_last_log_update_ns =
                self.clock.time_nanos().saturating_sub(self.config.leader_heartbeat_interval_ns());
            if let Some(member) = find_member_mut(&mut self.cluster_members, member_id) {
                member.has_requested_remove = true;
                member.removal_position = Some(position);
            }
            self.pending_member_removals += 1;
        }
    }

    fn on_termination_ack(&mut self, log_position: u64, member_id: MemberId) -> Result<()> {
        if self.role != Role::Leader || Some(log_position) != self.termination_position {
            return Ok(());
        }

        if let Some(member) = find_member_mut(&mut self.cluster_members, member_id) {
            member.has_terminated = true;
        }

        let can_terminate = self
            .cluster_termination
            .as_ref()
            .map(|t| t.can_terminate(&self.cluster_members, self.clock.time_nanos()))
            .unwrap_or(false);

        if can_terminate {
            self.terminate_cluster(log_position)?;
        }

        Ok(())
    }

    fn on_backup_query(
        &mut self,
        correlation_id: CorrelationId,
        response_stream_id: i32,
        protocol_version: crate::types::SemanticVersion,
        response_channel: String,
        credentials: Bytes,
    ) {
        if self.role != Role::Leader && self.election.is_none() {
            if let Some(leader) = find_member(&self.cluster_members, self.leader_member_id) {
                if let Some(publication) = leader.publication.as_ref() {
                    self.consensus_publisher.send(
                        publication,
                        &ConsensusMessage::BackupQuery {
                            correlation_id,
                            response_stream_id,
                            protocol_version,
                            response_channel,
                            credentials,
                        },
                    );
                }
            }
            return;
        }

        if !matches!(self.state, ModuleState::Active | ModuleState::Suspended) {
            return;
        }

        let now = self.clock.time();
        let now_ns = self.clock.time_nanos();
        let mut session = ClusterSession::new(SessionId::NONE, response_stream_id, response_channel);
        session.last_activity(now_ns, correlation_id);
        session.mark_as_backup_session();
        session.connect(&self.media);

        if !self.config.protocol_version.is_compatible_with(protocol_version) {
            let detail = format!(
                "{SESSION_INVALID_VERSION_MSG} {protocol_version}, cluster is {}",
                self.config.protocol_version
            );
            session.reject(EventCode::Error, detail);
            self.rejected_sessions.push(session);
        } else if self.pending_sessions.len() + self.session_by_id.len()
            >= self.config.max_concurrent_sessions
        {
            session.reject(EventCode::Error, SESSION_LIMIT_MSG);
            self.rejected_sessions.push(session);
        } else {
            self.authenticator.on_connect_request(
                session.id(),
                &credentials,
                self.config.time_unit.to_nanos(now) / 1_000_000,
            );
            self.pending_sessions.push(session);
        }
    }

    // --- membership -----------------------------------------------------

    fn find_any_member(&self, member_id: MemberId) -> Option<&ClusterMember> {
        find_member(&self.cluster_members, member_id)
            .or_else(|| find_member(&self.passive_members, member_id))
    }

    fn find_any_member_mut(&mut self, member_id: MemberId) -> Option<&mut ClusterMember> {
        if self.cluster_members.iter().any(|m| m.id == member_id) {
            return find_member_mut(&mut self.cluster_members, member_id);
        }
        find_member_mut(&mut self.passive_members, member_id)
    }

    fn process_passive_members(&mut self) -> usize {
        let mut work = 0;

        // Acknowledge pending passive adds.
        let actives = member::encode_as_string(&self.cluster_members);
        let passives = member::encode_as_string(&self.passive_members);
        for member in self.passive_members.iter_mut() {
            if member.correlation_id != CorrelationId::NONE {
                if let Some(publication) = member.publication.as_ref() {
                    if self.consensus_publisher.send(
                        publication,
                        &ConsensusMessage::ClusterMemberChange {
                            correlation_id: member.correlation_id,
                            leader_member_id: self.member_id,
                            active_members: actives.clone(),
                            passive_members: passives.clone(),
                        },
                    ) {
                        member.correlation_id = CorrelationId::NONE;
                        work += 1;
                    }
                }
            }
        }

        // Promote a caught-up joiner with a log-replicated JOIN.
        let leader_position = self.log_publisher.position();
        let candidate = self
            .passive_members
            .iter()
            .position(|m| m.has_requested_join && m.log_position == leader_position);

        if let Some(index) = candidate {
            let joiner_id = self.passive_members[index].id;
            let mut new_members_strings: Vec<String> = self
                .cluster_members
                .iter()
                .map(ClusterMember::endpoints)
                .collect();
            new_members_strings.push(self.passive_members[index].endpoints());
            let new_members = new_members_strings.join("|");
            let now = self.clock.time();

            let position = self.log_publisher.append_membership_change_event(
                self.leadership_term_id,
                now,
                self.member_id,
                (self.cluster_members.len() + 1) as u32,
                ChangeType::Join,
                joiner_id,
                new_members,
            );

            if position > 0 {
                self.time_of_last_log_update_ns = self
                    .clock
                    .time_nanos()
                    .saturating_sub(self.config.leader_heartbeat_interval_ns());
                let mut member = self.passive_members.remove(index);
                member.has_requested_join = false;
                member.time_of_last_append_position_ns = self.clock.time_nanos();
                self.cluster_members.push(member);
                work += 1;
            }
        }

        work
    }

    fn cluster_member_joined(&mut self, member_id: MemberId, new_members: &str) {
        self.high_member_id = self.high_member_id.max(member_id.0);

        let Ok(parsed) = member::parse_members(new_members) else {
            return;
        };
        let Some(joined) = parsed.into_iter().find(|m| m.id == member_id) else {
            return;
        };

        member::remove_member(&mut self.passive_members, member_id);
        if find_member(&self.cluster_members, member_id).is_none() {
            let mut joined = joined;
            joined.ensure_publication(&self.media);
            joined.time_of_last_append_position_ns = self.clock.time_nanos();
            self.cluster_members.push(joined);
        }
    }

    fn cluster_member_quit(&mut self, member_id: MemberId) {
        if let Some(mut member) = member::remove_member(&mut self.cluster_members, member_id) {
            member.close_publication();
        }
    }

    // --- log consumption ------------------------------------------------

    fn poll_log(&mut self, limit_position: u64) -> Result<usize> {
        let mut adapter = std::mem::take(&mut self.log_adapter);
        let mut first_error = None;

        let consumed = adapter.poll(limit_position, LOG_FRAGMENT_LIMIT, |end_position, entry| {
            if first_error.is_some() {
                return PollAction::Abort;
            }
            match self.on_log_entry(end_position, entry) {
                Ok(action) => action,
                Err(error) => {
                    first_error = Some(error);
                    PollAction::Abort
                }
            }
        });

        self.log_adapter = adapter;
        self.counters
            .commit_position
            .propose_max(self.log_adapter.position());

        match first_error {
            Some(error) => Err(error),
            None => Ok(consumed),
        }
    }

    fn on_log_entry(&mut self, end_position: u64, entry: LogEntry) -> Result<PollAction> {
        match entry {
            LogEntry::SessionMessage {
                session_id,
                timestamp,
                ..
            } => {
                if let Some(session) = self.session_by_id.get_mut(&session_id) {
                    session
                        .set_time_of_last_activity_ns(self.config.time_unit.to_nanos(timestamp));
                } else {
                    // Service-originated: reconcile locally enqueued copies.
                    self.log_service_session_id = session_id;
                    self.pending_service_messages.sweep_delivered(session_id);
                }
            }
            LogEntry::Timer { correlation_id, .. } => {
                if !self.timer_wheel.cancel(correlation_id) {
                    self.timer_wheel.increment_expired_count(correlation_id);
                }
            }
            LogEntry::SessionOpen {
                correlation_id,
                session_id,
                timestamp,
                response_stream_id,
                response_channel,
                ..
            } => {
                let mut session =
                    ClusterSession::new(session_id, response_stream_id, response_channel);
                session.last_activity(self.config.time_unit.to_nanos(timestamp), correlation_id);
                session.open(end_position);
                self.session_by_id.insert(session_id, session);
                if session_id >= self.next_session_id {
                    self.next_session_id = session_id.next();
                }
            }
            LogEntry::SessionClose {
                session_id,
                close_reason,
                ..
            } => {
                if let Some(mut session) = self.session_by_id.remove(&session_id) {
                    session.close(close_reason);
                }
            }
            LogEntry::ClusterAction {
                leadership_term_id,
                action,
                ..
            } => {
                if leadership_term_id == self.leadership_term_id {
                    match action {
                        ClusterAction::Suspend => self.transition_state(ModuleState::Suspended),
                        ClusterAction::Resume => self.transition_state(ModuleState::Active),
                        ClusterAction::Snapshot => self.transition_state(ModuleState::Snapshot),
                    }
                }
            }
            LogEntry::NewLeadershipTerm {
                leadership_term_id,
                time_unit,
                app_version,
                ..
            } => {
                if time_unit != self.config.time_unit {
                    return Err(ClusterError::IncompatibleTimeUnit {
                        ours: self.config.time_unit,
                        theirs: time_unit,
                    });
                }
                if !self.config.app_version.is_compatible_with(app_version) {
                    return Err(ClusterError::IncompatibleVersion {
                        ours: self.config.app_version,
                        theirs: app_version,
                    });
                }
                self.set_leadership_term_id(leadership_term_id);
            }
            LogEntry::MembershipChange {
                leadership_term_id,
                leader_member_id,
                change_type,
                member_id,
                members,
                ..
            } => {
                if leadership_term_id == self.leadership_term_id {
                    self.on_replay_membership_change(
                        end_position,
                        leader_member_id,
                        change_type,
                        member_id,
                        &members,
                    )?;
                }
            }
        }

        Ok(PollAction::Continue)
    }

    fn on_replay_membership_change(
        &mut self,
        log_position: u64,
        leader_member_id: MemberId,
        change_type: ChangeType,
        member_id: MemberId,
        members: &str,
    ) -> Result<()> {
        match change_type {
            ChangeType::Join => {
                if member_id == self.member_id {
                    // This node was just promoted from passive to active.
                    let mut parsed = member::parse_members(members)?;
                    member::add_consensus_publications(&mut parsed, self.member_id, &self.media);
                    for member in parsed.iter_mut() {
                        member.time_of_last_append_position_ns = self.clock.time_nanos();
                    }
                    self.cluster_members = parsed;
                    self.high_member_id =
                        member::high_member_id(&self.cluster_members).max(self.high_member_id);
                    self.leader_member_id = leader_member_id;
                    self.client_facing_endpoints =
                        member::client_facing_endpoints(&self.cluster_members);
                    self.pending_join_term = None;
                } else {
                    self.cluster_member_joined(member_id, members);
                }
            }
            ChangeType::Quit => {
                if member_id == self.member_id {
                    self.transition_state(ModuleState::Quitting);
                } else {
                    let leader_stepped_down = leader_member_id == member_id;
                    self.cluster_member_quit(member_id);
                    if leader_stepped_down {
                        self.counters.commit_position.propose_max(log_position);
                        self.enter_election();
                    }
                }
            }
        }

        Ok(())
    }

    // --- positions and commit advancement -------------------------------

    pub(crate) fn local_append_position(&self) -> u64 {
        if let Some(recording_id) = self.log_recording_id {
            if let Ok(position) = self.archive.recording_position(recording_id) {
                return position;
            }
        }

        if self.role == Role::Leader {
            self.log_publisher.position()
        } else {
            self.log_adapter.position()
        }
    }

    fn update_member_position(&mut self, now_ns: u64) -> usize {
        let append_position = self.local_append_position();

        if self.role == Role::Leader {
            if let Some(this_member) = find_member_mut(&mut self.cluster_members, self.member_id) {
                this_member.log_position = append_position;
                this_member.time_of_last_append_position_ns = now_ns;
            }

            let quorum_position = member::quorum_position(&self.cluster_members);
            let commit_position = quorum_position.min(append_position);

            let advanced = self.counters.commit_position.propose_max(commit_position);
            let heartbeat_due = now_ns
                >= self.time_of_last_log_update_ns + self.config.leader_heartbeat_interval_ns();

            if advanced || heartbeat_due {
                let commit_position = self.counters.commit_position.get_weak();
                for member in &self.cluster_members {
                    if member.id != self.member_id {
                        if let Some(publication) = member.publication.as_ref() {
                            self.consensus_publisher.commit_position(
                                publication,
                                self.leadership_term_id,
                                commit_position,
                                self.member_id,
                            );
                        }
                    }
                }

                self.time_of_last_log_update_ns = now_ns;

                if self.pending_member_removals > 0 {
                    self.handle_member_removals(commit_position);
                }

                self.clear_uncommitted_entries_to(commit_position);
                return 1;
            }

            0
        } else {
            let mut work = 0;

            let heartbeat_due = now_ns
                >= self.time_of_last_append_position_ns + self.config.leader_heartbeat_interval_ns();
            if append_position != self.last_append_position || heartbeat_due {
                if let Some(leader) = find_member(&self.cluster_members, self.leader_member_id) {
                    if let Some(publication) = leader.publication.as_ref() {
                        if self.consensus_publisher.append_position(
                            publication,
                            self.leadership_term_id,
                            append_position,
                            self.member_id,
                        ) {
                            self.last_append_position = append_position;
                            self.time_of_last_append_position_ns = now_ns;
                            work += 1;
                        }
                    }
                }
            }

            self.counters
                .commit_position
                .propose_max(self.log_adapter.position());

            work
        }
    }

    fn handle_member_removals(&mut self, commit_position: u64) {
        let removed: Vec<MemberId> = self
            .cluster_members
            .iter()
            .filter(|m| {
                m.has_requested_remove
                    && m.removal_position.map_or(false, |p| p <= commit_position)
            })
            .map(|m| m.id)
            .collect();

        for member_id in removed {
            if member_id == self.member_id {
                self.transition_state(ModuleState::Quitting);
            }

            if let Some(mut member) = member::remove_member(&mut self.cluster_members, member_id) {
                member.close_publication();
                self.log_publisher.remove_passive_follower(&member.log_endpoint);
            }
            self.pending_member_removals = self.pending_member_removals.saturating_sub(1);
        }
    }

    fn clear_uncommitted_entries_to(&mut self, commit_position: u64) {
        if self.uncommitted.service_message_count() > 0 {
            let removed = self.pending_service_messages.sweep_committed(commit_position);
            self.uncommitted.release_service_messages(removed);
        }

        self.uncommitted.release_timers_to(commit_position);
        self.uncommitted.release_closed_sessions_to(commit_position);
    }

    fn restore_uncommitted_entries(&mut self, commit_position: u64) {
        for timer in self.uncommitted.drain_timers_beyond(commit_position) {
            self.timer_wheel
                .schedule_unchecked(timer.correlation_id, self.timer_wheel.current_tick_time());
        }

        // Committed appends leave the ring; everything else reverts to the
        // not-appended sentinel so a later leadership re-appends in order.
        self.pending_service_messages.sweep_committed(commit_position);
        self.pending_service_messages.reset_to_not_appended();
        self.uncommitted.clear_service_messages();

        // log_service_session_id must not cover ids whose appends rolled
        // back, or the delivered-sweep would drop them before the new term
        // re-delivers them.
        if let Some(front) = self.pending_service_messages.iter().next() {
            let before_front = SessionId(front.service_session_id.0 - 1);
            if self.log_service_session_id > before_front {
                self.log_service_session_id = before_front;
            }
        }

        for session in self.uncommitted.drain_sessions_beyond(commit_position) {
            self.session_by_id.insert(session.id(), session);
        }
    }

    // --- leadership transitions -----------------------------------------

    fn enter_election(&mut self) {
        if self.election.is_some() {
            return;
        }

        self.ingress_adapter.close();

        let commit_position = self.counters.commit_position.get_weak();
        if self.role == Role::Leader {
            if let Err(error) = self.prepare_for_new_leadership(commit_position) {
                self.error_handler.on_error(&error);
            }
        }
        self.stop_all_catchups();

        self.election = Some(Election::new(
            false,
            self.leadership_term_id,
            commit_position,
        ));
    }

    /// Step down from leadership at `log_position`: stop and trim the log
    /// recording, roll back uncommitted bookkeeping, and drop sessions the
    /// new leader will not know about.
    pub(crate) fn prepare_for_new_leadership(&mut self, log_position: u64) -> Result<()> {
        self.set_role(Role::Follower);
        self.counters.control_toggle.set(ToggleState::Inactive.code());

        let Some(recording_id) = self.log_recording_id else {
            return Ok(());
        };

        self.log_publisher.disconnect();
        self.stop_log_recording();

        self.idle.reset();
        let stop_position = loop {
            match self.archive.stop_position(recording_id)? {
                Some(position) => break position,
                None => self.idle_pass(0)?,
            }
        };

        self.archive.stop_all_replays(recording_id)?;
        if stop_position > log_position {
            self.archive.truncate_recording(recording_id, log_position)?;
        }

        self.last_append_position = log_position;
        self.notified_commit_position = log_position;
        self.counters.commit_position.set(log_position);

        self.restore_uncommitted_entries(log_position);
        self.clear_sessions_after(log_position);
        for session in self.session_by_id.values_mut() {
            session.disconnect();
        }

        Ok(())
    }

    fn stop_log_recording(&mut self) {
        if let Some(subscription_id) = self.log_subscription_id.take() {
            let _ = self.archive.try_stop_recording(subscription_id);
        }
        self.catchup_in_progress = false;
    }

    fn clear_sessions_after(&mut self, log_position: u64) {
        let opened_after: Vec<SessionId> = self
            .session_by_id
            .iter()
            .filter(|(_, s)| s.opened_log_position().map_or(false, |p| p > log_position))
            .map(|(&id, _)| id)
            .collect();

        for session_id in opened_after {
            if let Some(mut session) = self.session_by_id.remove(&session_id) {
                session.disconnect();
            }
        }

        self.pending_sessions.clear();
    }

    fn stop_all_catchups(&mut self) {
        let replays: Vec<(MemberId, i64)> = self
            .cluster_members
            .iter()
            .chain(self.passive_members.iter())
            .filter_map(|m| m.catchup_replay_session_id.map(|s| (m.id, s)))
            .collect();

        for (member_id, replay_session) in replays {
            if let Err(error) = self.archive.stop_replay(replay_session) {
                self.error_handler.on_error(&error.into());
            }
            if let Some(member) = self.find_any_member_mut(member_id) {
                member.catchup_replay_session_id = None;
            }
        }
    }

    fn own_log_endpoint(&self) -> String {
        find_member(&self.cluster_members, self.member_id)
            .map(|m| m.log_endpoint.clone())
            .unwrap_or_else(|| {
                let endpoints = self.this_member_endpoints_without_id();
                endpoints
                    .rsplit(',')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
    }

    /// Take leadership: wire the log publication to every member, record
    /// the stream locally, and walk the services onto the new term.
    pub(crate) fn become_leader(
        &mut self,
        leadership_term_id: LeadershipTermId,
        log_position: u64,
        log_session_id: i32,
        is_startup: bool,
    ) -> Result<()> {
        self.set_leadership_term_id(leadership_term_id);
        self.set_role(Role::Leader);
        self.leader_member_id = self.member_id;

        self.log_adapter.disconnect();
        self.log_publisher.disconnect();

        // Any appended-but-uncommitted tail did not survive the election;
        // the new term starts clean at its base position.
        if self.local_append_position() > log_position {
            self.stop_log_recording();
            if let Some(recording_id) = self.log_recording_id {
                self.idle.reset();
                loop {
                    match self.archive.stop_position(recording_id)? {
                        Some(_) => break,
                        None => self.idle_pass(0)?,
                    }
                }
                self.archive.truncate_recording(recording_id, log_position)?;
            }
        }

        let mut publication = LogPublication::new(log_session_id, log_position);
        for member in self.cluster_members.iter().chain(self.passive_members.iter()) {
            let buffer = self.media.log_buffer(&member.log_endpoint, LOG_STREAM_ID);
            // Anything beyond the term base on a member's image is an
            // uncommitted tail from the old term; the new term overwrites
            // it from the base.
            buffer.truncate_to(log_position);
            publication.add_destination(&member.log_endpoint, buffer);
        }
        self.log_publisher.connect(publication);

        let own_log = self.own_log_endpoint();
        let own_buffer = self.media.log_buffer(&own_log, LOG_STREAM_ID);
        self.start_log_recording(&own_buffer)?;

        self.await_services_ready(log_position, log_session_id, &own_log, is_startup)?;

        if is_startup {
            let timed_out: Vec<SessionId> = self
                .session_by_id
                .values()
                .filter(|s| s.state() == SessionState::Open)
                .map(|s| s.id())
                .collect();
            for session_id in timed_out {
                if let Some(session) = self.session_by_id.get_mut(&session_id) {
                    session.close(CloseReason::Timeout);
                }
            }
        } else {
            let now_ns = self.clock.time_nanos();
            for session in self.session_by_id.values_mut() {
                if session.state() != SessionState::Closed {
                    session.connect(&self.media);
                    session.set_time_of_last_activity_ns(now_ns);
                    session.set_new_leader_event_pending(true);
                }
            }
        }

        for member in self.cluster_members.iter_mut() {
            member.time_of_last_append_position_ns = self.clock.time_nanos();
        }

        Ok(())
    }

    /// Follower side of a new term: image the log at the term base, extend
    /// the local recording and report our append position to the leader.
    pub(crate) fn follower_log_setup(
        &mut self,
        leadership_term_id: LeadershipTermId,
        term_base_log_position: u64,
        leader_member_id: MemberId,
        is_startup: bool,
    ) -> Result<()> {
        self.set_leadership_term_id(leadership_term_id);
        self.set_role(Role::Follower);
        self.leader_member_id = leader_member_id;
        self.log_publisher.disconnect();

        let own_log = self.own_log_endpoint();
        let own_buffer = self.media.log_buffer(&own_log, LOG_STREAM_ID);

        if self.local_append_position() > term_base_log_position {
            self.stop_log_recording();
            if let Some(recording_id) = self.log_recording_id {
                self.idle.reset();
                loop {
                    match self.archive.stop_position(recording_id)? {
                        Some(_) => break,
                        None => self.idle_pass(0)?,
                    }
                }
                self.archive
                    .truncate_recording(recording_id, term_base_log_position)?;
            } else {
                own_buffer.truncate_to(term_base_log_position);
            }
        }

        let consume_from = if self.log_adapter.has_image() {
            self.log_adapter.position()
        } else {
            self.counters
                .commit_position
                .get_weak()
                .min(term_base_log_position)
        };
        self.log_adapter.set_image(own_buffer.clone(), consume_from);

        self.start_log_recording(&own_buffer)?;
        self.append_dynamic_join_term_and_snapshots()?;

        if let Some(leader) = self.find_any_member(leader_member_id) {
            if let Some(publication) = leader.publication.clone() {
                self.consensus_publisher.append_position(
                    &publication,
                    leadership_term_id,
                    self.local_append_position(),
                    self.member_id,
                );
            }
        }

        let join_position = self.log_adapter.position();
        self.await_services_ready(join_position, 0, &own_log, is_startup)?;

        Ok(())
    }

    fn start_log_recording(&mut self, buffer: &SharedLogBuffer) -> Result<()> {
        let last_recording = self.recording_log.find_last_term_recording_id();
        match last_recording.or(self.log_recording_id) {
            Some(recording_id) => {
                let subscription_id = self.archive.extend_recording(recording_id, buffer)?;
                self.log_recording_id = Some(recording_id);
                self.log_subscription_id = Some(subscription_id);
            }
            None => {
                let (recording_id, subscription_id) = self.archive.start_recording(buffer)?;
                self.log_recording_id = Some(recording_id);
                self.log_subscription_id = Some(subscription_id);
            }
        }

        Ok(())
    }

    fn append_dynamic_join_term_and_snapshots(&mut self) -> Result<()> {
        if self.dynamic_join_snapshots.is_empty() {
            return Ok(());
        }

        let log_recording_id = self.log_recording_id.unwrap_or(-1);
        let last = self
            .dynamic_join_snapshots
            .last()
            .cloned()
            .expect("non-empty");

        self.recording_log.append_term(
            log_recording_id,
            last.leadership_term_id,
            last.term_base_log_position,
            last.timestamp,
        )?;

        for snapshot in self.dynamic_join_snapshots.drain(..).rev() {
            self.recording_log.append_snapshot(
                snapshot.recording_id,
                snapshot.leadership_term_id,
                snapshot.term_base_log_position,
                snapshot.log_position,
                snapshot.timestamp,
                snapshot.service_id,
            )?;
        }
        self.recording_log.force(self.config.file_sync_level)?;

        Ok(())
    }

    pub(crate) fn request_catchup(
        &mut self,
        leadership_term_id: LeadershipTermId,
        leader_member_id: MemberId,
        log_position: u64,
    ) {
        if let Some(leader) = self.find_any_member(leader_member_id) {
            if let Some(publication) = leader.publication.clone() {
                if self.consensus_publisher.catchup_position(
                    &publication,
                    leadership_term_id,
                    log_position,
                    self.member_id,
                ) {
                    self.catchup_in_progress = true;
                }
            }
        }
    }

    /// Finish an election on this node. Returns false when the leader's
    /// term announcement entry is flow controlled and must be retried.
    pub(crate) fn election_complete(&mut self, election: &Election, now_ns: u64) -> Result<bool> {
        let term_base = election.log_position();
        let now = self.clock.time();

        if election.is_leader_here(self) {
            let appended = self.log_publisher.append_new_leadership_term_event(
                self.leadership_term_id,
                now,
                term_base,
                self.member_id,
                self.log_publisher.session_id(),
                self.config.time_unit,
                self.config.app_version,
            );
            if appended == 0 {
                return Ok(false);
            }

            self.time_of_last_log_update_ns =
                now_ns.saturating_sub(self.config.leader_heartbeat_interval_ns());
            self.timer_wheel.set_current_tick_time(now);
            self.counters.control_toggle.set(ToggleState::Neutral.code());
        } else {
            self.set_role(Role::Follower);
            self.time_of_last_log_update_ns = now_ns;
            self.time_of_last_append_position_ns = now_ns;
        }

        self.leader_member_id = election.leader_member_id();
        for member in self.cluster_members.iter_mut() {
            member.is_leader = member.id == self.leader_member_id;
        }
        self.client_facing_endpoints = member::client_facing_endpoints(&self.cluster_members);

        // Every member records the new term so recovery and snapshot
        // term-base lookups see it.
        if self
            .recording_log
            .find_term_entry(self.leadership_term_id.0)
            .is_none()
        {
            let recording_id = self.log_recording_id.unwrap_or(-1);
            self.recording_log
                .append_term(recording_id, self.leadership_term_id.0, term_base, now)?;
            self.recording_log.force(self.config.file_sync_level)?;
        }

        self.recovery_plan = self
            .recording_log
            .create_recovery_plan(&self.archive, self.config.service_count)?;

        self.notified_commit_position = term_base;
        self.counters.commit_position.propose_max(term_base);
        let log_service_session_id = self.log_service_session_id;
        self.pending_service_messages
            .sweep_delivered(log_service_session_id);

        let ingress_channel = find_member(&self.cluster_members, self.member_id)
            .map(|m| m.client_facing_endpoint.clone());
        if let Some(channel) = ingress_channel {
            self.ingress_adapter
                .connect(self.media.add_subscription(&channel, INGRESS_STREAM_ID));
        }

        if let Some(join_term) = self.pending_join_term {
            if let Some(leader) = self.find_any_member(self.leader_member_id) {
                if let Some(publication) = leader.publication.clone() {
                    self.consensus_publisher.send(
                        &publication,
                        &ConsensusMessage::JoinCluster {
                            leadership_term_id: join_term,
                            member_id: self.member_id,
                        },
                    );
                }
            }
        }

        tracing::info!(
            member_id = %self.member_id,
            leadership_term_id = %self.leadership_term_id,
            leader = %self.leader_member_id,
            role = ?self.role,
            term_base,
            "election complete"
        );

        Ok(true)
    }

    // --- election publications ------------------------------------------

    pub(crate) fn publish_canvass_position(
        &mut self,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
    ) {
        let member_id = self.member_id;
        let targets: Vec<_> = self
            .cluster_members
            .iter()
            .filter(|m| m.id != member_id)
            .filter_map(|m| m.publication.clone())
            .collect();

        for publication in targets {
            self.consensus_publisher.canvass_position(
                &publication,
                log_leadership_term_id,
                log_position,
                member_id,
            );
        }
    }

    pub(crate) fn publish_request_vote(
        &mut self,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        candidate_term_id: LeadershipTermId,
    ) {
        let member_id = self.member_id;
        let targets: Vec<_> = self
            .cluster_members
            .iter()
            .filter(|m| m.id != member_id)
            .filter_map(|m| m.publication.clone())
            .collect();

        for publication in targets {
            self.consensus_publisher.request_vote(
                &publication,
                log_leadership_term_id,
                log_position,
                candidate_term_id,
                member_id,
            );
        }
    }

    pub(crate) fn publish_vote(
        &mut self,
        candidate_term_id: LeadershipTermId,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        candidate_member_id: MemberId,
        vote: bool,
    ) {
        let member_id = self.member_id;
        if let Some(candidate) = self.find_any_member(candidate_member_id) {
            if let Some(publication) = candidate.publication.clone() {
                self.consensus_publisher.vote(
                    &publication,
                    candidate_term_id,
                    log_leadership_term_id,
                    log_position,
                    candidate_member_id,
                    member_id,
                    vote,
                );
            }
        }
    }

    pub(crate) fn publish_new_leadership_term(
        &mut self,
        target_member_id: MemberId,
        log_leadership_term_id: LeadershipTermId,
        leadership_term_id: LeadershipTermId,
        term_base_log_position: u64,
        log_session_id: i32,
        is_startup: bool,
    ) -> bool {
        let append_position = self.local_append_position().max(term_base_log_position);
        let timestamp = self.clock.time();
        let leader_member_id = self.member_id;

        let Some(target) = self.find_any_member(target_member_id) else {
            return true;
        };
        let Some(publication) = target.publication.clone() else {
            return true;
        };

        self.consensus_publisher.new_leadership_term(
            &publication,
            log_leadership_term_id,
            leadership_term_id,
            term_base_log_position,
            append_position,
            timestamp,
            leader_member_id,
            log_session_id,
            is_startup,
        )
    }

    // --- recovery and snapshots -----------------------------------------

    fn recover_from_snapshot(&mut self, snapshot: &marlin_archive::Snapshot) -> Result<()> {
        let frames = self.archive.recorded_frames(snapshot.recording_id)?;
        let parsed = load_snapshot(&frames, self.config.app_version, self.config.time_unit)?;

        self.next_session_id = parsed.next_session_id;
        self.next_service_session_id = parsed.next_service_session_id;
        self.log_service_session_id = parsed.log_service_session_id;

        for (service_session_id, payload) in parsed.pending_messages {
            self.pending_service_messages
                .load(service_session_id, payload)?;
        }

        for session in parsed.sessions {
            let session_id = session.session_id;
            let loaded = ClusterSession::loaded(
                session.session_id,
                session.correlation_id,
                session.opened_log_position,
                session.time_of_last_activity_ns,
                session.close_reason,
                session.response_stream_id,
                session.response_channel,
            );
            self.session_by_id.insert(session_id, loaded);
            if session_id >= self.next_session_id {
                self.next_session_id = session_id.next();
            }
        }

        for timer in parsed.timers {
            self.timer_wheel
                .schedule_unchecked(timer.correlation_id, timer.deadline);
        }
        self.timer_wheel.set_current_tick_time(self.clock.time());

        if self.member_id.is_none() {
            self.adopt_member_id(MemberId(parsed.member_id));
        }
        self.high_member_id = self.high_member_id.max(parsed.high_member_id);
        if self.cluster_members.is_empty() && !parsed.members.is_empty() {
            let mut members = member::parse_members(&parsed.members)?;
            member::add_consensus_publications(&mut members, self.member_id, &self.media);
            self.cluster_members = members;
            self.client_facing_endpoints = member::client_facing_endpoints(&self.cluster_members);
        }

        self.set_leadership_term_id(LeadershipTermId(snapshot.leadership_term_id));
        self.expected_ack_position = snapshot.log_position;
        self.counters.commit_position.propose_max(snapshot.log_position);

        Ok(())
    }

    fn replay_local_log(&mut self) -> Result<()> {
        let Some(log) = self.recovery_plan.log.clone() else {
            return Ok(());
        };

        let own_log = self.own_log_endpoint();
        let buffer = self.media.log_buffer(&own_log, LOG_STREAM_ID);
        self.archive
            .start_replay(log.recording_id, log.start_position, &buffer)?;
        self.log_adapter.set_image(buffer, log.start_position);

        self.service_proxy.join_log(
            LeadershipTermId(log.leadership_term_id),
            log.start_position,
            log.stop_position,
            self.member_id,
            0,
            &own_log,
            true,
        );

        self.idle.reset();
        while self.log_adapter.position() < log.stop_position {
            let consumed = self.poll_log(log.stop_position)?;
            if consumed == 0 && self.log_adapter.is_image_closed() {
                return Err(ClusterError::LogDisconnected {
                    detail: format!("replay halted at {}", self.log_adapter.position()),
                });
            }
            self.idle_pass(consumed)?;
        }

        self.await_service_acks_at(log.stop_position)?;
        self.set_leadership_term_id(LeadershipTermId(log.leadership_term_id));

        Ok(())
    }

    fn take_snapshot(
        &mut self,
        timestamp: u64,
        log_position: u64,
        service_acks: &[ServiceAck],
    ) -> Result<()> {
        let buffer = SharedLogBuffer::new(0, u64::MAX);
        let (recording_id, subscription_id) = self.archive.start_recording(&buffer)?;

        {
            let mut publication = LogPublication::new(SNAPSHOT_STREAM_ID, 0);
            publication.add_destination("snapshot", buffer.clone());
            let mut taker = SnapshotTaker::new(&mut publication);

            taker.mark_begin(
                log_position,
                self.leadership_term_id,
                self.config.time_unit,
                self.config.app_version,
            )?;

            taker.snapshot_consensus_module_state(
                self.next_session_id,
                self.next_service_session_id,
                self.log_service_session_id,
                self.pending_service_messages.size() as u32,
            )?;
            taker.snapshot_cluster_members(
                self.member_id.0,
                self.high_member_id,
                &member::encode_as_string(&self.cluster_members),
            )?;

            for session in self.session_by_id.values() {
                if matches!(session.state(), SessionState::Open | SessionState::Closed) {
                    taker.snapshot_session(session)?;
                }
            }

            for entry in self.timer_wheel.entries() {
                taker.snapshot_timer(entry)?;
            }

            for slot in self.pending_service_messages.iter() {
                taker.snapshot_pending_message(slot.service_session_id, slot.payload.clone())?;
            }

            taker.mark_end(
                log_position,
                self.leadership_term_id,
                self.config.time_unit,
                self.config.app_version,
            )?;

            // Wait for the archive to absorb the full stream.
            self.idle.reset();
            while self.archive.recording_position(recording_id)? < publication.position() {
                if self.archive.stop_position(recording_id)?.is_some() {
                    return Err(ClusterError::RecordingStopped { recording_id });
                }
                self.idle.idle_step();
            }
        }

        self.archive.try_stop_recording(subscription_id)?;

        let term_base_log_position = self
            .recording_log
            .find_term_entry(self.leadership_term_id.0)
            .map(|e| e.term_base_log_position)
            .unwrap_or(0);

        for (service_id, ack) in service_acks.iter().enumerate().rev() {
            self.recording_log.append_snapshot(
                ack.relevant_id,
                self.leadership_term_id.0,
                term_base_log_position,
                log_position,
                timestamp,
                service_id as i32,
            )?;
        }

        self.recording_log.append_snapshot(
            recording_id,
            self.leadership_term_id.0,
            term_base_log_position,
            log_position,
            timestamp,
            CONSENSUS_MODULE_SERVICE_ID,
        )?;

        self.recording_log.force(self.config.file_sync_level)?;
        self.recovery_plan = self
            .recording_log
            .create_recovery_plan(&self.archive, self.config.service_count)?;
        self.counters.snapshots.increment();

        tracing::info!(
            member_id = %self.member_id,
            log_position,
            leadership_term_id = %self.leadership_term_id,
            "snapshot taken"
        );

        Ok(())
    }

    fn await_services_ready(
        &mut self,
        log_position: u64,
        log_session_id: i32,
        log_channel: &str,
        is_startup: bool,
    ) -> Result<()> {
        self.service_proxy.join_log(
            self.leadership_term_id,
            log_position,
            u64::MAX,
            self.member_id,
            log_session_id,
            log_channel,
            is_startup,
        );

        self.await_service_acks_at(log_position)
    }

    fn await_service_acks_at(&mut self, log_position: u64) -> Result<()> {
        self.expected_ack_position = log_position;

        self.idle.reset();
        loop {
            let work = self.poll_service_adapter()?;
            if self.service_acks.has_reached(log_position, self.service_ack_id) {
                break;
            }
            self.idle_pass(work)?;
        }

        self.service_acks.remove_head();
        self.service_ack_id += 1;

        Ok(())
    }

    fn idle_pass(&mut self, work: usize) -> Result<()> {
        if let Some(invoker) = self.client_invoker.as_mut() {
            invoker();
        }
        if !self.archive.is_connected() {
            return Err(ClusterError::TransportClosed {
                detail: "archive closed while waiting".to_string(),
            });
        }

        self.idle.idle(work);
        Ok(())
    }

    // --- dynamic join ---------------------------------------------------

    fn dynamic_join_complete(&mut self, dynamic_join: &DynamicJoin) -> Result<()> {
        let mut members = member::parse_members(dynamic_join.active_members())?;
        member::add_consensus_publications(&mut members, self.member_id, &self.media);
        self.cluster_members = members;
        self.high_member_id =
            member::high_member_id(&self.cluster_members).max(self.member_id.0);
        self.leader_member_id = dynamic_join.leader_member_id();
        self.client_facing_endpoints = member::client_facing_endpoints(&self.cluster_members);

        self.recovery_plan = RecoveryPlan::from_snapshots(self.dynamic_join_snapshots.clone());

        // Module state loads here; services load their snapshots when the
        // follower transition hands them the log, so the first service ack
        // is the join ack.
        if let Some(snapshot) = self.recovery_plan.snapshots.first().cloned() {
            self.recover_from_snapshot(&snapshot)?;
        }

        self.pending_join_term = Some(LeadershipTermId(
            self.recovery_plan.last_leadership_term_id,
        ));

        if self.state != ModuleState::Suspended {
            self.transition_state(ModuleState::Active);
        }

        self.election = Some(Election::new(
            false,
            LeadershipTermId(self.recovery_plan.last_leadership_term_id),
            self.recovery_plan.appended_log_position,
        ));

        Ok(())
    }
}

enum PollOutcome {
    Continue,
    Abort(IngressMessage),
}
