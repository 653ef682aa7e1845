//! In-process cluster harness: agents, scripted service stubs, a manual
//! clock and a client, all driven from the test thread.

#![allow(dead_code)]

use bytes::Bytes;
use marlin_archive::{Archive, RecordingLog};
use marlin_cluster::agent::{
    AgentContext, ClusterCounters, ConsensusModuleAgent, Role, ToggleState,
};
use marlin_cluster::clock::ManualClock;
use marlin_cluster::config::{
    ClusterConfig, CONSENSUS_MODULE_STREAM_ID, EGRESS_STREAM_ID, INGRESS_STREAM_ID, LOG_STREAM_ID,
    SERVICE_STREAM_ID,
};
use marlin_cluster::messages::{
    decode, encode, EgressMessage, IngressMessage, LogEntry, ServiceControlMessage, ServiceMessage,
};
use marlin_cluster::session::AllowAllAuthenticator;
use marlin_cluster::types::{
    CorrelationId, LeadershipTermId, MemberId, SemanticVersion, SessionId, TimeUnit,
};
use marlin_observe::PositionCounter;
use marlin_transport::{LogFrame, Media, Publication, SharedLogBuffer, Subscription};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const PROTOCOL_VERSION: SemanticVersion = SemanticVersion::new(1, 0, 0);

/// Scripted stand-in for a hosted clustered service: joins the log when
/// told, consumes entries up to the commit position, acks joins, snapshot
/// actions and termination, and can originate service messages.
pub struct StubService {
    media: Media,
    archive: Archive,
    commit_position: PositionCounter,
    control_sub: Subscription,
    ack_pub: Publication,
    log: Option<(SharedLogBuffer, u64, u64)>,
    recovery_ack_position: Option<u64>,
    ack_id: i64,
    pending_replay_ack: Option<u64>,
    termination_ack: Option<u64>,
    outbound: VecDeque<ServiceMessage>,
    pub applied: Vec<(SessionId, Bytes)>,
}

impl StubService {
    pub fn new(
        media: Media,
        archive: Archive,
        commit_position: PositionCounter,
        control_channel: &str,
        recovery_ack_position: Option<u64>,
    ) -> Self {
        let control_sub = media.add_subscription(control_channel, SERVICE_STREAM_ID);
        let ack_pub = media.add_publication(control_channel, CONSENSUS_MODULE_STREAM_ID);

        Self {
            media,
            archive,
            commit_position,
            control_sub,
            ack_pub,
            log: None,
            recovery_ack_position,
            ack_id: 0,
            pending_replay_ack: None,
            termination_ack: None,
            outbound: VecDeque::new(),
            applied: Vec::new(),
        }
    }

    fn send_ack(&mut self, log_position: u64, relevant_id: i64) {
        let ack = ServiceMessage::Ack {
            log_position,
            timestamp: 0,
            ack_id: self.ack_id,
            relevant_id,
            service_id: 0,
        };
        assert!(self.ack_pub.try_offer(encode(&ack)), "service ack offered");
        self.ack_id += 1;
    }

    pub fn enqueue(&mut self, message: ServiceMessage) {
        self.outbound.push_back(message);
    }

    pub fn send_session_message(&mut self, leadership_term_id: LeadershipTermId, payload: Bytes) {
        self.enqueue(ServiceMessage::SessionMessage {
            leadership_term_id,
            payload,
        });
    }

    pub fn applied_service_payloads(&self) -> Vec<Bytes> {
        self.applied
            .iter()
            .filter(|(id, _)| id.is_service_session())
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn pump(&mut self) {
        if let Some(position) = self.recovery_ack_position.take() {
            self.send_ack(position, -1);
        }

        let mut control = Vec::new();
        self.control_sub.poll(32, |frame| control.push(frame));
        for frame in control {
            match decode::<ServiceControlMessage>(&frame) {
                Ok(ServiceControlMessage::JoinLog {
                    log_position,
                    max_log_position,
                    log_channel,
                    ..
                }) => {
                    let buffer = self.media.log_buffer(&log_channel, LOG_STREAM_ID);
                    self.log = Some((buffer, log_position, max_log_position));
                    if max_log_position == u64::MAX {
                        self.send_ack(log_position, -1);
                    } else {
                        self.pending_replay_ack = Some(max_log_position);
                    }
                }
                Ok(ServiceControlMessage::TerminationPosition { log_position }) => {
                    self.termination_ack = Some(log_position);
                }
                Ok(ServiceControlMessage::ClusterMembersResponse { .. }) => {}
                Err(_) => {}
            }
        }

        while let Some(message) = self.outbound.pop_front() {
            assert!(self.ack_pub.try_offer(encode(&message)));
        }

        let mut acks = Vec::new();
        if let Some((buffer, position, max_position)) = &mut self.log {
            let bound = self.commit_position.get().min(*max_position);
            while let Some(frame) = buffer.frame_after(*position) {
                if frame.end_position > bound {
                    break;
                }

                if let Ok(entry) = decode::<LogEntry>(&frame.payload) {
                    match entry {
                        LogEntry::SessionMessage {
                            session_id,
                            payload,
                            ..
                        } => self.applied.push((session_id, payload)),
                        LogEntry::ClusterAction {
                            action: marlin_cluster::messages::ClusterAction::Snapshot,
                            ..
                        } => {
                            // A service snapshot is a small recording of
                            // its own; the ack carries the recording id.
                            let snapshot_recording = self
                                .archive
                                .record_frames(
                                    0,
                                    vec![LogFrame {
                                        end_position: 32,
                                        payload: Bytes::from_static(b"service-state"),
                                    }],
                                )
                                .expect("service snapshot recorded");
                            acks.push((frame.end_position, snapshot_recording));
                        }
                        _ => {}
                    }
                }

                *position = frame.end_position;
            }

            if let Some(target) = self.pending_replay_ack {
                if *position >= target {
                    self.pending_replay_ack = None;
                    acks.push((target, -1));
                }
            }

            if let Some(target) = self.termination_ack {
                if *position >= target {
                    self.termination_ack = None;
                    acks.push((target, -1));
                }
            }
        }

        for (position, relevant_id) in acks {
            self.send_ack(position, relevant_id);
        }
    }
}

pub struct TestNode {
    pub agent: ConsensusModuleAgent,
    pub counters: ClusterCounters,
    pub service: Rc<RefCell<StubService>>,
    pub terminated: Rc<Cell<bool>>,
    pub dir: Rc<TempDir>,
    pub archive: Archive,
    pub alive: bool,
}

pub struct TestCluster {
    pub media: Media,
    pub clock: ManualClock,
    pub nodes: Vec<TestNode>,
}

pub fn members_string(count: usize) -> String {
    (0..count)
        .map(|i| format!("{i},node-{i}:client,node-{i}:member,node-{i}:transfer,node-{i}:log"))
        .collect::<Vec<_>>()
        .join("|")
}

pub fn test_config(member_id: i32, member_count: usize) -> ClusterConfig {
    ClusterConfig {
        member_id: MemberId(member_id),
        members: members_string(member_count),
        service_control_channel: format!("node-{member_id}:service"),
        time_unit: TimeUnit::Milliseconds,
        session_timeout: Duration::from_secs(5),
        leader_heartbeat_interval: Duration::from_millis(200),
        leader_heartbeat_timeout: Duration::from_secs(2),
        election_canvass_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(400),
        election_timeout_max: Duration::from_millis(800),
        termination_timeout: Duration::from_secs(5),
        service_count: 1,
        file_sync_level: 1,
        ..ClusterConfig::default()
    }
}

pub fn build_node(
    media: &Media,
    clock: &ManualClock,
    mut config: ClusterConfig,
    dir: Rc<TempDir>,
    archive: Archive,
) -> TestNode {
    config.cluster_dir = dir.path().to_path_buf();

    // The stub discovers its recovery point the way a real container does:
    // from the recording log on disk.
    let recovery_ack_position = if config.members.is_empty() {
        None
    } else {
        let recording_log = RecordingLog::open(dir.path()).expect("recording log opens");
        let plan = recording_log
            .create_recovery_plan(&archive, config.service_count)
            .expect("recovery plan");
        Some(plan.snapshots.first().map(|s| s.log_position).unwrap_or(0))
    };

    let counters = ClusterCounters::default();
    let service = Rc::new(RefCell::new(StubService::new(
        media.clone(),
        archive.clone(),
        counters.commit_position.clone(),
        &config.service_control_channel,
        recovery_ack_position,
    )));

    let terminated = Rc::new(Cell::new(false));
    let hook_flag = terminated.clone();
    let invoker_service = service.clone();

    let ctx = AgentContext {
        config,
        media: media.clone(),
        archive: archive.clone(),
        clock: Arc::new(clock.clone()),
        counters: counters.clone(),
        authenticator: Box::new(AllowAllAuthenticator),
        termination_hook: Box::new(move || hook_flag.set(true)),
        client_invoker: Some(Box::new(move || invoker_service.borrow_mut().pump())),
    };

    let agent = ConsensusModuleAgent::new(ctx).expect("agent constructs");

    TestNode {
        agent,
        counters,
        service,
        terminated,
        dir,
        archive,
        alive: true,
    }
}

impl TestCluster {
    pub fn new(member_count: usize) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let media = Media::new();
        let clock = ManualClock::new(TimeUnit::Milliseconds);
        clock.set(1_000);

        let nodes = (0..member_count)
            .map(|i| {
                let dir = Rc::new(TempDir::new().expect("temp dir"));
                build_node(
                    &media,
                    &clock,
                    test_config(i as i32, member_count),
                    dir,
                    Archive::connect(),
                )
            })
            .collect();

        Self {
            media,
            clock,
            nodes,
        }
    }

    pub fn start(&mut self) {
        for node in &mut self.nodes {
            node.agent.on_start().expect("agent starts");
        }
    }

    /// Advance the shared clock and give every live node one work cycle.
    pub fn tick(&mut self) {
        self.clock.advance(5);
        for node in &mut self.nodes {
            if node.alive {
                let _ = node.agent.do_work();
                node.service.borrow_mut().pump();
            }
        }
    }

    /// Tick until `predicate` holds, up to `max_ticks`. Returns whether the
    /// predicate was met.
    pub fn run_until(&mut self, max_ticks: usize, mut predicate: impl FnMut(&TestCluster) -> bool) -> bool {
        for _ in 0..max_ticks {
            if predicate(self) {
                return true;
            }
            self.tick();
        }

        predicate(self)
    }

    pub fn leader_index(&self) -> Option<usize> {
        self.nodes.iter().position(|n| {
            n.alive && n.agent.role() == Role::Leader && !n.agent.is_election_active()
        })
    }

    pub fn is_settled(&self) -> bool {
        self.leader_index().is_some()
            && self
                .nodes
                .iter()
                .filter(|n| n.alive)
                .all(|n| !n.agent.is_election_active())
    }

    pub fn kill(&mut self, index: usize) {
        self.nodes[index].alive = false;
    }

    pub fn revive(&mut self, index: usize) {
        self.nodes[index].alive = true;
    }

    /// Toggle a control action on the node's operator counter.
    pub fn toggle(&self, index: usize, state: ToggleState) -> bool {
        self.nodes[index]
            .counters
            .control_toggle
            .compare_and_set(ToggleState::Neutral.code(), state.code())
    }

    /// Tear a node down and bring it back from its durable state.
    pub fn restart_node(&mut self, index: usize) {
        self.nodes[index].agent.on_close();

        let dir = self.nodes[index].dir.clone();
        let archive = self.nodes[index].archive.clone();
        let member_count = self.nodes.len();
        let node = build_node(
            &self.media,
            &self.clock,
            test_config(index as i32, member_count),
            dir,
            archive,
        );

        self.nodes[index] = node;
        self.nodes[index].agent.on_start().expect("restarted agent");
    }
}

/// A cluster client talking to the leader's ingress and reading its own
/// response channel.
pub struct TestClient {
    pub ingress: Publication,
    pub egress: Subscription,
    pub response_channel: String,
    pub session_id: SessionId,
    pub leadership_term_id: LeadershipTermId,
}

impl TestClient {
    pub fn new(media: &Media, leader_index: usize, name: &str) -> Self {
        let response_channel = format!("client-{name}");
        Self {
            ingress: media.add_publication(&format!("node-{leader_index}:client"), INGRESS_STREAM_ID),
            egress: media.add_subscription(&response_channel, EGRESS_STREAM_ID),
            response_channel,
            session_id: SessionId::NONE,
            leadership_term_id: LeadershipTermId::NONE,
        }
    }

    pub fn connect(&self, correlation_id: i64) {
        assert!(self.ingress.try_offer(encode(&IngressMessage::SessionConnect {
            correlation_id: CorrelationId(correlation_id),
            response_stream_id: EGRESS_STREAM_ID,
            protocol_version: PROTOCOL_VERSION,
            response_channel: self.response_channel.clone(),
            credentials: Bytes::new(),
        })));
    }

    pub fn poll_events(&mut self) -> Vec<EgressMessage> {
        let mut events = Vec::new();
        self.egress.poll(32, |frame| {
            if let Ok(event) = decode::<EgressMessage>(&frame) {
                events.push(event);
            }
        });

        // Track the session identity from session events.
        for event in &events {
            if let EgressMessage::SessionEvent {
                session_id,
                leadership_term_id,
                code: marlin_cluster::messages::EventCode::Ok,
                ..
            } = event
            {
                self.session_id = *session_id;
                self.leadership_term_id = *leadership_term_id;
            }
        }

        events
    }

    pub fn send_message(&self, payload: Bytes) {
        assert!(self.ingress.try_offer(encode(&IngressMessage::SessionMessage {
            leadership_term_id: self.leadership_term_id,
            session_id: self.session_id,
            payload,
        })));
    }

    pub fn keep_alive(&self) {
        let _ = self.ingress.try_offer(encode(&IngressMessage::SessionKeepAlive {
            leadership_term_id: self.leadership_term_id,
            session_id: self.session_id,
        }));
    }
}
