//! End-to-end cluster scenarios: election, client sessions, session
//! timeout, and coordinated snapshot/shutdown.

mod common;

use bytes::Bytes;
use common::{TestClient, TestCluster};
use marlin_cluster::agent::{ModuleState, Role, ToggleState};
use marlin_cluster::messages::{EgressMessage, EventCode};
use marlin_cluster::types::SessionId;

fn settled_cluster(member_count: usize) -> TestCluster {
    let mut cluster = TestCluster::new(member_count);
    cluster.start();
    assert!(
        cluster.run_until(2_000, |c| c.is_settled()),
        "cluster failed to elect a leader"
    );
    cluster
}

#[test]
fn three_node_cluster_elects_lowest_ranked_member() {
    let cluster = settled_cluster(3);

    assert_eq!(cluster.leader_index(), Some(0));
    assert_eq!(cluster.nodes[0].agent.role(), Role::Leader);
    assert_eq!(cluster.nodes[0].counters.cluster_role.get(), Role::Leader.code());
    for follower in &cluster.nodes[1..] {
        assert_eq!(follower.agent.role(), Role::Follower);
        assert_eq!(
            follower.agent.leader_member_id(),
            cluster.nodes[0].agent.member_id()
        );
    }

    // Same term everywhere, commit within bounds on every member.
    let term = cluster.nodes[0].agent.leadership_term_id();
    for node in &cluster.nodes {
        assert_eq!(node.agent.leadership_term_id(), term);
        assert!(node.agent.commit_position() <= cluster.nodes[0].agent.commit_position());
        assert_eq!(node.counters.module_state.get(), ModuleState::Active.code());
    }
}

#[test]
fn client_session_opens_on_every_member() {
    let mut cluster = settled_cluster(3);
    let leader = cluster.leader_index().unwrap();

    let mut client = TestClient::new(&cluster.media, leader, "alpha");
    client.connect(1);

    assert!(cluster.run_until(1_000, |_| client
        .poll_events()
        .iter()
        .any(|e| matches!(e, EgressMessage::SessionEvent { code: EventCode::Ok, .. }))
        || client.session_id != SessionId::NONE));
    assert_eq!(client.session_id, SessionId(1));

    let open_position = cluster.nodes[leader]
        .agent
        .commit_position();

    // The open must commit and the session must exist on all members.
    assert!(cluster.run_until(1_000, |c| {
        client.keep_alive();
        c.nodes
            .iter()
            .all(|n| n.agent.open_session_ids().contains(&SessionId(1)))
    }));
    for node in &cluster.nodes {
        assert!(node.agent.commit_position() >= open_position);
    }

    // Client messages flow through the committed log to every service.
    client.send_message(Bytes::from_static(b"command-1"));
    assert!(cluster.run_until(1_000, |c| {
        client.keep_alive();
        c.nodes.iter().all(|n| {
            n.service
                .borrow()
                .applied
                .iter()
                .any(|(id, payload)| *id == SessionId(1) && payload.as_ref() == b"command-1")
        })
    }));
}

#[test]
fn idle_session_times_out_with_counter_and_converges() {
    let mut cluster = settled_cluster(3);
    let leader = cluster.leader_index().unwrap();

    let mut client = TestClient::new(&cluster.media, leader, "beta");
    client.connect(7);
    assert!(cluster.run_until(1_000, |_| {
        client.poll_events();
        client.session_id != SessionId::NONE
    }));
    assert!(cluster.run_until(1_000, |c| c
        .nodes
        .iter()
        .all(|n| n.agent.session_count() == 1)));

    // Keep the session alive across a few timeout windows.
    for _ in 0..4 {
        for _ in 0..100 {
            cluster.tick();
        }
        client.keep_alive();
    }
    assert_eq!(cluster.nodes[leader].counters.timed_out_clients.get(), 0);
    assert_eq!(cluster.nodes[leader].agent.session_count(), 1);

    // Silence: 5s of no activity closes the session with TIMEOUT.
    assert!(cluster.run_until(2_500, |c| c.nodes[leader].agent.session_count() == 0));
    assert_eq!(cluster.nodes[leader].counters.timed_out_clients.get(), 1);

    // Followers converge through the replicated close.
    assert!(cluster.run_until(1_000, |c| c
        .nodes
        .iter()
        .all(|n| n.agent.session_count() == 0)));
    for node in &cluster.nodes[1..] {
        assert_eq!(node.counters.timed_out_clients.get(), 0);
    }

    let events = client.poll_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, EgressMessage::SessionEvent { code: EventCode::Closed, .. })));
}

#[test]
fn follower_redirects_clients_to_the_leader() {
    let mut cluster = settled_cluster(3);

    // Connect to a follower instead of the leader.
    let mut client = TestClient::new(&cluster.media, 1, "gamma");
    client.connect(3);

    let mut redirect = None;
    assert!(cluster.run_until(1_000, |_| {
        for event in client.poll_events() {
            if let EgressMessage::SessionEvent {
                code: EventCode::Redirect,
                detail,
                ..
            } = event
            {
                redirect = Some(detail);
            }
        }
        redirect.is_some()
    }));

    let endpoints = redirect.unwrap();
    assert!(endpoints.contains("0=node-0:client"));
}

#[test]
fn shutdown_toggle_snapshots_then_terminates_the_cluster() {
    let mut cluster = settled_cluster(3);
    let leader = cluster.leader_index().unwrap();

    // Put some state in so the snapshot is not empty.
    let mut client = TestClient::new(&cluster.media, leader, "delta");
    client.connect(11);
    assert!(cluster.run_until(1_000, |_| {
        client.poll_events();
        client.session_id != SessionId::NONE
    }));

    assert!(cluster.toggle(leader, ToggleState::Shutdown));

    assert!(
        cluster.run_until(4_000, |c| c.nodes.iter().all(|n| n.terminated.get())),
        "cluster failed to terminate"
    );

    for node in &cluster.nodes {
        assert_eq!(node.agent.module_state(), ModuleState::Closed);
        assert_eq!(node.counters.module_state.get(), ModuleState::Closed.code());
        assert_eq!(node.counters.snapshots.get(), 1);
    }

    // Every member persisted a module snapshot entry and the final commit
    // position for the term.
    for node in &cluster.nodes {
        let recording_log = marlin_archive::RecordingLog::open(node.dir.path()).unwrap();
        let entries = recording_log.entries();
        assert!(entries
            .iter()
            .any(|e| e.kind == marlin_archive::EntryKind::Snapshot
                && e.service_id == marlin_archive::CONSENSUS_MODULE_SERVICE_ID));
        let term_entry = recording_log.find_last_term().unwrap();
        assert!(term_entry.log_position > 0);
    }
}
