//! Leadership-change laws: failover commit safety, uncommitted rollback
//! with service-message re-append, and snapshot round-trip across restart.

mod common;

use bytes::Bytes;
use common::{TestClient, TestCluster};
use marlin_cluster::agent::{Role, ToggleState};
use marlin_cluster::messages::ServiceMessage;
use marlin_cluster::types::{CorrelationId, SessionId};

fn settled_cluster(member_count: usize) -> TestCluster {
    let mut cluster = TestCluster::new(member_count);
    cluster.start();
    assert!(cluster.run_until(2_000, |c| c.is_settled()));
    cluster
}

#[test]
fn leader_failover_discards_uncommitted_entries() {
    let mut cluster = settled_cluster(3);
    assert_eq!(cluster.leader_index(), Some(0));

    let mut client = TestClient::new(&cluster.media, 0, "fo");
    client.connect(1);
    assert!(cluster.run_until(1_000, |_| {
        client.poll_events();
        client.session_id != SessionId::NONE
    }));
    assert!(cluster.run_until(1_000, |c| c
        .nodes
        .iter()
        .all(|n| n.agent.session_count() == 1)));

    let committed_before = cluster.nodes[1].agent.commit_position();

    // Freeze the followers so the next message cannot commit, then let the
    // old leader append it and die.
    cluster.kill(1);
    cluster.kill(2);
    client.send_message(Bytes::from_static(b"lost-command"));
    for _ in 0..20 {
        cluster.tick();
    }
    cluster.kill(0);
    cluster.revive(1);
    cluster.revive(2);

    // The survivors elect among themselves.
    assert!(
        cluster.run_until(3_000, |c| c.leader_index() == Some(1) && c.is_settled()),
        "survivors failed to elect"
    );

    // The new term starts from the quorum-committed position; the
    // uncommitted append is gone from every surviving state machine.
    let new_leader = &cluster.nodes[1];
    assert!(new_leader.agent.commit_position() >= committed_before);
    for node in &cluster.nodes[1..] {
        assert!(!node
            .service
            .borrow()
            .applied
            .iter()
            .any(|(_, payload)| payload.as_ref() == b"lost-command"));
    }

    // The session itself was committed before the failover and survives.
    for node in &cluster.nodes[1..] {
        assert_eq!(node.agent.session_count(), 1);
    }
}

#[test]
fn rollback_resets_service_messages_and_reappends_in_order() {
    let mut cluster = settled_cluster(3);
    assert_eq!(cluster.leader_index(), Some(0));
    let term = cluster.nodes[0].agent.leadership_term_id();

    // Freeze the followers: appends will replicate but never commit.
    cluster.kill(1);
    cluster.kill(2);

    {
        let mut service = cluster.nodes[0].service.borrow_mut();
        service.send_session_message(term, Bytes::from_static(b"svc-a"));
        service.send_session_message(term, Bytes::from_static(b"svc-b"));
        service.send_session_message(term, Bytes::from_static(b"svc-c"));
    }

    // Leader appends all three while the quorum is silent.
    assert!(cluster.run_until(50, |c| c.nodes[0]
        .agent
        .uncommitted_service_message_count()
        == 3));
    assert_eq!(cluster.nodes[0].agent.pending_service_message_count(), 3);
    let log_session_after_append = cluster.nodes[0].agent.log_service_session_id();
    assert!(log_session_after_append > SessionId(i64::MIN));

    // Quorum loss rolls the leader back to follower; every slot reverts to
    // the not-appended sentinel and nothing is lost.
    assert!(
        cluster.run_until(1_000, |c| c.nodes[0].agent.role() == Role::Follower),
        "leader failed to stand down on quorum loss"
    );
    assert_eq!(cluster.nodes[0].agent.uncommitted_service_message_count(), 0);
    assert_eq!(cluster.nodes[0].agent.uncommitted_timer_count(), 0);
    assert_eq!(cluster.nodes[0].agent.pending_service_message_count(), 3);
    assert!(cluster.nodes[0].agent.log_service_session_id() < log_session_after_append);

    // Revived cluster re-elects (member 0 ranks first again) and the
    // messages land exactly once, in order, on every service.
    cluster.revive(1);
    cluster.revive(2);
    assert!(
        cluster.run_until(4_000, |c| c.is_settled()),
        "cluster failed to re-elect"
    );

    assert!(cluster.run_until(2_000, |c| {
        c.nodes.iter().all(|n| {
            n.service.borrow().applied_service_payloads()
                == vec![
                    Bytes::from_static(b"svc-a"),
                    Bytes::from_static(b"svc-b"),
                    Bytes::from_static(b"svc-c"),
                ]
        })
    }));

    // Once committed, the ring drains and the id invariant holds.
    assert!(cluster.run_until(1_000, |c| {
        let agent = &c.nodes[0].agent;
        agent.pending_service_message_count() == 0
            && agent.uncommitted_service_message_count() == 0
    }));
    let agent = &cluster.nodes[0].agent;
    assert!(agent.next_service_session_id() > agent.log_service_session_id());
}

#[test]
fn snapshot_round_trips_across_restart() {
    let mut cluster = settled_cluster(3);
    let leader = cluster.leader_index().unwrap();
    let term = cluster.nodes[leader].agent.leadership_term_id();

    // State to cover: an open session, a live timer, a pending service
    // message that stays pending (enqueued but kept uncommitted is hard to
    // arrange here, so it commits; the ring then drains on all nodes).
    let mut client = TestClient::new(&cluster.media, leader, "rt");
    client.connect(5);
    assert!(cluster.run_until(1_000, |_| {
        client.poll_events();
        client.session_id != SessionId::NONE
    }));

    // Deterministic services schedule the same timer on every member.
    for node in &cluster.nodes {
        node.service.borrow_mut().enqueue(ServiceMessage::ScheduleTimer {
            correlation_id: CorrelationId(77),
            deadline: 10_000_000,
        });
    }
    assert!(cluster.run_until(1_000, |c| {
        client.keep_alive();
        c.nodes.iter().all(|n| n.agent.timer_count() == 1)
    }));
    assert!(cluster.run_until(1_000, |c| {
        client.keep_alive();
        c.nodes.iter().all(|n| n.agent.session_count() == 1)
    }));

    assert!(cluster.toggle(leader, ToggleState::Snapshot));
    assert!(
        cluster.run_until(2_000, |c| {
            client.keep_alive();
            c.nodes.iter().all(|n| n.counters.snapshots.get() == 1)
        }),
        "snapshot did not complete on all members"
    );

    let follower = 2;
    let before_sessions = cluster.nodes[follower].agent.open_session_ids();
    let before_timers = cluster.nodes[follower].agent.timer_count();
    let before_log_service = cluster.nodes[follower].agent.log_service_session_id();
    let before_commit = cluster.nodes[follower].agent.commit_position();
    assert_eq!(before_sessions, vec![SessionId(1)]);
    assert_eq!(before_timers, 1);

    cluster.restart_node(follower);
    assert!(
        cluster.run_until(4_000, |c| {
            client.keep_alive();
            !c.nodes[follower].agent.is_election_active()
                && c.nodes[follower].agent.role() == Role::Follower
        }),
        "restarted follower failed to rejoin"
    );

    let restarted = &cluster.nodes[follower].agent;
    assert_eq!(restarted.open_session_ids(), before_sessions);
    assert_eq!(restarted.timer_count(), before_timers);
    assert_eq!(restarted.log_service_session_id(), before_log_service);
    assert_eq!(restarted.leadership_term_id(), term);
    assert!(restarted.commit_position() >= before_commit);
}
