//! Leader election coordination.
//!
//! A compact canvass / nominate / ballot state machine behind the
//! member-status callback surface. Members canvass their log positions,
//! the best-positioned member (ties broken by lowest id) nominates for the
//! next term, a majority of votes makes it leader, and the
//! NewLeadershipTerm announcement walks every other member through the
//! follower transition, including catch-up when a member's log trails the
//! leader's append position.

use crate::agent::{ConsensusModuleAgent, Role};
use crate::error::Result;
use crate::member::{find_member, quorum_threshold};
use crate::types::{LeadershipTermId, MemberId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElectionState {
    Init,
    Canvass,
    Nominate,
    CandidateBallot,
    AwaitLeader,
    FollowerReady,
    LeaderReady,
}

pub struct Election {
    state: ElectionState,
    /// True when this node is recovering from a cold start; the resulting
    /// term tells services whether sessions survive.
    is_node_startup: bool,
    is_leader_startup: bool,

    /// Term of the last entry in our log when the election began.
    log_leadership_term_id: LeadershipTermId,
    /// Our appended position when the election began.
    log_position: u64,

    candidate_term_id: LeadershipTermId,
    leadership_term_id: LeadershipTermId,
    leader_member_id: MemberId,
    leader_append_position: u64,
    log_session_id: i32,

    canvass_positions: HashMap<MemberId, (LeadershipTermId, u64)>,
    votes_granted: HashSet<MemberId>,
    votes_denied: HashSet<MemberId>,
    voted_for: Option<(LeadershipTermId, MemberId)>,
    new_term_delivered: HashSet<MemberId>,

    time_of_last_canvass_ns: u64,
    fallback_deadline_ns: u64,
    follower_setup_done: bool,
    catchup_requested: bool,
}

impl Election {
    pub fn new(
        is_node_startup: bool,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
    ) -> Self {
        Self {
            state: ElectionState::Init,
            is_node_startup,
            is_leader_startup: is_node_startup,
            log_leadership_term_id,
            log_position,
            candidate_term_id: LeadershipTermId::NONE,
            leadership_term_id: log_leadership_term_id,
            leader_member_id: MemberId::NONE,
            leader_append_position: 0,
            log_session_id: 0,
            canvass_positions: HashMap::new(),
            votes_granted: HashSet::new(),
            votes_denied: HashSet::new(),
            voted_for: None,
            new_term_delivered: HashSet::new(),
            time_of_last_canvass_ns: 0,
            fallback_deadline_ns: 0,
            follower_setup_done: false,
            catchup_requested: false,
        }
    }

    pub fn leadership_term_id(&self) -> LeadershipTermId {
        self.leadership_term_id
    }

    pub fn leader_member_id(&self) -> MemberId {
        self.leader_member_id
    }

    pub fn log_position(&self) -> u64 {
        self.log_position
    }

    /// Drive the election. Returns true once complete; the agent drops the
    /// election instance at that point.
    pub fn do_work(&mut self, agent: &mut ConsensusModuleAgent, now_ns: u64) -> Result<bool> {
        match self.state {
            ElectionState::Init => {
                self.fallback_deadline_ns =
                    now_ns + agent.config().random_election_timeout().as_nanos() as u64;
                self.state = ElectionState::Canvass;
                Ok(false)
            }
            ElectionState::Canvass => {
                self.canvass_work(agent, now_ns);
                Ok(false)
            }
            ElectionState::Nominate => {
                self.nominate(agent, now_ns);
                Ok(false)
            }
            ElectionState::CandidateBallot => self.ballot_work(agent, now_ns),
            ElectionState::AwaitLeader => {
                if now_ns >= self.fallback_deadline_ns {
                    self.restart_canvass(agent, now_ns);
                }
                Ok(false)
            }
            ElectionState::FollowerReady => self.follower_work(agent, now_ns),
            ElectionState::LeaderReady => self.leader_work(agent, now_ns),
        }
    }

    fn restart_canvass(&mut self, agent: &mut ConsensusModuleAgent, now_ns: u64) {
        self.canvass_positions.clear();
        self.votes_granted.clear();
        self.votes_denied.clear();
        self.new_term_delivered.clear();
        self.time_of_last_canvass_ns = 0;
        self.fallback_deadline_ns =
            now_ns + agent.config().random_election_timeout().as_nanos() as u64;
        self.state = ElectionState::Canvass;
    }

    fn canvass_work(&mut self, agent: &mut ConsensusModuleAgent, now_ns: u64) {
        let interval = agent.config().election_canvass_interval.as_nanos() as u64;
        if now_ns >= self.time_of_last_canvass_ns + interval {
            self.time_of_last_canvass_ns = now_ns;
            agent.publish_canvass_position(self.log_leadership_term_id, self.log_position);
        }

        if !self.is_voting_member(agent) {
            // Passive joiner: wait for the leader's announcement.
            return;
        }

        let member_count = agent.active_member_count();
        if member_count == 1 {
            self.state = ElectionState::Nominate;
            return;
        }

        // Count this member plus canvass responses.
        let responses = 1 + self.canvass_positions.len();
        if responses < quorum_threshold(member_count) {
            return;
        }

        if self.is_first_ranked(agent) || now_ns >= self.fallback_deadline_ns {
            self.state = ElectionState::Nominate;
        }
    }

    fn is_voting_member(&self, agent: &ConsensusModuleAgent) -> bool {
        find_member(agent.members(), agent.member_id()).is_some()
    }

    /// Rank by (log term, log position) descending, member id ascending.
    fn is_first_ranked(&self, agent: &ConsensusModuleAgent) -> bool {
        let ours = (self.log_leadership_term_id, self.log_position);
        let our_id = agent.member_id();

        self.canvass_positions.iter().all(|(&id, &theirs)| {
            theirs < ours || (theirs == ours && our_id < id)
        })
    }

    fn nominate(&mut self, agent: &mut ConsensusModuleAgent, now_ns: u64) {
        let highest_seen = self
            .canvass_positions
            .values()
            .map(|&(term, _)| term)
            .chain([self.leadership_term_id, self.log_leadership_term_id])
            .max()
            .unwrap_or(LeadershipTermId::NONE);

        self.candidate_term_id = highest_seen.next();
        self.votes_granted.clear();
        self.votes_granted.insert(agent.member_id());
        self.votes_denied.clear();
        self.voted_for = Some((self.candidate_term_id, agent.member_id()));
        self.fallback_deadline_ns =
            now_ns + agent.config().random_election_timeout().as_nanos() as u64;

        agent.set_role(Role::Candidate);
        agent.publish_request_vote(
            self.log_leadership_term_id,
            self.log_position,
            self.candidate_term_id,
        );

        tracing::info!(
            member_id = %agent.member_id(),
            candidate_term_id = %self.candidate_term_id,
            log_position = self.log_position,
            "nominated for leadership"
        );

        self.state = ElectionState::CandidateBallot;
    }

    fn ballot_work(&mut self, agent: &mut ConsensusModuleAgent, now_ns: u64) -> Result<bool> {
        let member_count = agent.active_member_count();
        if self.votes_granted.len() >= quorum_threshold(member_count) {
            self.leadership_term_id = self.candidate_term_id;
            self.leader_member_id = agent.member_id();
            self.log_session_id = (self.candidate_term_id.0 as i32).wrapping_add(1);

            agent.become_leader(
                self.leadership_term_id,
                self.log_position,
                self.log_session_id,
                self.is_node_startup,
            )?;

            self.new_term_delivered.clear();
            self.state = ElectionState::LeaderReady;
            return Ok(false);
        }

        // A majority of denials can never become a quorum of grants.
        if self.votes_denied.len() >= quorum_threshold(member_count)
            || now_ns >= self.fallback_deadline_ns
        {
            self.restart_canvass(agent, now_ns);
        }

        Ok(false)
    }

    fn leader_work(&mut self, agent: &mut ConsensusModuleAgent, now_ns: u64) -> Result<bool> {
        let undelivered: Vec<MemberId> = agent
            .members()
            .iter()
            .map(|m| m.id)
            .filter(|&id| id != agent.member_id() && !self.new_term_delivered.contains(&id))
            .collect();

        for member_id in undelivered {
            if agent.publish_new_leadership_term(
                member_id,
                self.log_leadership_term_id,
                self.leadership_term_id,
                self.log_position,
                self.log_session_id,
                self.is_node_startup,
            ) {
                self.new_term_delivered.insert(member_id);
            }
        }

        if agent.election_complete(self, now_ns)? {
            return Ok(true);
        }

        Ok(false)
    }

    fn follower_work(&mut self, agent: &mut ConsensusModuleAgent, now_ns: u64) -> Result<bool> {
        if !self.follower_setup_done {
            agent.follower_log_setup(
                self.leadership_term_id,
                self.log_position,
                self.leader_member_id,
                self.is_leader_startup,
            )?;
            self.follower_setup_done = true;
        }

        let local_append = agent.local_append_position();
        if local_append < self.leader_append_position {
            if !self.catchup_requested {
                self.catchup_requested = true;
                agent.request_catchup(self.leadership_term_id, self.leader_member_id, local_append);
            }
            // Replayed frames land in the image; wait for the recording to
            // absorb them.
            return Ok(false);
        }

        if agent.election_complete(self, now_ns)? {
            return Ok(true);
        }

        Ok(false)
    }

    pub fn on_canvass_position(
        &mut self,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        follower_member_id: MemberId,
    ) {
        self.canvass_positions
            .insert(follower_member_id, (log_leadership_term_id, log_position));
    }

    pub fn on_request_vote(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        log_leadership_term_id: LeadershipTermId,
        log_position: u64,
        candidate_term_id: LeadershipTermId,
        candidate_member_id: MemberId,
    ) {
        let now_ns = agent.now_ns();

        if self.state == ElectionState::CandidateBallot || self.state == ElectionState::LeaderReady
        {
            if candidate_term_id <= self.candidate_term_id {
                return;
            }
            // A higher-term candidate outranks our ballot.
            self.restart_canvass(agent, now_ns);
        }

        let already_voted = self
            .voted_for
            .map(|(term, member)| term >= candidate_term_id && member != candidate_member_id)
            .unwrap_or(false);

        let log_ok = (log_leadership_term_id, log_position)
            >= (self.log_leadership_term_id, self.log_position);

        let grant = !already_voted && log_ok && candidate_term_id > self.leadership_term_id;
        if grant {
            self.voted_for = Some((candidate_term_id, candidate_member_id));
            self.leader_member_id = candidate_member_id;
            self.fallback_deadline_ns =
                now_ns + agent.config().random_election_timeout().as_nanos() as u64;
            if matches!(self.state, ElectionState::Init | ElectionState::Canvass) {
                self.state = ElectionState::AwaitLeader;
            }
        }

        agent.publish_vote(
            candidate_term_id,
            self.log_leadership_term_id,
            self.log_position,
            candidate_member_id,
            grant,
        );
    }

    pub fn on_vote(
        &mut self,
        candidate_term_id: LeadershipTermId,
        follower_member_id: MemberId,
        vote: bool,
    ) {
        if self.state == ElectionState::CandidateBallot && candidate_term_id == self.candidate_term_id
        {
            if vote {
                self.votes_granted.insert(follower_member_id);
            } else {
                self.votes_denied.insert(follower_member_id);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_new_leadership_term(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        leadership_term_id: LeadershipTermId,
        term_base_log_position: u64,
        append_position: u64,
        leader_member_id: MemberId,
        log_session_id: i32,
        is_startup: bool,
    ) {
        if leadership_term_id < self.leadership_term_id
            || leadership_term_id < self.candidate_term_id
        {
            return;
        }
        if leader_member_id == agent.member_id() {
            return;
        }

        self.leadership_term_id = leadership_term_id;
        self.leader_member_id = leader_member_id;
        self.leader_append_position = append_position;
        self.log_session_id = log_session_id;
        self.is_leader_startup = is_startup;
        self.log_position = self.log_position.min(term_base_log_position);
        self.state = ElectionState::FollowerReady;
    }

    pub fn is_leader_startup(&self) -> bool {
        self.is_leader_startup
    }

    pub fn is_leader_here(&self, agent: &ConsensusModuleAgent) -> bool {
        self.leader_member_id == agent.member_id()
    }
}
