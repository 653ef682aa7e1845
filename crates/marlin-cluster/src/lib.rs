//! marlin-cluster: the consensus module agent of a replicated
//! state-machine cluster.
//!
//! The agent is a single-threaded, cooperatively polled component: a host
//! invoker calls [`ConsensusModuleAgent::do_work`] repeatedly and the agent
//! never blocks across ticks. It owns membership, leader election
//! coordination, client session lifecycle, command ordering onto the
//! replicated log, commit advancement by quorum, snapshotting, and
//! coordinated termination. The transport and archive collaborators come
//! from `marlin-transport` and `marlin-archive`; hosted services live
//! out-of-process behind the service-control channels.

pub mod adapters;
pub mod agent;
pub mod clock;
pub mod config;
pub mod dynamic_join;
pub mod election;
pub mod error;
pub mod log_adapter;
pub mod log_publisher;
pub mod mark_file;
pub mod member;
pub mod messages;
pub mod pending;
pub mod session;
pub mod snapshot;
pub mod termination;
pub mod timer_wheel;
pub mod types;
pub mod uncommitted;

pub use agent::{AgentContext, ClusterCounters, ConsensusModuleAgent, ModuleState, Role};
pub use clock::{ClusterClock, ManualClock, SystemClock};
pub use config::ClusterConfig;
pub use error::{Category, ClusterError, Result};
