//! marlin-archive: the recording subsystem the consensus module records its
//! log and snapshots into, plus the durable index tying leadership terms and
//! snapshots together across restarts.

pub mod archive;
pub mod error;
pub mod recording_log;

pub use archive::{Archive, RecordingId, ReplaySessionId, SubscriptionId};
pub use error::{ArchiveError, Result};
pub use recording_log::{
    Entry, EntryKind, Log, RecordingLog, RecoveryPlan, Snapshot, CONSENSUS_MODULE_SERVICE_ID,
};
