//! In-process archive: recordings over shared log buffers with replay.
//!
//! A recording follows a live stream buffer; its recorded position is the
//! buffer's end position until the recording is stopped, at which point the
//! stop position freezes. Replay copies recorded frames into a destination
//! buffer, deduplicated by position on the receiving side, so replay and a
//! live stream can be merged during catch-up.

use crate::error::{ArchiveError, Result};
use marlin_transport::{LogFrame, SharedLogBuffer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type RecordingId = i64;
pub type SubscriptionId = i64;
pub type ReplaySessionId = i64;

struct Recording {
    buffer: SharedLogBuffer,
    start_position: u64,
    stop_position: Option<u64>,
    subscription_id: SubscriptionId,
}

impl Recording {
    fn recorded_position(&self) -> u64 {
        self.stop_position.unwrap_or_else(|| self.buffer.end_position())
    }
}

struct ArchiveState {
    next_recording_id: RecordingId,
    next_subscription_id: SubscriptionId,
    next_replay_session_id: ReplaySessionId,
    recordings: HashMap<RecordingId, Recording>,
    replays: HashMap<ReplaySessionId, RecordingId>,
}

/// Control session onto the archive. Exclusively owned by the agent.
#[derive(Clone)]
pub struct Archive {
    state: Arc<Mutex<ArchiveState>>,
    connected: Arc<AtomicBool>,
}

impl Default for Archive {
    fn default() -> Self {
        Self::connect()
    }
}

impl Archive {
    pub fn connect() -> Self {
        Self {
            state: Arc::new(Mutex::new(ArchiveState {
                next_recording_id: 0,
                next_subscription_id: 0,
                next_replay_session_id: 0,
                recordings: HashMap::new(),
                replays: HashMap::new(),
            })),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ArchiveError::NotConnected)
        }
    }

    /// Start recording a live stream from its current start position.
    pub fn start_recording(&self, buffer: &SharedLogBuffer) -> Result<(RecordingId, SubscriptionId)> {
        self.check_connected()?;
        let mut state = self.state.lock();
        let recording_id = state.next_recording_id;
        state.next_recording_id += 1;
        let subscription_id = state.next_subscription_id;
        state.next_subscription_id += 1;

        state.recordings.insert(
            recording_id,
            Recording {
                buffer: buffer.clone(),
                start_position: buffer.start_position(),
                stop_position: None,
                subscription_id,
            },
        );

        Ok((recording_id, subscription_id))
    }

    /// Resume a stopped recording onto a new live stream image.
    pub fn extend_recording(
        &self,
        recording_id: RecordingId,
        buffer: &SharedLogBuffer,
    ) -> Result<SubscriptionId> {
        self.check_connected()?;
        let mut state = self.state.lock();
        let subscription_id = state.next_subscription_id;
        state.next_subscription_id += 1;

        let recording = state
            .recordings
            .get_mut(&recording_id)
            .ok_or(ArchiveError::UnknownRecording { recording_id })?;

        recording.buffer = buffer.clone();
        recording.stop_position = None;
        recording.subscription_id = subscription_id;

        Ok(subscription_id)
    }

    /// Stop the recording attached to `subscription_id`, if still active.
    pub fn try_stop_recording(&self, subscription_id: SubscriptionId) -> Result<bool> {
        self.check_connected()?;
        let mut state = self.state.lock();
        for recording in state.recordings.values_mut() {
            if recording.subscription_id == subscription_id && recording.stop_position.is_none() {
                recording.stop_position = Some(recording.buffer.end_position());
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Stop position of a recording; `None` while it is still active.
    pub fn stop_position(&self, recording_id: RecordingId) -> Result<Option<u64>> {
        self.check_connected()?;
        let state = self.state.lock();
        let recording = state
            .recordings
            .get(&recording_id)
            .ok_or(ArchiveError::UnknownRecording { recording_id })?;

        Ok(recording.stop_position)
    }

    /// Current recorded position: live end position, or the stop position
    /// once stopped. This is the agent's append-position counter source.
    pub fn recording_position(&self, recording_id: RecordingId) -> Result<u64> {
        self.check_connected()?;
        let state = self.state.lock();
        let recording = state
            .recordings
            .get(&recording_id)
            .ok_or(ArchiveError::UnknownRecording { recording_id })?;

        Ok(recording.recorded_position())
    }

    /// Truncate a stopped recording back to `position`.
    pub fn truncate_recording(&self, recording_id: RecordingId, position: u64) -> Result<()> {
        self.check_connected()?;
        let mut state = self.state.lock();
        let recording = state
            .recordings
            .get_mut(&recording_id)
            .ok_or(ArchiveError::UnknownRecording { recording_id })?;

        let stop_position = recording.stop_position.ok_or(ArchiveError::RecordingState {
            recording_id,
            expected: "stopped",
            actual: "active",
        })?;

        if position > stop_position {
            return Err(ArchiveError::InvalidTruncation {
                recording_id,
                position,
                stop_position,
            });
        }

        recording.buffer.truncate_to(position);
        recording.stop_position = Some(position);

        Ok(())
    }

    /// Replay recorded frames in `(from_position, recorded_position]` into
    /// `destination`. Delivery is immediate; the session id exists so the
    /// caller can correlate teardown the way it would for a live replay.
    pub fn start_replay(
        &self,
        recording_id: RecordingId,
        from_position: u64,
        destination: &SharedLogBuffer,
    ) -> Result<ReplaySessionId> {
        self.check_connected()?;
        let mut state = self.state.lock();
        let recording = state
            .recordings
            .get(&recording_id)
            .ok_or(ArchiveError::UnknownRecording { recording_id })?;

        let to = recording.recorded_position();
        for frame in recording.buffer.frames_between(from_position, to) {
            destination.append(frame.end_position, frame.payload);
        }

        let session_id = state.next_replay_session_id;
        state.next_replay_session_id += 1;
        state.replays.insert(session_id, recording_id);

        Ok(session_id)
    }

    pub fn stop_replay(&self, session_id: ReplaySessionId) -> Result<()> {
        self.check_connected()?;
        self.state.lock().replays.remove(&session_id);
        Ok(())
    }

    pub fn stop_all_replays(&self, recording_id: RecordingId) -> Result<()> {
        self.check_connected()?;
        self.state
            .lock()
            .replays
            .retain(|_, replayed| *replayed != recording_id);
        Ok(())
    }

    /// Record an already-materialized frame set as a stopped recording.
    /// Used when a snapshot retrieved from a remote member is adopted into
    /// the local archive.
    pub fn record_frames(&self, start_position: u64, frames: Vec<LogFrame>) -> Result<RecordingId> {
        self.check_connected()?;
        let buffer = SharedLogBuffer::new(start_position, u64::MAX);
        for frame in frames {
            buffer.append(frame.end_position, frame.payload);
        }

        let mut state = self.state.lock();
        let recording_id = state.next_recording_id;
        state.next_recording_id += 1;
        let subscription_id = state.next_subscription_id;
        state.next_subscription_id += 1;

        let stop_position = buffer.end_position();
        state.recordings.insert(
            recording_id,
            Recording {
                buffer,
                start_position,
                stop_position: Some(stop_position),
                subscription_id,
            },
        );

        Ok(recording_id)
    }

    /// Recorded frames of a recording, for snapshot loading and transfer.
    pub fn recorded_frames(&self, recording_id: RecordingId) -> Result<Vec<LogFrame>> {
        self.check_connected()?;
        let state = self.state.lock();
        let recording = state
            .recordings
            .get(&recording_id)
            .ok_or(ArchiveError::UnknownRecording { recording_id })?;

        let to = recording.recorded_position();
        Ok(recording
            .buffer
            .frames_between(recording.start_position, to))
    }

    pub fn recording_start_position(&self, recording_id: RecordingId) -> Result<u64> {
        self.check_connected()?;
        let state = self.state.lock();
        let recording = state
            .recordings
            .get(&recording_id)
            .ok_or(ArchiveError::UnknownRecording { recording_id })?;

        Ok(recording.start_position)
    }
}
