//! Durable index of leadership terms and snapshots.
//!
//! The recording log is the file a node consults on restart to decide how
//! to recover: which snapshot set to load and which recorded log to replay.
//! Records are length-prefixed bincode with a CRC32C trailer; a torn tail
//! record is truncated away on open.
//!
//! File layout per record: `u32 length | bincode(Entry) | u32 crc32c`.

use crate::archive::{Archive, RecordingId};
use crate::error::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Service id used for the consensus module's own snapshot entry,
/// distinguishing it from hosted services (ids `0..service_count`).
pub const CONSENSUS_MODULE_SERVICE_ID: i32 = -1;

pub const NULL_VALUE: i64 = -1;

const RECORDING_LOG_FILE_NAME: &str = "recording.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Term,
    Snapshot,
}

/// One record in the recording log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub recording_id: RecordingId,
    pub leadership_term_id: i64,
    pub term_base_log_position: u64,
    /// For terms: the committed position, updated by
    /// [`RecordingLog::commit_log_position`]; negative until known.
    /// For snapshots: the log position the snapshot covers.
    pub log_position: i64,
    pub timestamp: u64,
    pub service_id: i32,
}

/// A snapshot reference from the recording log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub recording_id: RecordingId,
    pub leadership_term_id: i64,
    pub term_base_log_position: u64,
    pub log_position: u64,
    pub timestamp: u64,
    pub service_id: i32,
}

/// The recorded log to replay after snapshot load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub recording_id: RecordingId,
    pub leadership_term_id: i64,
    pub term_base_log_position: u64,
    pub start_position: u64,
    pub stop_position: u64,
}

/// What recovery should do: load these snapshots (consensus module first),
/// then replay the log, if any, up to its stop position.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    pub last_leadership_term_id: i64,
    pub appended_log_position: u64,
    pub snapshots: Vec<Snapshot>,
    pub log: Option<Log>,
}

impl RecoveryPlan {
    pub fn has_replay(&self) -> bool {
        self.log
            .as_ref()
            .map(|log| log.stop_position > log.start_position)
            .unwrap_or(false)
    }

    /// Build a plan from retrieved snapshots alone (dynamic join).
    pub fn from_snapshots(snapshots: Vec<Snapshot>) -> Self {
        let (last_leadership_term_id, appended_log_position) = snapshots
            .first()
            .map(|s| (s.leadership_term_id, s.log_position))
            .unwrap_or((NULL_VALUE, 0));

        Self {
            last_leadership_term_id,
            appended_log_position,
            snapshots,
            log: None,
        }
    }
}

/// Append-mostly durable log of term and snapshot entries.
pub struct RecordingLog {
    path: PathBuf,
    entries: Vec<Entry>,
}

impl RecordingLog {
    /// Open (or create) the recording log under `dir`, reloading entries.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(RECORDING_LOG_FILE_NAME);
        let mut log = Self {
            path,
            entries: Vec::new(),
        };
        log.reload()?;

        Ok(log)
    }

    fn reload(&mut self) -> Result<()> {
        self.entries.clear();
        if !self.path.exists() {
            return Ok(());
        }

        let mut file = File::open(&self.path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut offset = 0usize;
        let mut valid_length = 0usize;
        while contents.len() - offset >= 4 {
            let length =
                u32::from_le_bytes(contents[offset..offset + 4].try_into().unwrap()) as usize;
            if contents.len() - offset < 4 + length + 4 {
                break; // torn tail record
            }

            let body = &contents[offset + 4..offset + 4 + length];
            let crc_offset = offset + 4 + length;
            let expected =
                u32::from_le_bytes(contents[crc_offset..crc_offset + 4].try_into().unwrap());
            let actual = crc32c::crc32c(body);
            if expected != actual {
                return Err(ArchiveError::CrcMismatch {
                    offset: offset as u64,
                    expected,
                    actual,
                });
            }

            self.entries.push(bincode::deserialize(body)?);
            offset = crc_offset + 4;
            valid_length = offset;
        }

        if valid_length < contents.len() {
            // Drop the torn tail so the next append starts clean.
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(valid_length as u64)?;
        }

        Ok(())
    }

    fn append_record(&mut self, entry: Entry) -> Result<()> {
        let body = bincode::serialize(&entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.write_all(&(body.len() as u32).to_le_bytes())?;
        file.write_all(&body)?;
        file.write_all(&crc32c::crc32c(&body).to_le_bytes())?;

        self.entries.push(entry);
        Ok(())
    }

    pub fn append_term(
        &mut self,
        recording_id: RecordingId,
        leadership_term_id: i64,
        term_base_log_position: u64,
        timestamp: u64,
    ) -> Result<()> {
        self.append_record(Entry {
            kind: EntryKind::Term,
            recording_id,
            leadership_term_id,
            term_base_log_position,
            log_position: NULL_VALUE,
            timestamp,
            service_id: CONSENSUS_MODULE_SERVICE_ID,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_snapshot(
        &mut self,
        recording_id: RecordingId,
        leadership_term_id: i64,
        term_base_log_position: u64,
        log_position: u64,
        timestamp: u64,
        service_id: i32,
    ) -> Result<()> {
        self.append_record(Entry {
            kind: EntryKind::Snapshot,
            recording_id,
            leadership_term_id,
            term_base_log_position,
            log_position: log_position as i64,
            timestamp,
            service_id,
        })
    }

    /// Record the final committed position for a term. Rewrites the file in
    /// place; the recording log is small.
    pub fn commit_log_position(&mut self, leadership_term_id: i64, log_position: u64) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.kind == EntryKind::Term && e.leadership_term_id == leadership_term_id)
            .ok_or(ArchiveError::UnknownTerm { leadership_term_id })?;

        if entry.log_position == log_position as i64 {
            return Ok(());
        }
        entry.log_position = log_position as i64;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        for entry in &self.entries {
            let body = bincode::serialize(entry)?;
            file.write_all(&(body.len() as u32).to_le_bytes())?;
            file.write_all(&body)?;
            file.write_all(&crc32c::crc32c(&body).to_le_bytes())?;
        }

        Ok(())
    }

    /// Fsync the file when the configured sync level requires it.
    pub fn force(&self, file_sync_level: u8) -> Result<()> {
        if file_sync_level > 0 && self.path.exists() {
            let file = OpenOptions::new().write(true).open(&self.path)?;
            if file_sync_level > 1 {
                file.sync_all()?;
            } else {
                file.sync_data()?;
            }
        }

        Ok(())
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn find_term_entry(&self, leadership_term_id: i64) -> Option<&Entry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.kind == EntryKind::Term && e.leadership_term_id == leadership_term_id)
    }

    pub fn find_last_term(&self) -> Option<&Entry> {
        self.entries.iter().rev().find(|e| e.kind == EntryKind::Term)
    }

    pub fn find_last_term_recording_id(&self) -> Option<RecordingId> {
        self.find_last_term().map(|e| e.recording_id)
    }

    /// Build the recovery plan: latest snapshot set (module entry first,
    /// then services by ascending id) plus the last term's recorded log.
    pub fn create_recovery_plan(&self, archive: &Archive, service_count: usize) -> Result<RecoveryPlan> {
        let mut snapshots = Vec::new();

        if let Some(module_entry) = self
            .entries
            .iter()
            .rev()
            .find(|e| e.kind == EntryKind::Snapshot && e.service_id == CONSENSUS_MODULE_SERVICE_ID)
        {
            snapshots.push(snapshot_from(module_entry));
            for service_id in 0..service_count as i32 {
                if let Some(entry) = self.entries.iter().rev().find(|e| {
                    e.kind == EntryKind::Snapshot
                        && e.service_id == service_id
                        && e.leadership_term_id == module_entry.leadership_term_id
                        && e.log_position == module_entry.log_position
                }) {
                    snapshots.push(snapshot_from(entry));
                }
            }
        }

        let mut log = None;
        if let Some(term_entry) = self.find_last_term() {
            let stop_position = archive
                .recording_position(term_entry.recording_id)
                .unwrap_or(term_entry.term_base_log_position);
            let start_position = snapshots
                .first()
                .filter(|s| s.leadership_term_id == term_entry.leadership_term_id)
                .map(|s| s.log_position)
                .unwrap_or(term_entry.term_base_log_position);

            log = Some(Log {
                recording_id: term_entry.recording_id,
                leadership_term_id: term_entry.leadership_term_id,
                term_base_log_position: term_entry.term_base_log_position,
                start_position,
                stop_position,
            });
        }

        let last_leadership_term_id = log
            .as_ref()
            .map(|l| l.leadership_term_id)
            .or_else(|| snapshots.first().map(|s| s.leadership_term_id))
            .unwrap_or(NULL_VALUE);

        let appended_log_position = log
            .as_ref()
            .map(|l| l.stop_position)
            .or_else(|| snapshots.first().map(|s| s.log_position))
            .unwrap_or(0);

        Ok(RecoveryPlan {
            last_leadership_term_id,
            appended_log_position,
            snapshots,
            log,
        })
    }
}

fn snapshot_from(entry: &Entry) -> Snapshot {
    Snapshot {
        recording_id: entry.recording_id,
        leadership_term_id: entry.leadership_term_id,
        term_base_log_position: entry.term_base_log_position,
        log_position: entry.log_position.max(0) as u64,
        timestamp: entry.timestamp,
        service_id: entry.service_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use marlin_transport::SharedLogBuffer;
    use tempfile::TempDir;

    #[test]
    fn append_and_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = RecordingLog::open(dir.path()).unwrap();
            log.append_term(0, 0, 0, 1000).unwrap();
            log.append_snapshot(7, 0, 0, 4096, 2000, CONSENSUS_MODULE_SERVICE_ID)
                .unwrap();
            log.force(1).unwrap();
        }

        let log = RecordingLog::open(dir.path()).unwrap();
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.entries()[0].kind, EntryKind::Term);
        assert_eq!(log.entries()[1].kind, EntryKind::Snapshot);
        assert_eq!(log.entries()[1].recording_id, 7);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = RecordingLog::open(dir.path()).unwrap();
            log.append_term(0, 0, 0, 1000).unwrap();
        }

        // Simulate a crash mid-append.
        let path = dir.path().join(RECORDING_LOG_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&99u32.to_le_bytes()).unwrap();
        file.write_all(b"torn").unwrap();
        drop(file);

        let log = RecordingLog::open(dir.path()).unwrap();
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn commit_log_position_updates_term_entry() {
        let dir = TempDir::new().unwrap();
        let mut log = RecordingLog::open(dir.path()).unwrap();
        log.append_term(3, 5, 1024, 1000).unwrap();
        log.commit_log_position(5, 8192).unwrap();

        let reloaded = RecordingLog::open(dir.path()).unwrap();
        assert_eq!(reloaded.find_term_entry(5).unwrap().log_position, 8192);

        assert!(matches!(
            log.commit_log_position(99, 0),
            Err(ArchiveError::UnknownTerm { .. })
        ));
    }

    #[test]
    fn recovery_plan_picks_latest_snapshot_set_and_log() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::connect();

        let buffer = SharedLogBuffer::new(0, 1 << 20);
        let (log_recording, _) = archive.start_recording(&buffer).unwrap();
        buffer.append(256, Bytes::from_static(b"entries"));

        let mut log = RecordingLog::open(dir.path()).unwrap();
        log.append_term(log_recording, 0, 0, 1000).unwrap();
        // Older snapshot set at position 64.
        log.append_snapshot(10, 0, 0, 64, 1500, 0).unwrap();
        log.append_snapshot(11, 0, 0, 64, 1500, CONSENSUS_MODULE_SERVICE_ID)
            .unwrap();
        // Newer set at position 128.
        log.append_snapshot(20, 0, 0, 128, 2500, 0).unwrap();
        log.append_snapshot(21, 0, 0, 128, 2500, CONSENSUS_MODULE_SERVICE_ID)
            .unwrap();

        let plan = log.create_recovery_plan(&archive, 1).unwrap();
        assert_eq!(plan.snapshots.len(), 2);
        assert_eq!(plan.snapshots[0].recording_id, 21);
        assert_eq!(plan.snapshots[0].service_id, CONSENSUS_MODULE_SERVICE_ID);
        assert_eq!(plan.snapshots[1].recording_id, 20);

        let plan_log = plan.log.unwrap();
        assert_eq!(plan_log.recording_id, log_recording);
        assert_eq!(plan_log.start_position, 128);
        assert_eq!(plan_log.stop_position, 256);
        assert_eq!(plan.appended_log_position, 256);
        assert!(plan.last_leadership_term_id == 0);
    }

    #[test]
    fn empty_log_yields_empty_plan() {
        let dir = TempDir::new().unwrap();
        let archive = Archive::connect();
        let log = RecordingLog::open(dir.path()).unwrap();

        let plan = log.create_recovery_plan(&archive, 2).unwrap();
        assert!(plan.snapshots.is_empty());
        assert!(plan.log.is_none());
        assert_eq!(plan.last_leadership_term_id, NULL_VALUE);
        assert_eq!(plan.appended_log_position, 0);
    }
}
