//! Liveness mark file.
//!
//! External tooling watches the activity timestamp to tell a live node from
//! an abandoned directory. Updated on a slow-tick cadence.

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

const MARK_FILE_NAME: &str = "cluster-mark.dat";

pub struct MarkFile {
    path: PathBuf,
    member_id: i32,
}

impl MarkFile {
    pub fn create(dir: impl AsRef<Path>, member_id: i32) -> Result<Self> {
        let path = dir.as_ref().join(MARK_FILE_NAME);
        let mark_file = Self { path, member_id };
        mark_file.write(0)?;

        Ok(mark_file)
    }

    pub fn set_member_id(&mut self, member_id: i32) {
        self.member_id = member_id;
    }

    pub fn update_activity_timestamp(&self, now_ms: u64) -> Result<()> {
        self.write(now_ms)
    }

    fn write(&self, activity_timestamp_ms: u64) -> Result<()> {
        fs::write(
            &self.path,
            format!(
                "memberId={}\nactivityTimestamp={}\n",
                self.member_id, activity_timestamp_ms
            ),
        )
        .map_err(|source| marlin_archive::ArchiveError::from(source).into())
    }
}
