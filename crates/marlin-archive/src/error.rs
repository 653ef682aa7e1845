//! Archive error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Unknown recording id.
    #[error("unknown recording {recording_id}")]
    UnknownRecording { recording_id: i64 },

    /// Operation requires a stopped recording but it is still active,
    /// or vice versa.
    #[error("recording {recording_id} is {actual}, expected {expected}")]
    RecordingState {
        recording_id: i64,
        expected: &'static str,
        actual: &'static str,
    },

    /// Truncation point is beyond the recorded stream.
    #[error("cannot truncate recording {recording_id} to {position}, stop position is {stop_position}")]
    InvalidTruncation {
        recording_id: i64,
        position: u64,
        stop_position: u64,
    },

    /// The archive control session has been closed.
    #[error("archive not connected")]
    NotConnected,

    /// Recording-log file I/O.
    #[error("recording log I/O: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Recording-log record failed to encode or decode.
    #[error("recording log codec: {source}")]
    Codec {
        #[from]
        source: bincode::Error,
    },

    /// A recording-log record failed its checksum.
    #[error("recording log CRC mismatch at offset {offset}: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    /// No term entry recorded for the leadership term.
    #[error("unknown leadership term {leadership_term_id}")]
    UnknownTerm { leadership_term_id: i64 },
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
