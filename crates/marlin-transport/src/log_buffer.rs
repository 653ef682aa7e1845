//! The replicated log stream: positioned frames over shared buffers.
//!
//! Positions are absolute byte offsets from the start of the stream.
//! Each frame occupies `aligned_frame_length(payload)` bytes, so positions
//! advance the way they would over the wire, and a position reported by one
//! member addresses the same entry boundary on every member.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Frame header overhead in bytes.
pub const FRAME_HEADER_LENGTH: u64 = 32;

/// Frames are aligned so entry boundaries land on predictable offsets.
pub const FRAME_ALIGNMENT: u64 = 32;

/// Stream length occupied by a frame carrying `payload_length` bytes.
pub fn aligned_frame_length(payload_length: usize) -> u64 {
    let unaligned = FRAME_HEADER_LENGTH + payload_length as u64;
    (unaligned + (FRAME_ALIGNMENT - 1)) & !(FRAME_ALIGNMENT - 1)
}

/// One framed entry with the stream position of its trailing edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub end_position: u64,
    pub payload: Bytes,
}

struct LogBufferInner {
    frames: RwLock<Vec<LogFrame>>,
    start_position: AtomicU64,
    consumer_position: AtomicU64,
    capacity: u64,
    closed: AtomicBool,
}

/// Shared image of a log stream: the buffer a member consumes its log from
/// and the source an archive recording follows.
///
/// Appends are idempotent by position: a frame whose end position does not
/// advance the buffer is dropped, which lets a catch-up replay and the live
/// stream overlap without duplication.
#[derive(Clone)]
pub struct SharedLogBuffer {
    inner: Arc<LogBufferInner>,
}

impl SharedLogBuffer {
    pub fn new(start_position: u64, capacity: u64) -> Self {
        Self {
            inner: Arc::new(LogBufferInner {
                frames: RwLock::new(Vec::new()),
                start_position: AtomicU64::new(start_position),
                consumer_position: AtomicU64::new(start_position),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Append a frame at an explicit end position. Non-advancing frames are
    /// ignored; returns true when the buffer accepted the frame.
    pub fn append(&self, end_position: u64, payload: Bytes) -> bool {
        let mut frames = self.inner.frames.write();
        let current_end = frames
            .last()
            .map(|f| f.end_position)
            .unwrap_or_else(|| self.inner.start_position.load(Ordering::Acquire));

        if end_position <= current_end {
            return false;
        }

        frames.push(LogFrame {
            end_position,
            payload,
        });
        true
    }

    pub fn end_position(&self) -> u64 {
        self.inner
            .frames
            .read()
            .last()
            .map(|f| f.end_position)
            .unwrap_or_else(|| self.inner.start_position.load(Ordering::Acquire))
    }

    pub fn start_position(&self) -> u64 {
        self.inner.start_position.load(Ordering::Acquire)
    }

    /// True when a frame ending at `end_position` fits in the flow-control
    /// window ahead of the consumer.
    pub fn window_available(&self, end_position: u64) -> bool {
        let consumed = self.inner.consumer_position.load(Ordering::Acquire);
        end_position.saturating_sub(consumed) <= self.inner.capacity
    }

    pub fn consumer_position(&self) -> u64 {
        self.inner.consumer_position.load(Ordering::Acquire)
    }

    pub fn set_consumer_position(&self, position: u64) {
        self.inner.consumer_position.store(position, Ordering::Release);
    }

    /// First frame strictly after `position`, if any.
    pub fn frame_after(&self, position: u64) -> Option<LogFrame> {
        let frames = self.inner.frames.read();
        let index = frames.partition_point(|f| f.end_position <= position);
        frames.get(index).cloned()
    }

    /// All frames with end positions in `(from, to]`, in order.
    pub fn frames_between(&self, from: u64, to: u64) -> Vec<LogFrame> {
        self.inner
            .frames
            .read()
            .iter()
            .filter(|f| f.end_position > from && f.end_position <= to)
            .cloned()
            .collect()
    }

    /// Drop frames beyond `position`. Used when a recording is truncated
    /// back to a safe position on leadership change.
    pub fn truncate_to(&self, position: u64) {
        let mut frames = self.inner.frames.write();
        frames.retain(|f| f.end_position <= position);
        let consumed = self.inner.consumer_position.load(Ordering::Acquire);
        if consumed > position {
            self.inner.consumer_position.store(position, Ordering::Release);
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn same_buffer(&self, other: &SharedLogBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Leader-side log stream with dynamic destinations.
///
/// An append succeeds only when every destination has window for the frame
/// (min flow control); otherwise the position does not move and the caller
/// retries next tick.
pub struct LogPublication {
    session_id: i32,
    position: u64,
    destinations: Vec<(String, SharedLogBuffer)>,
    closed: bool,
}

impl LogPublication {
    pub fn new(session_id: i32, initial_position: u64) -> Self {
        Self {
            session_id,
            position: initial_position,
            destinations: Vec::new(),
            closed: false,
        }
    }

    /// Append a payload to every destination. Returns the resulting stream
    /// position, or 0 when flow controlled or disconnected.
    pub fn try_append(&mut self, payload: &Bytes) -> u64 {
        if self.closed || self.destinations.is_empty() {
            return 0;
        }

        let end_position = self.position + aligned_frame_length(payload.len());
        for (_, destination) in &self.destinations {
            if destination.is_closed() || !destination.window_available(end_position) {
                return 0;
            }
        }

        for (_, destination) in &self.destinations {
            destination.append(end_position, payload.clone());
        }
        self.position = end_position;

        end_position
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn add_destination(&mut self, channel: impl Into<String>, buffer: SharedLogBuffer) {
        let channel = channel.into();
        if !self.destinations.iter().any(|(name, _)| *name == channel) {
            self.destinations.push((channel, buffer));
        }
    }

    pub fn remove_destination(&mut self, channel: &str) {
        self.destinations.retain(|(name, _)| name != channel);
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.destinations.iter().any(|(_, b)| !b.is_closed())
    }

    pub fn disconnect(&mut self) {
        self.destinations.clear();
        self.closed = true;
    }
}

/// Consumer over a shared log buffer with an explicit position.
///
/// `peek`/`advance` split lets the caller abort mid-frame: a frame that
/// cannot be processed is simply not advanced past, and the next poll sees
/// it again.
pub struct LogSubscription {
    buffer: SharedLogBuffer,
    position: u64,
}

impl LogSubscription {
    pub fn new(buffer: SharedLogBuffer) -> Self {
        let position = buffer.consumer_position();
        Self { buffer, position }
    }

    /// Rebase the consumer, e.g. when joining a term at a known position.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
        self.buffer.set_consumer_position(position);
    }

    /// Next frame at or before `limit_position`, without consuming it.
    pub fn peek(&self, limit_position: u64) -> Option<LogFrame> {
        self.buffer
            .frame_after(self.position)
            .filter(|f| f.end_position <= limit_position)
    }

    /// Commit consumption through `end_position`.
    pub fn advance_to(&mut self, end_position: u64) {
        debug_assert!(end_position >= self.position);
        self.position = end_position;
        self.buffer.set_consumer_position(end_position);
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }

    pub fn buffer(&self) -> &SharedLogBuffer {
        &self.buffer
    }
}
