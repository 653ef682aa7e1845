//! Consumption of framed log entries from the replicated stream.
//!
//! The adapter peeks one frame at a time and only advances past a frame
//! once its entry was handled, so a handler can abort mid-poll (e.g. when
//! an append it triggers is flow controlled) and the frame is seen again
//! next tick.

use crate::messages::{decode, LogEntry};
use marlin_transport::{LogSubscription, SharedLogBuffer};

/// Outcome of handling one polled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    Continue,
    Abort,
}

#[derive(Default)]
pub struct LogAdapter {
    subscription: Option<LogSubscription>,
}

impl LogAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image the log stream from `buffer`, consuming from `position`.
    pub fn set_image(&mut self, buffer: SharedLogBuffer, position: u64) {
        let mut subscription = LogSubscription::new(buffer);
        subscription.set_position(position);
        self.subscription = Some(subscription);
    }

    pub fn has_image(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn disconnect(&mut self) {
        self.subscription = None;
    }

    pub fn position(&self) -> u64 {
        self.subscription
            .as_ref()
            .map(LogSubscription::position)
            .unwrap_or(0)
    }

    pub fn is_image_closed(&self) -> bool {
        self.subscription
            .as_ref()
            .map(LogSubscription::is_closed)
            .unwrap_or(true)
    }

    pub fn image_buffer(&self) -> Option<&SharedLogBuffer> {
        self.subscription.as_ref().map(LogSubscription::buffer)
    }

    /// Poll entries up to `limit_position`, at most `limit` frames.
    /// Undecodable frames are skipped (position still advances past them).
    /// Returns the number of frames consumed.
    pub fn poll(
        &mut self,
        limit_position: u64,
        limit: usize,
        mut handler: impl FnMut(u64, LogEntry) -> PollAction,
    ) -> usize {
        let Some(subscription) = self.subscription.as_mut() else {
            return 0;
        };

        let mut consumed = 0;
        while consumed < limit {
            let Some(frame) = subscription.peek(limit_position) else {
                break;
            };

            match decode::<LogEntry>(&frame.payload) {
                Ok(entry) => {
                    if handler(frame.end_position, entry) == PollAction::Abort {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(position = frame.end_position, %error, "skipping undecodable log frame");
                }
            }

            subscription.advance_to(frame.end_position);
            consumed += 1;
        }

        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::encode;
    use crate::types::{CorrelationId, LeadershipTermId};
    use bytes::Bytes;
    use marlin_transport::aligned_frame_length;

    fn timer_entry(correlation: i64) -> LogEntry {
        LogEntry::Timer {
            leadership_term_id: LeadershipTermId(0),
            correlation_id: CorrelationId(correlation),
            timestamp: 0,
        }
    }

    fn buffer_with_entries(entries: &[LogEntry]) -> (SharedLogBuffer, Vec<u64>) {
        let buffer = SharedLogBuffer::new(0, 1 << 20);
        let mut position = 0;
        let mut positions = Vec::new();
        for entry in entries {
            let payload: Bytes = encode(entry);
            position += aligned_frame_length(payload.len());
            buffer.append(position, payload);
            positions.push(position);
        }
        (buffer, positions)
    }

    #[test]
    fn poll_respects_position_limit() {
        let (buffer, positions) = buffer_with_entries(&[
            timer_entry(1),
            timer_entry(2),
            timer_entry(3),
        ]);

        let mut adapter = LogAdapter::new();
        adapter.set_image(buffer, 0);

        let mut seen = Vec::new();
        let consumed = adapter.poll(positions[1], 16, |_, entry| {
            seen.push(entry);
            PollAction::Continue
        });

        assert_eq!(consumed, 2);
        assert_eq!(adapter.position(), positions[1]);

        let consumed = adapter.poll(positions[2], 16, |_, _| PollAction::Continue);
        assert_eq!(consumed, 1);
        assert_eq!(adapter.position(), positions[2]);
    }

    #[test]
    fn abort_leaves_frame_for_next_poll() {
        let (buffer, positions) = buffer_with_entries(&[timer_entry(1), timer_entry(2)]);

        let mut adapter = LogAdapter::new();
        adapter.set_image(buffer, 0);

        let consumed = adapter.poll(positions[1], 16, |_, _| PollAction::Abort);
        assert_eq!(consumed, 0);
        assert_eq!(adapter.position(), 0);

        let consumed = adapter.poll(positions[1], 16, |_, _| PollAction::Continue);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn image_can_start_mid_stream() {
        let (buffer, positions) = buffer_with_entries(&[timer_entry(1), timer_entry(2)]);

        let mut adapter = LogAdapter::new();
        adapter.set_image(buffer, positions[0]);

        let mut seen = Vec::new();
        adapter.poll(positions[1], 16, |_, entry| {
            seen.push(entry);
            PollAction::Continue
        });
        assert_eq!(seen, vec![timer_entry(2)]);
    }
}
