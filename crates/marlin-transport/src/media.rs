//! String-addressed endpoint registry shared by every component in a
//! process (and by every simulated node in tests).
//!
//! Channels are named the way the production system names URIs, e.g.
//! `"node-0:member"` or a client's response channel. Either side may
//! create the endpoint; the other side finds it by name.

use crate::channel::{ChannelState, Publication, Subscription};
use crate::log_buffer::SharedLogBuffer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_LOG_WINDOW: u64 = 1 << 22;

struct MediaInner {
    channels: RwLock<HashMap<(String, i32), Arc<ChannelState>>>,
    log_buffers: RwLock<HashMap<(String, i32), SharedLogBuffer>>,
}

/// Shared endpoint namespace.
#[derive(Clone)]
pub struct Media {
    inner: Arc<MediaInner>,
}

impl Default for Media {
    fn default() -> Self {
        Self::new()
    }
}

impl Media {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MediaInner {
                channels: RwLock::new(HashMap::new()),
                log_buffers: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn channel_state(&self, channel: &str, stream_id: i32) -> Arc<ChannelState> {
        let key = (channel.to_string(), stream_id);
        let mut channels = self.inner.channels.write();
        channels
            .entry(key)
            .or_insert_with(|| ChannelState::new(DEFAULT_CHANNEL_CAPACITY))
            .clone()
    }

    /// Add a publication to a named channel. Connects once a subscription
    /// exists on the same (channel, stream) pair.
    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Publication {
        Publication::new(
            channel.to_string(),
            stream_id,
            self.channel_state(channel, stream_id),
        )
    }

    /// Attach the single consumer for a named channel.
    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Subscription {
        Subscription::new(
            channel.to_string(),
            stream_id,
            self.channel_state(channel, stream_id),
        )
    }

    /// The log-stream buffer registered under `channel`, created at
    /// position zero on first use.
    pub fn log_buffer(&self, channel: &str, stream_id: i32) -> SharedLogBuffer {
        let key = (channel.to_string(), stream_id);
        let mut buffers = self.inner.log_buffers.write();
        buffers
            .entry(key)
            .or_insert_with(|| SharedLogBuffer::new(0, DEFAULT_LOG_WINDOW))
            .clone()
    }

    /// Replace the buffer under `channel`, e.g. when a member re-images its
    /// log stream at a non-zero position after an election.
    pub fn register_log_buffer(&self, channel: &str, stream_id: i32, buffer: SharedLogBuffer) {
        self.inner
            .log_buffers
            .write()
            .insert((channel.to_string(), stream_id), buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn publication_finds_later_subscription() {
        let media = Media::new();
        let publication = media.add_publication("node-1:member", 100);
        assert!(!publication.is_connected());

        let subscription = media.add_subscription("node-1:member", 100);
        assert!(publication.is_connected());

        assert!(publication.try_offer(Bytes::from_static(b"hello")));
        let mut seen = Vec::new();
        subscription.poll(8, |frame| seen.push(frame));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn stream_ids_are_distinct_endpoints() {
        let media = Media::new();
        let _sub_a = media.add_subscription("node-1:member", 100);
        let publication = media.add_publication("node-1:member", 200);
        assert!(!publication.is_connected());
    }

    #[test]
    fn log_buffer_is_shared_by_name() {
        let media = Media::new();
        let writer_view = media.log_buffer("node-2:log", 3);
        let reader_view = media.log_buffer("node-2:log", 3);

        writer_view.append(64, Bytes::from_static(b"entry"));
        assert_eq!(reader_view.end_position(), 64);
    }
}
