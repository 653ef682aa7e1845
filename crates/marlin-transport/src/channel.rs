//! Message channels: cloneable publications, single-consumer subscriptions.
//!
//! A channel is an ordered queue of opaque frames. Offers are non-blocking
//! and fail when the queue is at capacity or no subscriber is attached,
//! which is the back-pressure signal publishers retry on.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct ChannelState {
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    /// Epoch of the live subscriber; 0 means none. A later subscriber on
    /// the same channel supersedes an earlier one, and a superseded
    /// subscription closing cannot detach its successor.
    active_subscriber: AtomicU64,
    next_epoch: AtomicU64,
}

impl ChannelState {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            active_subscriber: AtomicU64::new(0),
            next_epoch: AtomicU64::new(1),
        })
    }

    pub(crate) fn attach_subscriber(&self) -> u64 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::AcqRel);
        self.active_subscriber.store(epoch, Ordering::Release);
        epoch
    }

    fn has_subscriber(&self) -> bool {
        self.active_subscriber.load(Ordering::Acquire) != 0
    }
}

/// Sending side of a channel. Cloneable; many publications may feed one
/// subscription.
#[derive(Clone, Debug)]
pub struct Publication {
    channel: String,
    stream_id: i32,
    state: Arc<ChannelState>,
}

impl Publication {
    pub(crate) fn new(channel: String, stream_id: i32, state: Arc<ChannelState>) -> Self {
        Self {
            channel,
            stream_id,
            state,
        }
    }

    /// Offer a frame. Returns false when the channel is closed, has no
    /// subscriber, or is at capacity; the caller retries on a later tick.
    pub fn try_offer(&self, frame: Bytes) -> bool {
        if !self.is_connected() {
            return false;
        }

        let mut queue = self.state.queue.lock();
        if queue.len() >= self.state.capacity {
            return false;
        }

        queue.push_back(frame);
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state.has_subscriber()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }
}

/// Receiving side of a channel. Single consumer; a newer subscription on
/// the same channel supersedes this one.
pub struct Subscription {
    channel: String,
    stream_id: i32,
    state: Arc<ChannelState>,
    epoch: u64,
}

impl Subscription {
    pub(crate) fn new(channel: String, stream_id: i32, state: Arc<ChannelState>) -> Self {
        let epoch = state.attach_subscriber();
        Self {
            channel,
            stream_id,
            state,
            epoch,
        }
    }

    fn is_active(&self) -> bool {
        self.state.active_subscriber.load(Ordering::Acquire) == self.epoch
    }

    /// Poll up to `limit` frames into `handler`. Returns the count consumed.
    pub fn poll(&self, limit: usize, mut handler: impl FnMut(Bytes)) -> usize {
        if !self.is_active() {
            return 0;
        }

        let mut consumed = 0;
        while consumed < limit {
            let frame = {
                let mut queue = self.state.queue.lock();
                queue.pop_front()
            };
            match frame {
                Some(frame) => {
                    handler(frame);
                    consumed += 1;
                }
                None => break,
            }
        }

        consumed
    }

    /// Take the next frame without committing to consume the rest of the
    /// backlog. Pair with [`Subscription::return_to_head`] to abort.
    pub fn next_frame(&self) -> Option<Bytes> {
        if !self.is_active() {
            return None;
        }
        self.state.queue.lock().pop_front()
    }

    /// Put an unconsumed frame back at the head after an aborted poll.
    pub fn return_to_head(&self, frame: Bytes) {
        self.state.queue.lock().push_front(frame);
    }

    pub fn is_closed(&self) -> bool {
        !self.is_active()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Detach this consumer; publications observe the disconnect unless a
    /// newer subscription has already taken over the channel.
    pub fn close(&self) {
        if self
            .state
            .active_subscriber
            .compare_exchange(self.epoch, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.state.queue.lock().clear();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
