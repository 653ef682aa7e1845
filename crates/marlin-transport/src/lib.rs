//! marlin-transport: in-process reliable ordered byte streams.
//!
//! Models the messaging driver the consensus module is built against:
//! - message channels (`Publication`/`Subscription`) carrying framed
//!   payloads with capacity-based flow control,
//! - the replicated log stream (`LogPublication`/`LogSubscription`) with
//!   absolute byte positions and dynamic per-follower destinations,
//! - a string-addressed [`Media`] registry that stands in for the driver's
//!   endpoint namespace, so components connect by channel name the way the
//!   production system connects by URI,
//! - an [`IdleStrategy`] for the agent's bounded internal busy-waits.
//!
//! Everything here is non-blocking: offers fail fast when back-pressured
//! and polls return what is immediately available.

pub mod channel;
pub mod idle;
pub mod log_buffer;
pub mod media;

pub use channel::{Publication, Subscription};
pub use idle::IdleStrategy;
pub use log_buffer::{
    aligned_frame_length, LogFrame, LogPublication, LogSubscription, SharedLogBuffer,
    FRAME_ALIGNMENT, FRAME_HEADER_LENGTH,
};
pub use media::Media;
