//! Asynchronous, tagged, buffered point-to-point messaging over a
//! rank-addressed transport, with epoch-based collective flush/finish
//! synchronization implemented purely through unicast control messages.
//!
//! The crate is organized bottom-up:
//! - [`byte_buffer`]: lock-free append-only buffer with an explicit
//!   write/flush/read lifecycle.
//! - [`queue`]: a bounded blocking MPMC queue used to hand work between the
//!   engine's threads.
//! - [`pool`]: a fixed slab of [`byte_buffer::ByteBuffer`]s handed out by
//!   index.
//! - [`message`], [`send_buffers`], [`tag_state`]: the data model and
//!   per-tag bookkeeping.
//! - [`send_progress`], [`recv_progress`], [`dispatch`]: the three
//!   background engine threads.
//! - [`layer`]: the [`layer::CommunicationLayer`] façade applications use.
//! - [`transport`]: the transport contract this crate sits on top of, plus
//!   an in-process mock used by this crate's own tests.

pub mod backoff;
pub mod byte_buffer;
pub mod config;
pub mod dispatch;
pub mod error;
mod invariants;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod recv_progress;
pub mod send_buffers;
pub mod send_progress;
pub mod tag_state;
pub mod transport;

pub mod layer;

pub use config::Config;
pub use error::{CommError, CommResult};
pub use layer::CommunicationLayer;
pub use message::{Message, TaggedEpoch};
pub use metrics::{Metrics, MetricsSnapshot};
pub use tag_state::CONTROL_TAG;
pub use transport::Transport;
