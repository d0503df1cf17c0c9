use crate::message::Message;
use crate::metrics::Metrics;
use crate::queue::BoundedBlockingQueue;
use crate::tag_state::TagRegistry;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// A registered per-tag message handler: `(bytes, source_rank)`.
pub type Callback = Arc<dyn Fn(&[u8], i32) + Send + Sync>;

/// One of possibly several worker threads popping from the receive queue.
///
/// A panicking callback is caught and logged rather than allowed to unwind
/// the dispatch thread: per the crate's error-propagation policy, user
/// callback failures are terminal only for the message being dispatched.
pub struct CallbackDispatch {
    recv_queue: Arc<BoundedBlockingQueue<Message>>,
    callbacks: Arc<Mutex<HashMap<u32, Callback>>>,
    tag_registry: Arc<TagRegistry>,
    metrics: Arc<Metrics>,
}

impl CallbackDispatch {
    #[must_use]
    pub fn new(
        recv_queue: Arc<BoundedBlockingQueue<Message>>,
        callbacks: Arc<Mutex<HashMap<u32, Callback>>>,
        tag_registry: Arc<TagRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            recv_queue,
            callbacks,
            tag_registry,
            metrics,
        }
    }

    /// Runs until the receive queue is drained and push-disabled.
    pub fn run(&self) {
        while let Some(message) = self.recv_queue.wait_pop() {
            match message {
                Message::Data {
                    tag,
                    source_rank,
                    bytes,
                } => self.dispatch_data(tag, source_rank, &bytes),
                Message::Control { tagged_epoch } => {
                    if let Some(tag_state) = self.tag_registry.get(tagged_epoch.tag()) {
                        tag_state.notify_waiters();
                    }
                }
            }
        }
        tracing::debug!("CallbackDispatch thread exiting");
    }

    fn dispatch_data(&self, tag: u32, source_rank: i32, bytes: &[u8]) {
        let callback = {
            let guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            guard.get(&tag).cloned()
        };

        let Some(callback) = callback else {
            tracing::warn!(tag, "received data for a tag with no registered callback");
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| callback(bytes, source_rank)));
        if outcome.is_err() {
            tracing::error!(tag, source_rank, "callback panicked; dropping this message");
            self.metrics.add_dispatch_panics(1);
        }
    }
}
