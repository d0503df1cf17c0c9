use crate::backoff::Backoff;
use crate::message::{Message, TaggedEpoch};
use crate::metrics::Metrics;
use crate::queue::BoundedBlockingQueue;
use crate::tag_state::{TagRegistry, CONTROL_TAG};
use crate::transport::{RecvHandle, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The epoch that seeds and tracks the application-termination countdown.
/// `CONTROL_TAG`'s flush is only ever called once, by `finish_all`, so its
/// epoch counter deterministically yields 0 the one time it is used.
///
/// Shared with `send_progress`, which also needs to recognize this epoch
/// when it completes a self-addressed FOC locally instead of over the wire.
pub(crate) fn termination_epoch() -> TaggedEpoch {
    TaggedEpoch::new(CONTROL_TAG, 0)
}

/// The single thread that probes the transport, posts receives, reaps them,
/// and decodes control messages into epoch-countdown decrements.
pub struct RecvProgress {
    transport: Arc<dyn Transport>,
    recv_queue: Arc<BoundedBlockingQueue<Message>>,
    tag_registry: Arc<TagRegistry>,
    metrics: Arc<Metrics>,
    failed: Arc<AtomicBool>,
}

impl RecvProgress {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        recv_queue: Arc<BoundedBlockingQueue<Message>>,
        tag_registry: Arc<TagRegistry>,
        metrics: Arc<Metrics>,
        failed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            recv_queue,
            tag_registry,
            metrics,
            failed,
        }
    }

    /// Runs until the application-termination epoch has completed and no
    /// receives remain in flight.
    pub fn run(&self) {
        let mut in_flight: Vec<Box<dyn RecvHandle>> = Vec::new();
        let mut backoff = Backoff::new();
        let mut terminated = false;
        let termination_epoch = termination_epoch();

        loop {
            let mut did_work = false;

            if let Some(status) = self.transport.iprobe() {
                let handle = self
                    .transport
                    .irecv(status.size, status.source_rank, status.tag);
                in_flight.push(handle);
                did_work = true;
            }

            let mut i = 0;
            while i < in_flight.len() {
                if let Some(bytes) = in_flight[i].test() {
                    let source_rank = in_flight[i].source_rank();
                    let tag = in_flight[i].tag();
                    in_flight.swap_remove(i);
                    did_work = true;
                    if self.handle_received(tag, source_rank, bytes, termination_epoch) {
                        terminated = true;
                    }
                } else {
                    i += 1;
                }
            }

            if terminated && in_flight.is_empty() {
                break;
            }

            if did_work {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }

        tracing::debug!("RecvProgress thread exiting");
    }

    /// Processes one completed receive. Returns `true` iff it just observed
    /// the application-termination epoch complete.
    fn handle_received(
        &self,
        tag: u32,
        source_rank: i32,
        bytes: Vec<u8>,
        termination_epoch: TaggedEpoch,
    ) -> bool {
        if tag == CONTROL_TAG {
            return self.handle_control(bytes, termination_epoch);
        }

        let len = bytes.len() as u64;
        if self
            .recv_queue
            .wait_push(Message::Data {
                tag,
                source_rank,
                bytes,
            })
            .is_err()
        {
            self.mark_failed("data message could not be enqueued into a closed receive queue");
            return false;
        }
        self.metrics.add_messages_received(1);
        self.metrics.add_bytes_received(len);
        false
    }

    fn handle_control(&self, bytes: Vec<u8>, termination_epoch: TaggedEpoch) -> bool {
        let Ok(raw) = bytes.try_into() else {
            self.mark_failed("control message payload was not 8 bytes");
            return false;
        };
        let tagged_epoch = TaggedEpoch::from_u64(u64::from_be_bytes(raw));
        let controlled_tag = tagged_epoch.tag();

        let Some(tag_state) = self.tag_registry.get(controlled_tag) else {
            tracing::warn!(
                controlled_tag,
                "received FOC for an unregistered tag; dropping"
            );
            return false;
        };

        if !tag_state.on_control_received(tagged_epoch) {
            return false;
        }

        self.metrics.add_epochs_completed(1);
        let is_termination = tagged_epoch == termination_epoch;
        if self
            .recv_queue
            .wait_push(Message::Control { tagged_epoch })
            .is_err()
        {
            self.mark_failed("synthetic control message could not be enqueued");
            return is_termination;
        }
        if is_termination {
            self.recv_queue.disable_push();
        }
        is_termination
    }

    fn mark_failed(&self, reason: &str) {
        tracing::error!(reason, "RecvProgress encountered an unrecoverable condition");
        self.failed.store(true, Ordering::Release);
    }
}
