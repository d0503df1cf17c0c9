use crate::backoff::Backoff;
use crate::message::{Message, TaggedEpoch};
use crate::metrics::Metrics;
use crate::pool::BufferPool;
use crate::queue::BoundedBlockingQueue;
use crate::recv_progress::termination_epoch;
use crate::tag_state::{TagRegistry, CONTROL_TAG};
use crate::transport::{SendHandle, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum items drained from the send queue per loop iteration, bounding
/// how long one pass can run before reaping completions and checking for
/// termination.
const DRAIN_BATCH: usize = 64;

/// An item handed to `SendProgress` once a buffer has been sealed (or a
/// flush/finish epoch needs to announce itself to a peer).
pub enum SendQueueItem {
    Data {
        tag: u32,
        dst: i32,
        slab_index: usize,
        buffer: Arc<crate::byte_buffer::ByteBuffer>,
        pool: Arc<BufferPool>,
    },
    Control {
        dst: i32,
        tagged_epoch: TaggedEpoch,
    },
}

struct InFlightSend {
    slab_index: usize,
    pool: Arc<BufferPool>,
    handle: Box<dyn SendHandle>,
}

/// The single thread that drains the send queue and drives non-blocking
/// sends to completion.
///
/// Probes the transport for completions, drains queued sends, and reaps
/// finished in-flight sends in one pass, backing off adaptively when a pass
/// finds no work.
pub struct SendProgress {
    transport: Arc<dyn Transport>,
    send_queue: Arc<BoundedBlockingQueue<SendQueueItem>>,
    recv_queue: Arc<BoundedBlockingQueue<Message>>,
    tag_registry: Arc<TagRegistry>,
    metrics: Arc<Metrics>,
    failed: Arc<AtomicBool>,
    self_rank: i32,
}

impl SendProgress {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        send_queue: Arc<BoundedBlockingQueue<SendQueueItem>>,
        recv_queue: Arc<BoundedBlockingQueue<Message>>,
        tag_registry: Arc<TagRegistry>,
        metrics: Arc<Metrics>,
        failed: Arc<AtomicBool>,
    ) -> Self {
        let self_rank = transport.rank();
        Self {
            transport,
            send_queue,
            recv_queue,
            tag_registry,
            metrics,
            failed,
            self_rank,
        }
    }

    /// Runs until the send queue is drained and push-disabled and no sends
    /// remain in flight. Intended to be the body of its own OS thread.
    pub fn run(&self) {
        let mut in_flight: Vec<InFlightSend> = Vec::new();
        let mut backoff = Backoff::new();

        loop {
            let mut did_work = false;

            for _ in 0..DRAIN_BATCH {
                match self.send_queue.try_pop() {
                    Some(item) => {
                        did_work = true;
                        self.dispatch_item(item, &mut in_flight);
                    }
                    None => break,
                }
            }

            did_work |= self.reap_completions(&mut in_flight);

            if self.send_queue.is_drained() && in_flight.is_empty() {
                break;
            }

            if did_work {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }

        tracing::debug!("SendProgress thread exiting");
    }

    fn dispatch_item(&self, item: SendQueueItem, in_flight: &mut Vec<InFlightSend>) {
        match item {
            SendQueueItem::Data {
                tag,
                dst,
                slab_index,
                buffer,
                pool,
            } => {
                let bytes = buffer.as_slice().to_vec();
                if dst == self.self_rank {
                    pool.release(slab_index);
                    let len = bytes.len() as u64;
                    if self
                        .recv_queue
                        .wait_push(Message::Data {
                            tag,
                            source_rank: self.self_rank,
                            bytes,
                        })
                        .is_err()
                    {
                        self.mark_failed("local loopback into a closed receive queue");
                        return;
                    }
                    self.metrics.add_messages_sent(1);
                    self.metrics.add_bytes_sent(len);
                } else {
                    let len = bytes.len() as u64;
                    let handle = self.transport.isend(bytes, dst, tag);
                    in_flight.push(InFlightSend {
                        slab_index,
                        pool,
                        handle,
                    });
                    self.metrics.add_messages_sent(1);
                    self.metrics.add_bytes_sent(len);
                }
            }
            SendQueueItem::Control { dst, tagged_epoch } => {
                if dst == self.self_rank {
                    self.complete_self_control(tagged_epoch);
                } else {
                    let payload = tagged_epoch.as_u64().to_be_bytes();
                    self.transport.bsend(&payload, dst, CONTROL_TAG);
                }
            }
        }
    }

    /// Drives a self-addressed FOC straight through the epoch countdown
    /// instead of bouncing it through the transport: a FOC to `self` never
    /// leaves this rank, so it must decrement `TagState`'s countdown here,
    /// the same way `RecvProgress::handle_control` does for FOCs that
    /// actually arrive over the wire.
    fn complete_self_control(&self, tagged_epoch: TaggedEpoch) {
        let Some(tag_state) = self.tag_registry.get(tagged_epoch.tag()) else {
            tracing::warn!(
                controlled_tag = tagged_epoch.tag(),
                "self-addressed FOC for an unregistered tag; dropping"
            );
            return;
        };

        if !tag_state.on_control_received(tagged_epoch) {
            return;
        }

        self.metrics.add_epochs_completed(1);
        let is_termination = tagged_epoch == termination_epoch();
        if self
            .recv_queue
            .wait_push(Message::Control { tagged_epoch })
            .is_err()
        {
            self.mark_failed("self-addressed control completion could not be enqueued");
            return;
        }
        if is_termination {
            self.recv_queue.disable_push();
        }
    }

    fn reap_completions(&self, in_flight: &mut Vec<InFlightSend>) -> bool {
        let before = in_flight.len();
        let mut still_pending = Vec::with_capacity(in_flight.len());
        for mut pending in in_flight.drain(..) {
            if pending.handle.test() {
                pending.pool.release(pending.slab_index);
                self.metrics.add_buffers_flushed(1);
            } else {
                still_pending.push(pending);
            }
        }
        *in_flight = still_pending;
        in_flight.len() != before
    }

    fn mark_failed(&self, reason: &str) {
        tracing::error!(reason, "SendProgress encountered an unrecoverable condition");
        self.failed.store(true, Ordering::Release);
    }
}
