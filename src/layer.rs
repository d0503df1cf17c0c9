use crate::config::Config;
use crate::dispatch::{Callback, CallbackDispatch};
use crate::error::{CommError, CommResult};
use crate::message::{Message, TaggedEpoch};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::BoundedBlockingQueue;
use crate::recv_progress::RecvProgress;
use crate::send_buffers::SealedBuffer;
use crate::send_progress::{SendProgress, SendQueueItem};
use crate::tag_state::{TagRegistry, TagState, CONTROL_TAG};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

struct EngineThreads {
    send: JoinHandle<()>,
    recv: JoinHandle<()>,
    dispatch: Vec<JoinHandle<()>>,
}

/// Façade: registration, `send`, `flush`, `finish`, `finish_all`,
/// `init`/`finalize`. Owns the background threads; workers only hold
/// non-owning `Arc` handles into the shared queues, registry, and metrics.
///
/// A value type with an explicit lifecycle, so multiple independent
/// communicators can coexist in one process without touching global state.
pub struct CommunicationLayer {
    config: Config,
    transport: Arc<dyn Transport>,
    tag_registry: Arc<TagRegistry>,
    send_queue: Arc<BoundedBlockingQueue<SendQueueItem>>,
    recv_queue: Arc<BoundedBlockingQueue<Message>>,
    callbacks: Arc<Mutex<HashMap<u32, Callback>>>,
    metrics: Arc<Metrics>,
    failed: Arc<AtomicBool>,
    comm_size: usize,
    self_rank: i32,
    threads: Mutex<Option<EngineThreads>>,
    finalized: AtomicBool,
}

impl CommunicationLayer {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        let comm_size = transport.size() as usize;
        let self_rank = transport.rank();
        Self {
            send_queue: Arc::new(BoundedBlockingQueue::new(config.send_queue_capacity)),
            recv_queue: Arc::new(BoundedBlockingQueue::new(config.recv_queue_capacity)),
            config,
            transport,
            tag_registry: Arc::new(TagRegistry::new()),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(Metrics::new()),
            failed: Arc::new(AtomicBool::new(false)),
            comm_size,
            self_rank,
            threads: Mutex::new(None),
            finalized: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn comm_size(&self) -> i32 {
        self.comm_size as i32
    }

    #[must_use]
    pub fn comm_rank(&self) -> i32 {
        self.self_rank
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Registers the CONTROL tag, seeds the application-termination epoch
    /// countdown, and starts the send, receive, and dispatch threads.
    pub fn init(&self) {
        let control_state = self.ensure_tag_state(CONTROL_TAG);
        control_state.begin_epoch(TaggedEpoch::new(CONTROL_TAG, 0), self.comm_size as i32);

        let send_progress = SendProgress::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.send_queue),
            Arc::clone(&self.recv_queue),
            Arc::clone(&self.tag_registry),
            Arc::clone(&self.metrics),
            Arc::clone(&self.failed),
        );
        let recv_progress = RecvProgress::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.recv_queue),
            Arc::clone(&self.tag_registry),
            Arc::clone(&self.metrics),
            Arc::clone(&self.failed),
        );

        let send = std::thread::Builder::new()
            .name("epochcomm-send-progress".into())
            .spawn(move || send_progress.run())
            .expect("failed to spawn SendProgress thread");
        let recv = std::thread::Builder::new()
            .name("epochcomm-recv-progress".into())
            .spawn(move || recv_progress.run())
            .expect("failed to spawn RecvProgress thread");

        let mut dispatch = Vec::with_capacity(self.config.dispatch_threads);
        for idx in 0..self.config.dispatch_threads {
            let worker = CallbackDispatch::new(
                Arc::clone(&self.recv_queue),
                Arc::clone(&self.callbacks),
                Arc::clone(&self.tag_registry),
                Arc::clone(&self.metrics),
            );
            dispatch.push(
                std::thread::Builder::new()
                    .name(format!("epochcomm-dispatch-{idx}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn CallbackDispatch thread"),
            );
        }

        *self.threads.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(EngineThreads { send, recv, dispatch });
        tracing::info!(
            comm_size = self.comm_size,
            rank = self.self_rank,
            "communication layer initialized"
        );
    }

    /// Registers a callback for `tag`. `tag` must not be the reserved
    /// control tag and must not already be registered.
    pub fn register_callback<F>(&self, tag: u32, callback: F) -> CommResult<()>
    where
        F: Fn(&[u8], i32) + Send + Sync + 'static,
    {
        if tag == CONTROL_TAG {
            return Err(CommError::invalid_argument("tag 0 is reserved for control messages"));
        }
        {
            let mut guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            if guard.contains_key(&tag) {
                return Err(CommError::invalid_argument(format!(
                    "tag {tag} already has a registered callback"
                )));
            }
            guard.insert(tag, Arc::new(callback));
        }
        self.ensure_tag_state(tag);
        Ok(())
    }

    /// Appends `data` to the current buffer for `(tag, dst)`, pushing every
    /// buffer this call sealed (at most one, except when an overflowing
    /// reservation forces a retry that also fills its fresh buffer) onto
    /// the send queue.
    pub fn send(&self, data: &[u8], dst: i32, tag: u32) -> CommResult<()> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(CommError::invalid_state("send called after finalize"));
        }
        if tag == CONTROL_TAG {
            return Err(CommError::invalid_argument("tag 0 is reserved for control messages"));
        }
        if data.is_empty() {
            return Err(CommError::invalid_argument("zero-length payload"));
        }
        if data.len() > self.config.buffer_capacity {
            return Err(CommError::invalid_argument(format!(
                "payload of {} bytes exceeds buffer capacity {}",
                data.len(),
                self.config.buffer_capacity
            )));
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(CommError::transport_failure(
                "a background progress thread has already failed",
            ));
        }
        let Some(tag_state) = self.tag_registry.get(tag) else {
            return Err(CommError::invalid_argument(format!("tag {tag} is not registered")));
        };
        if tag_state.is_finished() {
            return Err(CommError::invalid_argument(format!("tag {tag} has been finished")));
        }

        for sealed in tag_state.send_buffers.append(data, dst as usize) {
            self.enqueue_sealed(tag, dst, sealed, &tag_state)?;
        }
        Ok(())
    }

    fn enqueue_sealed(
        &self,
        tag: u32,
        dst: i32,
        sealed: SealedBuffer,
        tag_state: &Arc<TagState>,
    ) -> CommResult<()> {
        self.send_queue
            .wait_push(SendQueueItem::Data {
                tag,
                dst,
                slab_index: sealed.slab_index,
                buffer: sealed.buffer,
                pool: Arc::clone(tag_state.send_buffers.pool()),
            })
            .map_err(|_| CommError::transport_failure("send queue closed before all buffers drained"))
    }

    /// Flushes every per-rank buffer for `tag` and blocks until every peer's
    /// matching FOC has arrived.
    pub fn flush(&self, tag: u32) -> CommResult<()> {
        if tag == CONTROL_TAG {
            return Err(CommError::invalid_argument("tag 0 is reserved for control messages"));
        }
        self.flush_internal(tag)
    }

    fn flush_internal(&self, tag: u32) -> CommResult<()> {
        let Some(tag_state) = self.tag_registry.get(tag) else {
            return Err(CommError::invalid_argument(format!("tag {tag} is not registered")));
        };

        for dst in 0..self.comm_size {
            if let Some(sealed) = tag_state.send_buffers.flush_rank(dst) {
                self.enqueue_sealed(tag, dst as i32, sealed, &tag_state)?;
            }
        }

        let epoch = tag_state.next_epoch();
        let tagged_epoch = TaggedEpoch::new(tag, epoch);
        tag_state.begin_epoch(tagged_epoch, self.comm_size as i32);

        // Round-robin starting at (self + 1) mod size, self last.
        for i in 0..self.comm_size {
            let target = (i + self.self_rank as usize + 1) % self.comm_size;
            self.send_queue
                .wait_push(SendQueueItem::Control {
                    dst: target as i32,
                    tagged_epoch,
                })
                .map_err(|_| CommError::transport_failure("send queue closed during flush"))?;
        }

        tag_state.wait_epoch(tagged_epoch);
        Ok(())
    }

    /// Marks `tag` finished (idempotent), then behaves as `flush(tag)`.
    pub fn finish(&self, tag: u32) -> CommResult<()> {
        if tag == CONTROL_TAG {
            return Err(CommError::invalid_argument("tag 0 is reserved for control messages"));
        }
        let Some(tag_state) = self.tag_registry.get(tag) else {
            return Err(CommError::invalid_argument(format!("tag {tag} is not registered")));
        };
        tag_state.mark_finished();
        self.flush_internal(tag)
    }

    /// Finishes every registered application tag, then flushes the control
    /// tag with a single final epoch and disables further sends.
    pub fn finish_all(&self) -> CommResult<()> {
        for tag in self.tag_registry.application_tags() {
            self.finish(tag)?;
        }
        self.flush_internal(CONTROL_TAG)?;
        self.send_queue.disable_push();
        Ok(())
    }

    /// Runs `finish_all`, marks the layer finalized, and joins every
    /// background thread.
    pub fn finalize(&self) -> CommResult<()> {
        self.finish_all()?;
        self.finalized.store(true, Ordering::Release);

        if let Some(threads) = self.threads.lock().unwrap_or_else(|e| e.into_inner()).take() {
            threads
                .send
                .join()
                .expect("SendProgress thread panicked");
            threads
                .recv
                .join()
                .expect("RecvProgress thread panicked");
            for handle in threads.dispatch {
                handle.join().expect("CallbackDispatch thread panicked");
            }
        }
        tracing::info!(rank = self.self_rank, "communication layer finalized");
        Ok(())
    }

    fn ensure_tag_state(&self, tag: u32) -> Arc<TagState> {
        if let Some(existing) = self.tag_registry.get(tag) {
            return existing;
        }
        let created = Arc::new(TagState::new(tag, self.comm_size, &self.config));
        if self.tag_registry.insert_new(tag, Arc::clone(&created)) {
            created
        } else {
            // Lost the race to register; use whichever entry won.
            self.tag_registry
                .get(tag)
                .expect("tag was just observed present")
        }
    }
}
