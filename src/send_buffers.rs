use crate::byte_buffer::{AppendOutcome, ByteBuffer};
use crate::pool::BufferPool;
use std::sync::{Arc, Mutex};

/// A buffer that has been sealed and drained, ready to be handed to
/// `SendProgress` for transmission.
pub struct SealedBuffer {
    pub slab_index: usize,
    pub buffer: Arc<ByteBuffer>,
}

/// Per-destination-rank current-buffer bookkeeping for one tag.
///
/// Each rank has one "current" buffer slot. Producers append into whatever
/// buffer is current for their destination; when a buffer fills, the first
/// appender to observe that swaps in a freshly acquired buffer (under the
/// slot's mutex) and hands the sealed one back to the caller. This
/// generalizes a per-producer ring decomposition (one ring per producer id)
/// to one buffer-in-flight per destination rank instead.
pub struct SendBuffers {
    pool: Arc<BufferPool>,
    slots: Vec<Mutex<CurrentSlot>>,
}

struct CurrentSlot {
    slab_index: usize,
    buffer: Arc<ByteBuffer>,
}

impl SendBuffers {
    #[must_use]
    pub fn new(pool: Arc<BufferPool>, comm_size: usize) -> Self {
        let slots = (0..comm_size)
            .map(|_| {
                let (slab_index, buffer) = pool.acquire();
                Mutex::new(CurrentSlot {
                    slab_index,
                    buffer,
                })
            })
            .collect();
        Self { pool, slots }
    }

    /// Appends `data` for destination `dst`, swapping in a fresh buffer
    /// whenever one fills and returning every buffer sealed along the way.
    ///
    /// An overflowing reservation (the payload straddled the boundary) is
    /// not written at all; this retries the same payload against the newly
    /// swapped-in buffer rather than dropping it. Losers of the fill race
    /// (appends that land in a blocked buffer after a sibling thread already
    /// swapped it) simply retry against the new current buffer too.
    #[must_use]
    pub fn append(&self, data: &[u8], dst: usize) -> Vec<SealedBuffer> {
        let mut sealed_buffers = Vec::new();
        loop {
            let current = {
                let guard = self.slots[dst].lock().unwrap_or_else(|e| e.into_inner());
                Arc::clone(&guard.buffer)
            };

            match current.append(data) {
                AppendOutcome::Inserted => return sealed_buffers,
                AppendOutcome::Full => {
                    if let Some(sealed) = self.swap_slot(dst, &current) {
                        sealed_buffers.push(sealed);
                    }
                    return sealed_buffers;
                }
                AppendOutcome::Overflow => {
                    if let Some(sealed) = self.swap_slot(dst, &current) {
                        sealed_buffers.push(sealed);
                    }
                    // Payload wasn't written; retry it against the fresh
                    // buffer the swap just installed.
                }
                AppendOutcome::Failed => {
                    // The slot was already swapped out from under us by a
                    // sibling append; retry against whatever is current now.
                }
            }
        }
    }

    /// Swaps the destination's current buffer for a fresh one, returning
    /// the old buffer sealed for transmission iff this call is the one that
    /// performed the swap (guards against two callers both landing `Full`
    /// for the same already-swapped slot).
    fn swap_slot(&self, dst: usize, observed: &Arc<ByteBuffer>) -> Option<SealedBuffer> {
        let mut guard = self.slots[dst].lock().unwrap_or_else(|e| e.into_inner());
        if !Arc::ptr_eq(&guard.buffer, observed) {
            // Someone else already swapped this slot.
            return None;
        }
        let old_index = guard.slab_index;
        let old_buffer = Arc::clone(&guard.buffer);
        let (new_index, new_buffer) = self.pool.acquire();
        guard.slab_index = new_index;
        guard.buffer = new_buffer;
        drop(guard);
        Some(SealedBuffer {
            slab_index: old_index,
            buffer: old_buffer,
        })
    }

    /// Forces a flush of `dst`'s current buffer regardless of fill level.
    /// Returns `None` if the current buffer is empty (nothing to send).
    #[must_use]
    pub fn flush_rank(&self, dst: usize) -> Option<SealedBuffer> {
        let mut guard = self.slots[dst].lock().unwrap_or_else(|e| e.into_inner());
        if guard.buffer.is_empty() {
            return None;
        }
        let old_index = guard.slab_index;
        let old_buffer = Arc::clone(&guard.buffer);
        old_buffer.block();

        let (new_index, new_buffer) = self.pool.acquire();
        guard.slab_index = new_index;
        guard.buffer = new_buffer;
        drop(guard);

        Some(SealedBuffer {
            slab_index: old_index,
            buffer: old_buffer,
        })
    }

    #[must_use]
    pub fn comm_size(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}
