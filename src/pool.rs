use crate::byte_buffer::ByteBuffer;
use crate::queue::BoundedBlockingQueue;
use std::sync::Arc;

/// A fixed-size pool of [`ByteBuffer`]s, handed out by slab index.
///
/// The slab (`buffers`) never grows or shrinks after construction, so a
/// buffer's identity is simply its index: there is no generation counter to
/// keep in sync and no way for a stale index to alias a different logical
/// buffer, which is what a fixed slab buys over, say, recycling buffers
/// through a freelist of raw pointers.
pub struct BufferPool {
    buffers: Vec<Arc<ByteBuffer>>,
    free: BoundedBlockingQueue<usize>,
}

impl BufferPool {
    /// Creates a pool of `pool_size` buffers, each `buffer_capacity` bytes.
    ///
    /// Every buffer starts released (readable, empty): `ByteBuffer::new`
    /// constructs buffers already blocked with `end == written == 0`, which
    /// is exactly the released state `release()` produces, so the whole
    /// slab is immediately available to `acquire()`.
    #[must_use]
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Self {
        let buffers: Vec<Arc<ByteBuffer>> = (0..pool_size)
            .map(|_| Arc::new(ByteBuffer::new(buffer_capacity)))
            .collect();
        let free = BoundedBlockingQueue::new(pool_size);
        for idx in 0..pool_size {
            free.try_push(idx)
                .expect("freshly constructed pool queue cannot be closed or full");
        }
        Self { buffers, free }
    }

    /// Blocks until a buffer is available, unblocks it for writing, and
    /// returns its slab index together with a handle to it.
    #[must_use]
    pub fn acquire(&self) -> (usize, Arc<ByteBuffer>) {
        let idx = self
            .free
            .wait_pop()
            .expect("buffer pool free-list is never closed");
        let buf = Arc::clone(&self.buffers[idx]);
        buf.unblock();
        (idx, buf)
    }

    /// Returns a drained (`is_reading`) buffer to the pool by slab index.
    ///
    /// # Panics
    ///
    /// Panics (debug builds, via `ByteBuffer::clear`) if the buffer has not
    /// been sealed and drained first.
    pub fn release(&self, idx: usize) {
        self.buffers[idx].clear();
        self.free
            .wait_push(idx)
            .expect("pool free-list capacity equals slab size, so this never blocks or fails");
    }

    /// Returns a handle to the buffer at `idx` without touching ownership.
    #[must_use]
    pub fn buffer(&self, idx: usize) -> &Arc<ByteBuffer> {
        &self.buffers[idx]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}
