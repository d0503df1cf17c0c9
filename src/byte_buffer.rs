use crate::backoff::Backoff;
use crate::invariants::{debug_assert_buffer_ordering, debug_assert_end_monotonic};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Sentinel stored in `end` meaning "not yet sealed".
const END_UNSEALED: usize = usize::MAX;

/// Outcome of a single [`ByteBuffer::append`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The payload was written; the buffer has room for more.
    Inserted,
    /// The payload was written exactly to capacity; the buffer is now
    /// sealed and nothing more fits.
    Full,
    /// The reservation straddled the capacity boundary: nothing was
    /// written, the buffer is now sealed, and the caller must retry this
    /// same payload against a fresh buffer.
    Overflow,
    /// The buffer was already sealed or blocked; nothing was written.
    Failed,
}

/// A fixed-capacity, append-only byte buffer with a lock-free reservation
/// protocol and an explicit block/flush/read lifecycle.
///
/// # Lifecycle
///
/// `Writable` → `Sealing` (blocked, writers still in flight) → `Readable`
/// (all in-flight writes drained) → `Released` (cleared, back in a pool,
/// blocked again until the next `unblock`).
///
/// # Memory ordering
///
/// `reserved` uses `AcqRel` fetch-add so concurrent reservations never
/// overlap. `written` is incremented with `Release` after a memcpy completes
/// and observed with `Acquire` by `is_reading`, so a coordinator thread that
/// sees `written == end` is guaranteed to see the completed writes. `end`
/// uses a compare-exchange loop to implement a monotonically-decreasing
/// "seal at the smallest observed cutoff" update, since both an overflowing
/// writer and a concurrent `block()` call may race to seal the buffer.
pub struct ByteBuffer {
    capacity: usize,
    // `reserved` and `written` are hammered by every concurrent `append`
    // call from distinct cache lines; `end` is written only by the seal
    // path. Padding each to its own cache line avoids false sharing between
    // them, the same concern a cache-aligned ring buffer pads its head/tail
    // positions for.
    reserved: CachePadded<AtomicUsize>,
    end: CachePadded<AtomicUsize>,
    written: CachePadded<AtomicUsize>,
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: all shared mutable access to `data` is mediated by the
// reserve-then-write protocol in `append`: each byte offset in `[0, capacity)`
// is written by at most one caller (the unique fetch_add winner for that
// range), and readers only observe bytes in `[0, written)` after an Acquire
// load that synchronizes with the Release store advancing `written`.
unsafe impl Send for ByteBuffer {}
unsafe impl Sync for ByteBuffer {}

impl ByteBuffer {
    /// Creates a new buffer with the given fixed capacity, in blocked state
    /// (matching a freshly constructed, not-yet-acquired pool buffer).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ByteBuffer capacity must be > 0");
        Self {
            capacity,
            reserved: CachePadded::new(AtomicUsize::new(capacity + 1)),
            end: CachePadded::new(AtomicUsize::new(0)),
            written: CachePadded::new(AtomicUsize::new(0)),
            data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        }
    }

    /// Returns the buffer's fixed capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Attempts to atomically reserve and write `data`.
    ///
    /// Returns [`AppendOutcome::Failed`] for a zero-length payload (boundary
    /// case: always rejected, the caller must treat this as invalid
    /// argument) or when the buffer is already sealed/blocked.
    pub fn append(&self, data: &[u8]) -> AppendOutcome {
        let n = data.len();
        if n == 0 {
            return AppendOutcome::Failed;
        }

        let reserved_before = self.reserved.fetch_add(n, Ordering::AcqRel);

        if reserved_before >= self.capacity {
            // Already sealed (naturally or via `block()`): no slot for us.
            return AppendOutcome::Failed;
        }

        if reserved_before + n <= self.capacity {
            // SAFETY: `[reserved_before, reserved_before + n)` was granted to
            // this call alone by the fetch_add above and lies within
            // `[0, capacity)`; no other caller can observe or write these
            // bytes until `written` advances past them.
            unsafe {
                let buf = &mut *self.data.get();
                buf[reserved_before..reserved_before + n].copy_from_slice(data);
            }
            self.written.fetch_add(n, Ordering::Release);

            if reserved_before + n == self.capacity {
                // Push `reserved` past `capacity`, the same sentinel
                // `block()` uses, so `is_reading`/`is_writing` agree this
                // buffer is sealed-and-drained rather than merely full:
                // nothing else can observe or land in `[reserved_before, n)`
                // again, so this store cannot race a later exact-fill.
                self.reserved.store(self.capacity + 1, Ordering::Release);
                self.seal_at(reserved_before + n);
                return AppendOutcome::Full;
            }
            AppendOutcome::Inserted
        } else {
            // This reservation straddles the boundary. Arithmetic guarantees
            // at most one caller can ever observe this case for a given
            // buffer, since `reserved` only ever increases. We do NOT write;
            // the caller must retry this payload against a fresh buffer.
            self.seal_at(reserved_before);
            self.wait_until_drained();
            AppendOutcome::Overflow
        }
    }

    /// Seals the buffer at `cutoff`, keeping the smallest cutoff ever
    /// observed (a concurrent `block()` may race to seal earlier).
    fn seal_at(&self, cutoff: usize) {
        let mut cur = self.end.load(Ordering::Acquire);
        while cutoff < cur {
            match self
                .end
                .compare_exchange_weak(cur, cutoff, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug_assert_end_monotonic!(cur, cutoff);
                    break;
                }
                Err(actual) => cur = actual,
            }
        }
        debug_assert_buffer_ordering!(self.written.load(Ordering::Relaxed), cutoff, self.capacity);
    }

    /// Spins until every writer that reserved a slot before the seal has
    /// finished its memcpy (`written == end`).
    fn wait_until_drained(&self) {
        let mut backoff = Backoff::new();
        while !self.is_reading() {
            backoff.snooze();
        }
    }

    /// Seals the buffer, blocking any further reservations.
    ///
    /// Called by the single coordinator thread (e.g. `SendBuffers` flushing
    /// a rank). May race with concurrent `append` calls; the seal cutoff is
    /// the smaller of the observed in-flight reservation count and any
    /// cutoff an overflowing writer already recorded.
    pub fn block(&self) {
        let r_old = self.reserved.swap(self.capacity + 1, Ordering::AcqRel);
        self.seal_at(r_old.min(self.capacity));
    }

    /// Reverses `block()`: restores `reserved` from `end` and unseals.
    ///
    /// Only meaningful once `end` holds a concrete cutoff (typically 0, via
    /// `clear()`), turning the buffer back into a fresh Writable buffer.
    pub fn unblock(&self) {
        let end_val = self.end.load(Ordering::Acquire);
        self.reserved.store(end_val, Ordering::Release);
        self.end.store(END_UNSEALED, Ordering::Release);
    }

    /// Resets a drained (`is_reading`) buffer's data positions, leaving it
    /// blocked. Pair with `unblock()` to make it Writable again.
    ///
    /// # Panics
    ///
    /// Panics (debug builds) if the buffer is not currently readable.
    pub fn clear(&self) {
        debug_assert!(
            self.is_reading(),
            "clear() called on a buffer that is not readable"
        );
        self.written.store(0, Ordering::Release);
        self.end.store(0, Ordering::Release);
    }

    /// Returns the number of bytes committed so far.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    /// Returns a slice over the bytes committed so far.
    ///
    /// Only safe to call once the buffer `is_reading()` (or, single-threaded,
    /// once all concurrent `append`s are known to have returned).
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let len = self.len();
        // SAFETY: bytes `[0, len)` were written by `append` calls that
        // completed their memcpy before advancing `written`, observed here
        // with Acquire ordering via `len()`.
        unsafe {
            let buf = &*self.data.get();
            &buf[..len]
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.written.load(Ordering::Relaxed) == 0
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.reserved.load(Ordering::Relaxed) >= self.capacity
    }

    #[inline]
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.reserved.load(Ordering::Relaxed) <= self.capacity
    }

    #[inline]
    #[must_use]
    pub fn is_reading(&self) -> bool {
        let end = self.end.load(Ordering::Acquire);
        end != END_UNSEALED
            && self.reserved.load(Ordering::Acquire) > self.capacity
            && self.written.load(Ordering::Acquire) == end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_below_capacity() {
        let buf = ByteBuffer::new(16);
        buf.unblock();
        assert_eq!(buf.append(b"hello"), AppendOutcome::Inserted);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn exact_fill_is_full_with_write() {
        let buf = ByteBuffer::new(5);
        buf.unblock();
        assert_eq!(buf.append(b"hello"), AppendOutcome::Full);
        assert!(buf.is_reading());
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn overflow_seals_without_writing_and_preserves_prior_data() {
        let buf = ByteBuffer::new(8);
        buf.unblock();
        assert_eq!(buf.append(b"hello"), AppendOutcome::Inserted);
        // 5 bytes written, 3 remain; a 4-byte append straddles the boundary.
        assert_eq!(buf.append(b"WXYZ"), AppendOutcome::Overflow);
        assert!(buf.is_reading());
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn zero_length_append_rejected() {
        let buf = ByteBuffer::new(8);
        buf.unblock();
        assert_eq!(buf.append(b""), AppendOutcome::Failed);
    }

    #[test]
    fn append_after_block_fails() {
        let buf = ByteBuffer::new(8);
        buf.unblock();
        let _ = buf.append(b"ab");
        buf.block();
        assert_eq!(buf.append(b"cd"), AppendOutcome::Failed);
    }

    #[test]
    fn exact_fill_clears_without_panicking() {
        let buf = ByteBuffer::new(5);
        buf.unblock();
        assert_eq!(buf.append(b"hello"), AppendOutcome::Full);
        assert!(buf.is_reading());
        buf.clear();
        assert!(!buf.is_reading());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn block_with_no_writes_seals_at_zero_and_is_immediately_reading() {
        let buf = ByteBuffer::new(8);
        buf.unblock();
        buf.block();
        assert!(buf.is_reading());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn clear_then_unblock_round_trip() {
        let buf = ByteBuffer::new(8);
        buf.unblock();
        let _ = buf.append(b"abcd");
        buf.block();
        assert!(buf.is_reading());
        buf.clear();
        buf.unblock();
        assert!(buf.is_writing());
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.append(b"fresh!!!"), AppendOutcome::Full);
    }

    #[test]
    fn concurrent_appends_partition_bytes_without_gaps_or_overlap() {
        use std::sync::Arc;
        use std::thread;

        let capacity = 8000usize;
        let buf = Arc::new(ByteBuffer::new(capacity));
        buf.unblock();

        let mut handles = Vec::new();
        for t in 0..8 {
            let buf = Arc::clone(&buf);
            handles.push(thread::spawn(move || {
                let payload = [t as u8; 8];
                let mut inserted = 0;
                for _ in 0..100 {
                    if buf.append(&payload) != AppendOutcome::Failed {
                        inserted += 1;
                    } else {
                        break;
                    }
                }
                inserted
            }));
        }
        let total_inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total_inserted * 8, buf.len());
        assert!(buf.len() <= capacity);
    }
}
