//! Debug assertion macros for the invariants documented in `SPEC_FULL.md`.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so there is zero
//! overhead in release builds. Used by [`crate::byte_buffer`],
//! [`crate::send_buffers`], and [`crate::recv_progress`].

// =============================================================================
// INV-BUF-01: Position Ordering
// =============================================================================

/// Assert `written <= end <= capacity` for a non-blocked buffer.
///
/// Used in: `ByteBuffer::append`, `ByteBuffer::block`.
macro_rules! debug_assert_buffer_ordering {
    ($written:expr, $end:expr, $capacity:expr) => {
        debug_assert!(
            $written <= $end && $end <= $capacity,
            "INV-BUF-01 violated: written {} end {} capacity {}",
            $written,
            $end,
            $capacity
        )
    };
}

// =============================================================================
// INV-BUF-02: No Reservation Past Block
// =============================================================================

/// Assert that once a buffer is blocked, its `end` never increases again.
macro_rules! debug_assert_end_monotonic {
    ($old_end:expr, $new_end:expr) => {
        debug_assert!(
            $new_end <= $old_end,
            "INV-BUF-02 violated: end grew from {} to {} after sealing",
            $old_end,
            $new_end
        )
    };
}

// =============================================================================
// INV-EPOCH-01: Monotonic Epoch
// =============================================================================

/// Assert that the epoch counter issued for a tag strictly increases.
macro_rules! debug_assert_epoch_monotonic {
    ($tag:expr, $old:expr, $new:expr) => {
        debug_assert!(
            $new > $old,
            "INV-EPOCH-01 violated: tag {} epoch went from {} to {}",
            $tag,
            $old,
            $new
        )
    };
}

// =============================================================================
// INV-EPOCH-02: Bounded Countdown
// =============================================================================

/// Assert a pending-epoch countdown never goes negative (checked via
/// pre-decrement value being nonzero).
macro_rules! debug_assert_countdown_positive {
    ($remaining:expr) => {
        debug_assert!(
            $remaining > 0,
            "INV-EPOCH-02 violated: decrementing an already-zero epoch countdown"
        )
    };
}

// =============================================================================
// INV-Q-01: FIFO Per Producer
// =============================================================================

/// Assert a per-producer consumption count is monotonic (FIFO sanity check).
macro_rules! debug_assert_fifo_count {
    ($owner:expr, $old_count:expr, $new_count:expr) => {
        debug_assert!(
            $new_count >= $old_count,
            "INV-Q-01 violated: {} consumption count went from {} to {}",
            $owner,
            $old_count,
            $new_count
        )
    };
}

pub(crate) use debug_assert_buffer_ordering;
pub(crate) use debug_assert_countdown_positive;
pub(crate) use debug_assert_end_monotonic;
pub(crate) use debug_assert_epoch_monotonic;
pub(crate) use debug_assert_fifo_count;
