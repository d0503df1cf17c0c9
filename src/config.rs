/// Configuration for a [`crate::layer::CommunicationLayer`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Capacity in bytes of each `ByteBuffer` used for batching.
    pub buffer_capacity: usize,
    /// Number of buffers pre-allocated per tag in its [`crate::pool::BufferPool`].
    pub pool_size: usize,
    /// Number of `CallbackDispatch` worker threads.
    pub dispatch_threads: usize,
    /// Bound on the send-progress queue.
    pub send_queue_capacity: usize,
    /// Bound on the receive-progress queue.
    pub recv_queue_capacity: usize,
    /// Enable atomic-counter metrics collection (slight overhead).
    pub enable_metrics: bool,
}

impl Config {
    /// Creates a new configuration with custom settings.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_capacity` is 0, if `pool_size` is 0, or if
    /// `dispatch_threads` is 0.
    #[must_use]
    pub const fn new(
        buffer_capacity: usize,
        pool_size: usize,
        dispatch_threads: usize,
        send_queue_capacity: usize,
        recv_queue_capacity: usize,
        enable_metrics: bool,
    ) -> Self {
        assert!(buffer_capacity > 0, "buffer_capacity must be > 0");
        assert!(pool_size > 0, "pool_size must be > 0");
        assert!(dispatch_threads > 0, "dispatch_threads must be > 0");
        assert!(send_queue_capacity > 0, "send_queue_capacity must be > 0");
        assert!(recv_queue_capacity > 0, "recv_queue_capacity must be > 0");

        Self {
            buffer_capacity,
            pool_size,
            dispatch_threads,
            send_queue_capacity,
            recv_queue_capacity,
            enable_metrics,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_capacity: 8192,
            pool_size: 4,
            dispatch_threads: 1,
            send_queue_capacity: 1024,
            recv_queue_capacity: 1024,
            enable_metrics: false,
        }
    }
}

/// Favors small buffers and prompt sends over throughput.
pub const LOW_LATENCY_CONFIG: Config = Config::new(1024, 4, 1, 256, 256, false);

/// Favors large buffers and deep queues over per-message latency.
pub const BULK_TRANSFER_CONFIG: Config = Config::new(1 << 20, 8, 4, 4096, 4096, false);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(c.buffer_capacity > 0);
        assert!(c.pool_size > 0);
        assert!(c.dispatch_threads > 0);
    }

    #[test]
    fn presets_construct() {
        assert_eq!(LOW_LATENCY_CONFIG.buffer_capacity, 1024);
        assert_eq!(BULK_TRANSFER_CONFIG.buffer_capacity, 1 << 20);
    }

    #[test]
    #[should_panic(expected = "buffer_capacity must be > 0")]
    fn rejects_zero_capacity() {
        let _ = Config::new(0, 1, 1, 1, 1, false);
    }
}
