use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for monitoring a communication layer's activity.
///
/// Mirrors the "plain counters, atomics only where concurrently mutated"
/// split used elsewhere in the crate: every field here is genuinely written
/// from more than one thread, so every field is an `AtomicU64`.
#[derive(Debug, Default)]
pub struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    buffers_flushed: AtomicU64,
    epochs_completed: AtomicU64,
    dispatch_panics: AtomicU64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_messages_sent(&self, n: u64) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_messages_received(&self, n: u64) {
        self.messages_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_buffers_flushed(&self, n: u64) {
        self.buffers_flushed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_epochs_completed(&self, n: u64) {
        self.epochs_completed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dispatch_panics(&self, n: u64) {
        self.dispatch_panics.fetch_add(n, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            buffers_flushed: self.buffers_flushed.load(Ordering::Relaxed),
            epochs_completed: self.epochs_completed.load(Ordering::Relaxed),
            dispatch_panics: self.dispatch_panics.load(Ordering::Relaxed),
        }
    }
}

/// A plain-data copy of [`Metrics`] at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub buffers_flushed: u64,
    pub epochs_completed: u64,
    pub dispatch_panics: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_additions() {
        let m = Metrics::new();
        m.add_messages_sent(3);
        m.add_bytes_sent(24);
        m.add_epochs_completed(1);

        let snap = m.snapshot();
        assert_eq!(snap.messages_sent, 3);
        assert_eq!(snap.bytes_sent, 24);
        assert_eq!(snap.epochs_completed, 1);
        assert_eq!(snap.messages_received, 0);
    }
}
