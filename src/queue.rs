use crate::error::{CommError, CommResult};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Lifecycle of a [`BoundedBlockingQueue`].
///
/// `Open` accepts pushes and pops. `disable_push` moves it to
/// `PushDisabled`, after which no further item is ever accepted; existing
/// items may still be popped. Once a `PushDisabled` queue's backlog is
/// empty it is `Drained`: `wait_pop` returns `None` forever after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    PushDisabled,
}

struct Inner<T> {
    deque: VecDeque<T>,
    state: QueueState,
}

/// A fixed-capacity MPMC queue with true blocking semantics.
///
/// Unlike the lock-free ring buffers elsewhere in this crate, producers and
/// consumers here (`SendProgress`/`RecvProgress` handing work to
/// `CallbackDispatch`, and producer threads handing sends to `SendProgress`)
/// need to actually park when the queue is full or empty rather than spin or
/// return `None`, so this is a plain `Mutex<VecDeque<T>>` guarded by a pair
/// of `Condvar`s.
pub struct BoundedBlockingQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedBlockingQueue<T> {
    /// Creates a new queue bounded at `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedBlockingQueue capacity must be > 0");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                deque: VecDeque::with_capacity(capacity),
                state: QueueState::Open,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes `item` without blocking.
    ///
    /// Returns `Ok(true)` if pushed, `Ok(false)` if the queue is full, and
    /// `Err(CommError::QueueClosed)` if push has been disabled.
    pub fn try_push(&self, item: T) -> CommResult<bool> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.state == QueueState::PushDisabled {
            return Err(CommError::QueueClosed);
        }
        if guard.deque.len() >= self.capacity {
            return Ok(false);
        }
        guard.deque.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
        Ok(true)
    }

    /// Pushes `item`, blocking until there is room or push is disabled.
    pub fn wait_push(&self, item: T) -> CommResult<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if guard.state == QueueState::PushDisabled {
                return Err(CommError::QueueClosed);
            }
            if guard.deque.len() < self.capacity {
                guard.deque.push_back(item);
                drop(guard);
                self.not_empty.notify_one();
                return Ok(());
            }
            guard = self
                .not_full
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Pops the oldest item without blocking.
    ///
    /// Returns `None` both when the queue is merely empty-but-open and when
    /// it is fully drained; callers that need to distinguish the two should
    /// also check [`Self::is_drained`].
    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let item = guard.deque.pop_front();
        drop(guard);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pops the oldest item, blocking until one is available.
    ///
    /// Returns `None` once the queue is drained: push disabled and empty.
    pub fn wait_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = guard.deque.pop_front() {
                drop(guard);
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.state == QueueState::PushDisabled {
                return None;
            }
            guard = self
                .not_empty
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Permanently disables further pushes and wakes every waiter.
    ///
    /// Idempotent: calling this more than once is a no-op.
    pub fn disable_push(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.state = QueueState::PushDisabled;
        drop(guard);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// True if a non-blocking push could currently succeed.
    #[must_use]
    pub fn can_push(&self) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.state == QueueState::Open && guard.deque.len() < self.capacity
    }

    /// True if a non-blocking pop would currently return an item.
    #[must_use]
    pub fn can_pop(&self) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !guard.deque.is_empty()
    }

    /// True once push is disabled and the backlog has fully drained.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.state == QueueState::PushDisabled && guard.deque.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_then_pop_fifo() {
        let q = BoundedBlockingQueue::new(4);
        assert_eq!(q.try_push(1).unwrap(), true);
        assert_eq!(q.try_push(2).unwrap(), true);
        assert_eq!(q.wait_pop(), Some(1));
        assert_eq!(q.wait_pop(), Some(2));
    }

    #[test]
    fn try_push_reports_full() {
        let q = BoundedBlockingQueue::new(1);
        assert_eq!(q.try_push(1).unwrap(), true);
        assert_eq!(q.try_push(2).unwrap(), false);
    }

    #[test]
    fn disable_push_drains_then_returns_none() {
        let q: BoundedBlockingQueue<i32> = BoundedBlockingQueue::new(4);
        q.try_push(7).unwrap();
        q.disable_push();
        assert_eq!(q.try_push(8).unwrap_err().to_string(), "queue closed");
        assert_eq!(q.wait_pop(), Some(7));
        assert!(q.is_drained());
        assert_eq!(q.wait_pop(), None);
    }

    #[test]
    fn wait_pop_blocks_until_pushed() {
        let q = Arc::new(BoundedBlockingQueue::new(4));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.wait_pop());

        thread::sleep(Duration::from_millis(20));
        q.try_push(42).unwrap();
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn wait_push_blocks_until_room() {
        let q = Arc::new(BoundedBlockingQueue::new(1));
        q.try_push(1).unwrap();

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.wait_push(2));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.wait_pop(), Some(1));
        handle.join().unwrap().unwrap();
        assert_eq!(q.wait_pop(), Some(2));
    }
}
