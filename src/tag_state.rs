use crate::config::Config;
use crate::invariants::{debug_assert_countdown_positive, debug_assert_epoch_monotonic};
use crate::message::TaggedEpoch;
use crate::pool::BufferPool;
use crate::send_buffers::SendBuffers;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Reserved tag for Flush-Or-Close control messages; all application tags
/// are strictly greater than this.
pub const CONTROL_TAG: u32 = 0;

struct PendingEpochs {
    /// Remaining FOC countdown per in-flight epoch of this tag.
    remaining: HashMap<TaggedEpoch, i32>,
}

/// Per-tag state: epoch counter, finished flag, the condition variable
/// flush/finish/finish_all wait on, and the tag's buffers.
///
/// The epoch-pending countdown lives here (keyed by `TaggedEpoch`, which
/// embeds the tag) rather than in one crate-wide map, since every
/// `TaggedEpoch` belongs to exactly one tag and the design notes require
/// waiters to observe the pending predicate under the *same* mutex the
/// completing notification is sent under.
pub struct TagState {
    pub tag: u32,
    next_epoch: AtomicU32,
    finished: AtomicBool,
    pending: Mutex<PendingEpochs>,
    completed: Condvar,
    pub send_buffers: SendBuffers,
}

impl TagState {
    #[must_use]
    pub fn new(tag: u32, comm_size: usize, config: &Config) -> Self {
        let pool = Arc::new(BufferPool::new(config.pool_size, config.buffer_capacity));
        Self {
            tag,
            next_epoch: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            pending: Mutex::new(PendingEpochs {
                remaining: HashMap::new(),
            }),
            completed: Condvar::new(),
            send_buffers: SendBuffers::new(pool, comm_size),
        }
    }

    /// Issues the next epoch for this tag. Strictly increasing from 0.
    pub fn next_epoch(&self) -> u32 {
        let epoch = self.next_epoch.fetch_add(1, Ordering::AcqRel);
        debug_assert_epoch_monotonic!(self.tag, epoch, epoch + 1);
        epoch
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Marks the tag finished. Returns `true` the first time this is called
    /// for this tag, `false` on any subsequent call (idempotent).
    pub fn mark_finished(&self) -> bool {
        self.finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Registers a new in-flight epoch countdown, initialized to `remaining`
    /// (the communicator size: one FOC expected from every rank, including
    /// self).
    ///
    /// A no-op if `tagged_epoch` already has a countdown in flight: the
    /// control tag's termination epoch is pre-seeded once by `init` so that
    /// a peer's FOC arriving before this rank reaches `finish_all` is never
    /// dropped, and `finish_all`'s own call to begin the same epoch must not
    /// clobber whatever has already been decremented against it.
    pub fn begin_epoch(&self, tagged_epoch: TaggedEpoch, remaining: i32) {
        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        guard.remaining.entry(tagged_epoch).or_insert(remaining);
    }

    /// Records one received FOC for `tagged_epoch`. Returns `true` if this
    /// call observed the countdown reach zero (the epoch just completed).
    ///
    /// The entry is removed and waiters notified while still holding the
    /// mutex, so a waiter that checks the predicate and only then calls
    /// `wait` can never miss the wakeup.
    pub fn on_control_received(&self, tagged_epoch: TaggedEpoch) -> bool {
        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let Some(remaining) = guard.remaining.get_mut(&tagged_epoch) else {
            return false;
        };
        debug_assert_countdown_positive!(*remaining);
        *remaining -= 1;
        let completed = *remaining <= 0;
        if completed {
            guard.remaining.remove(&tagged_epoch);
        }
        drop(guard);
        if completed {
            self.completed.notify_all();
        }
        completed
    }

    /// Wakes any thread waiting in [`Self::wait_epoch`] without touching the
    /// pending map. `on_control_received` already notifies when it observes
    /// a countdown reach zero; this is called again once the corresponding
    /// synthetic control message is actually dispatched, so a waiter only
    /// ever resumes after every data message enqueued ahead of it in the
    /// receive queue has been handed to its callback.
    pub fn notify_waiters(&self) {
        self.completed.notify_all();
    }

    /// Blocks the calling (controller) thread until `tagged_epoch`'s
    /// countdown has been removed by `on_control_received`.
    pub fn wait_epoch(&self, tagged_epoch: TaggedEpoch) {
        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        while guard.remaining.contains_key(&tagged_epoch) {
            guard = self
                .completed
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Registry of every tag's `TagState`, guarded by a single top-level mutex.
///
/// Lock ordering: this registry mutex is always acquired, and released,
/// without ever calling into a `TagState`'s own mutex while held — so there
/// is no path that could nest "registry, then tag" inside "tag, then
/// registry" and deadlock. Callers always finish with the registry before
/// touching a tag's internals.
pub struct TagRegistry {
    tags: Mutex<HashMap<u32, Arc<TagState>>>,
}

impl TagRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, tag: u32) -> Option<Arc<TagState>> {
        let guard = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(&tag).cloned()
    }

    /// Inserts a freshly created `TagState` iff `tag` is not already
    /// registered. Returns `false` if it was already present.
    pub fn insert_new(&self, tag: u32, state: Arc<TagState>) -> bool {
        let mut guard = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&tag) {
            return false;
        }
        guard.insert(tag, state);
        true
    }

    /// Every registered application tag (excludes [`CONTROL_TAG`]).
    #[must_use]
    pub fn application_tags(&self) -> HashSet<u32> {
        let guard = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        guard.keys().copied().filter(|&t| t != CONTROL_TAG).collect()
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_counter_is_strictly_increasing() {
        let config = Config::default();
        let ts = TagState::new(1, 2, &config);
        assert_eq!(ts.next_epoch(), 0);
        assert_eq!(ts.next_epoch(), 1);
        assert_eq!(ts.next_epoch(), 2);
    }

    #[test]
    fn mark_finished_is_idempotent() {
        let config = Config::default();
        let ts = TagState::new(1, 2, &config);
        assert!(ts.mark_finished());
        assert!(!ts.mark_finished());
        assert!(ts.is_finished());
    }

    #[test]
    fn begin_epoch_does_not_clobber_an_in_flight_countdown() {
        let config = Config::default();
        let ts = TagState::new(1, 3, &config);
        let te = TaggedEpoch::new(1, 0);
        ts.begin_epoch(te, 3);
        assert!(!ts.on_control_received(te));
        // A second begin_epoch call for the same epoch (the control tag's
        // case, pre-seeded by init and re-begun by finish_all) must not
        // reset the countdown back to 3.
        ts.begin_epoch(te, 3);
        assert!(!ts.on_control_received(te));
        assert!(ts.on_control_received(te));
    }

    #[test]
    fn epoch_completes_after_remaining_reaches_zero() {
        let config = Config::default();
        let ts = TagState::new(1, 3, &config);
        let te = TaggedEpoch::new(1, 0);
        ts.begin_epoch(te, 3);
        assert!(!ts.on_control_received(te));
        assert!(!ts.on_control_received(te));
        assert!(ts.on_control_received(te));
        // A late/duplicate FOC for an already-completed epoch is a no-op.
        assert!(!ts.on_control_received(te));
    }

    #[test]
    fn registry_rejects_duplicate_insertion() {
        let registry = TagRegistry::new();
        let config = Config::default();
        assert!(registry.insert_new(5, Arc::new(TagState::new(5, 2, &config))));
        assert!(!registry.insert_new(5, Arc::new(TagState::new(5, 2, &config))));
        assert!(registry.get(5).is_some());
        assert!(registry.get(6).is_none());
    }

    #[test]
    fn application_tags_excludes_control() {
        let registry = TagRegistry::new();
        let config = Config::default();
        registry.insert_new(CONTROL_TAG, Arc::new(TagState::new(CONTROL_TAG, 2, &config)));
        registry.insert_new(3, Arc::new(TagState::new(3, 2, &config)));
        let tags = registry.application_tags();
        assert_eq!(tags, [3].into_iter().collect());
    }
}
