//! Thread key to event state map.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::ThreadEventState;
use crate::interfaces::{ThreadKey, ThreadRef};

/// Reaped keys remembered when no retention is configured.
pub const DEFAULT_REAPED_RETENTION: usize = 4096;

/// All live per-thread event states.
///
/// Terminated threads leave a tombstone so late posts on them are dropped
/// instead of recreating state. Only the most recent `retention` tombstones
/// are kept; a revived key clears its own.
#[derive(Debug)]
pub struct ThreadTable {
    states: DashMap<ThreadKey, Arc<ThreadEventState>>,
    /// Key to the reap sequence number of its tombstone
    reaped: DashMap<ThreadKey, u64>,
    reap_order: Mutex<ReapOrder>,
    retention: usize,
}

#[derive(Debug, Default)]
struct ReapOrder {
    next_seq: u64,
    queue: VecDeque<(ThreadKey, u64)>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_REAPED_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            states: DashMap::new(),
            reaped: DashMap::new(),
            reap_order: Mutex::new(ReapOrder::default()),
            retention: retention.max(1),
        }
    }

    #[inline]
    pub fn get(&self, key: ThreadKey) -> Option<Arc<ThreadEventState>> {
        self.states.get(&key).map(|s| Arc::clone(s.value()))
    }

    /// Existing state, or a new one initialized by `init` before it becomes
    /// visible to other threads.
    pub(crate) fn get_or_insert_with(
        &self,
        thread: ThreadRef,
        init: impl FnOnce(&ThreadEventState),
    ) -> Arc<ThreadEventState> {
        let entry = self.states.entry(thread.key).or_insert_with(|| {
            let state = ThreadEventState::new(thread);
            init(&state);
            Arc::new(state)
        });
        Arc::clone(entry.value())
    }

    pub(crate) fn remove(&self, key: ThreadKey) -> Option<Arc<ThreadEventState>> {
        self.bury(key);
        self.states.remove(&key).map(|(_, state)| state)
    }

    fn bury(&self, key: ThreadKey) {
        let mut order = self.reap_order.lock();
        let seq = order.next_seq;
        order.next_seq += 1;
        self.reaped.insert(key, seq);
        order.queue.push_back((key, seq));
        while order.queue.len() > self.retention {
            if let Some((old, old_seq)) = order.queue.pop_front() {
                // A key reaped again since carries a newer sequence number
                self.reaped.remove_if(&old, |_, seq| *seq == old_seq);
            }
        }
    }

    /// A (possibly reused) key became live again.
    pub(crate) fn revive(&self, key: ThreadKey) {
        self.reaped.remove(&key);
    }

    pub fn is_reaped(&self, key: ThreadKey) -> bool {
        self.reaped.contains_key(&key)
    }

    /// Tombstones currently remembered.
    pub fn reaped_len(&self) -> usize {
        self.reaped.len()
    }

    /// Every live state, copied out so no map shard stays locked while the
    /// caller works on them.
    pub fn states(&self) -> Vec<Arc<ThreadEventState>> {
        self.states.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
