use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::flight::Flight;

/// Requirements for the identity keys used inside the store.
///
/// Blanket-implemented; caller keys qualify automatically when no key
/// transformer is configured.
pub trait CacheKey: fmt::Debug + Clone + Eq + Hash + Send + Sync + 'static {}

impl<T> CacheKey for T where T: fmt::Debug + Clone + Eq + Hash + Send + Sync + 'static {}

pub(crate) enum EntryState<V> {
    /// A fetch is in flight; callers join it.
    Pending(Flight<V>),
    /// The value is memoized until policy evicts it.
    Settled(V),
}

pub(crate) struct Entry<V> {
    /// Position in the insertion order; refreshed slots get a new number
    /// and leave a stale one behind in the deque.
    slot: u64,
    inserted_at: Instant,
    last_access: Instant,
    pub(crate) state: EntryState<V>,
}

impl<V> Entry<V> {
    pub(crate) fn pending(flight: Flight<V>) -> Self {
        Self::new(EntryState::Pending(flight))
    }

    pub(crate) fn settled(value: V) -> Self {
        Self::new(EntryState::Settled(value))
    }

    fn new(state: EntryState<V>) -> Self {
        let now = Instant::now();
        Entry {
            slot: 0,
            inserted_at: now,
            last_access: now,
            state,
        }
    }
}

/// Keyed, insertion-ordered entry container with lazy expiry and a FIFO
/// capacity bound.
///
/// The deque mirrors the eviction order: expiry is measured from insertion
/// (or from last access in rolling mode), and any refresh re-inserts at the
/// tail, so the eviction clock is monotone along the deque and both the
/// expiry sweep and the capacity trim work from the head.
pub(crate) struct EntryStore<I, V> {
    entries: HashMap<I, Entry<V>>,
    order: VecDeque<(u64, I)>,
    next_slot: u64,
    expiration: Option<Duration>,
    rolling: bool,
    max_entries: Option<usize>,
}

impl<I: CacheKey, V> EntryStore<I, V> {
    pub(crate) fn new(config: &CacheConfig) -> Self {
        EntryStore {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_slot: 0,
            expiration: config.expiration,
            rolling: config.rolling_expiration,
            max_entries: config.max_entries.map(|limit| limit.max(1)),
        }
    }

    fn eviction_stamp(&self, entry: &Entry<V>) -> Instant {
        if self.rolling {
            entry.last_access
        } else {
            entry.inserted_at
        }
    }

    /// Drops entries whose eviction clock has run out. Runs at the head of
    /// every operation; expired entries are never observable.
    pub(crate) fn sweep(&mut self) {
        let Some(ttl) = self.expiration else { return };
        let now = Instant::now();
        while let Some((slot, key)) = self.order.front() {
            let live = match self.entries.get(key) {
                Some(entry) if entry.slot == *slot => {
                    now.duration_since(self.eviction_stamp(entry)) < ttl
                }
                _ => {
                    // stale slot left behind by a refresh
                    self.order.pop_front();
                    continue;
                }
            };
            if live {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                tracing::trace!(?key, "cache entry expired");
                self.entries.remove(&key);
            }
        }
    }

    /// Looks up a live entry; in rolling mode a hit refreshes the entry's
    /// clock and moves it to the back of the eviction order.
    pub(crate) fn get(&mut self, key: &I) -> Option<&Entry<V>> {
        self.sweep();
        if self.rolling && self.entries.contains_key(key) {
            self.refresh_slot(key);
        }
        self.entries.get(key)
    }

    /// Looks up an entry without sweeping or touching the rolling clock.
    pub(crate) fn entry_mut(&mut self, key: &I) -> Option<&mut Entry<V>> {
        self.entries.get_mut(key)
    }

    /// The id of the in-flight fetch currently installed for the key, if
    /// any.
    pub(crate) fn pending_flight(&self, key: &I) -> Option<u64> {
        match self.entries.get(key).map(|entry| &entry.state) {
            Some(EntryState::Pending(flight)) => Some(flight.id),
            _ => None,
        }
    }

    /// Inserts or replaces an entry at the back of the eviction order, then
    /// trims to capacity.
    pub(crate) fn insert(&mut self, key: I, mut entry: Entry<V>) {
        self.sweep();
        let slot = self.take_slot();
        entry.slot = slot;
        let now = Instant::now();
        entry.inserted_at = now;
        entry.last_access = now;
        self.order.push_back((slot, key.clone()));
        self.entries.insert(key, entry);
        self.trim();
        self.maybe_compact();
    }

    pub(crate) fn remove(&mut self, key: &I) -> Option<Entry<V>> {
        // the deque slot goes stale and is skipped on the next sweep/trim
        self.entries.remove(key)
    }

    pub(crate) fn contains(&mut self, key: &I) -> bool {
        self.sweep();
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&mut self) -> usize {
        self.sweep();
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn take_slot(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn refresh_slot(&mut self, key: &I) {
        let slot = self.take_slot();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.slot = slot;
            entry.last_access = Instant::now();
            self.order.push_back((slot, key.clone()));
        }
        self.maybe_compact();
    }

    /// Evicts oldest entries while over capacity.
    fn trim(&mut self) {
        let Some(limit) = self.max_entries else { return };
        while self.entries.len() > limit {
            let Some((slot, key)) = self.order.pop_front() else {
                break;
            };
            if self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.slot == slot)
            {
                tracing::trace!(?key, "cache entry evicted over capacity");
                self.entries.remove(&key);
            }
        }
    }

    /// Rebuilds the deque once stale slots dominate, so refresh-heavy
    /// workloads without expiry or capacity bounds do not grow it without
    /// limit.
    fn maybe_compact(&mut self) {
        if self.order.len() > 32 && self.order.len() > self.entries.len() * 2 {
            let entries = &self.entries;
            self.order
                .retain(|(slot, key)| entries.get(key).is_some_and(|entry| entry.slot == *slot));
        }
    }
}
