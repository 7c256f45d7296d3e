//! Keyed single-flight cache.
//!
//! The first caller for a key installs a shared future; every caller until
//! the entry is removed awaits that same future. Each entry carries a
//! generation so a stale owner (say, the close watcher of an old
//! connection) can only remove the entry it created.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

pub type Flight<V> = Shared<BoxFuture<'static, V>>;

struct Slot<V: Clone> {
    generation: u64,
    flight: Flight<V>,
}

pub struct SingleFlight<K, V: Clone> {
    entries: DashMap<K, Slot<V>>,
    next_generation: AtomicU64,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        SingleFlight::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        SingleFlight {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Flight for `key`, started with `start(generation)` if there is none.
    ///
    /// `start` runs synchronously while the entry is locked: it must not
    /// block, only build (or spawn) the work.
    pub fn get_or_start<F>(&self, key: K, start: F) -> Flight<V>
    where
        F: FnOnce(u64) -> BoxFuture<'static, V>,
    {
        match self.entries.entry(key) {
            Entry::Occupied(slot) => slot.get().flight.clone(),
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let flight = start(generation).shared();
                vacant.insert(Slot {
                    generation,
                    flight: flight.clone(),
                });
                flight
            }
        }
    }

    /// Remove `key` only if its entry is still the one from `generation`.
    pub fn remove_if_current(&self, key: &K, generation: u64) -> bool {
        self.entries
            .remove_if(key, |_, slot| slot.generation == generation)
            .is_some()
    }

    /// Remove `key` whatever its generation and hand back its flight.
    pub fn take(&self, key: &K) -> Option<Flight<V>> {
        self.entries.remove(key).map(|(_, slot)| slot.flight)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove every entry and return their flights.
    pub fn drain(&self) -> Vec<Flight<V>> {
        let keys: Vec<K> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter()
            .filter_map(|k| self.entries.remove(k))
            .map(|(_, slot)| slot.flight)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
