//! Bounded least-recently-used cache for hot store records.

use std::collections::HashMap;
use std::hash::Hash;

/// A bounded LRU map.
///
/// Accesses stamp entries with a monotonic counter; inserting past capacity
/// evicts the stalest entry. Lookups are O(1); eviction scans the map, which
/// is acceptable at the store's cache sizes (a few thousand entries).
#[derive(Debug)]
pub struct Lru<K, V> {
    map: HashMap<K, (V, u64)>,
    capacity: usize,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V> Lru<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self { map: HashMap::with_capacity(capacity.min(4096)), capacity, clock: 0 }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.clock += 1;
        let clock = self.clock;
        self.map.get_mut(key).map(|(value, stamp)| {
            *stamp = clock;
            &*value
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.clock += 1;
        if self.map.len() >= self.capacity && !self.map.contains_key(&key) {
            self.evict_stalest();
        }
        self.map.insert(key, (value, self.clock));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(value, _)| value)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    fn evict_stalest(&mut self) {
        if let Some(key) = self
            .map
            .iter()
            .min_by_key(|(_, (_, stamp))| *stamp)
            .map(|(key, _)| key.clone())
        {
            self.map.remove(&key);
        }
    }
}
