//! Bounded recency cache.
//!
//! Insertion (or re-insertion) makes an entry the most recent; when the cache
//! grows past its capacity the least recent entry is evicted. Lookups do not
//! change recency.

use std::hash::Hash;
use std::num::NonZeroUsize;

use indexmap::IndexMap;

/// A bounded map that evicts the least recently inserted entry.
#[derive(Debug, Clone)]
pub struct RecencyCache<K, V> {
    capacity: NonZeroUsize,
    /// Oldest first.
    entries: IndexMap<K, V>,
}

impl<K, V> RecencyCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            entries: IndexMap::new(),
        }
    }

    /// Build a cache from entries given oldest first.
    pub fn from_entries<I>(entries: I, capacity: NonZeroUsize) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut cache = Self::new(capacity);
        for (key, value) in entries {
            cache.insert(key, value);
        }
        cache
    }

    /// Insert or replace `key`, making it the most recent entry.
    pub fn insert(&mut self, key: K, value: V) {
        self.entries.shift_remove(&key);
        self.entries.insert(key, value);
        self.evict_to(self.capacity.get());
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.shift_remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    /// Change the bound, evicting the oldest entries if the cache is now over it.
    pub fn set_capacity(&mut self, capacity: NonZeroUsize) {
        self.capacity = capacity;
        self.evict_to(capacity.get());
    }

    /// Entries from least to most recent.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.keys()
    }

    fn evict_to(&mut self, bound: usize) {
        let overflow = self.entries.len().saturating_sub(bound);
        if overflow > 0 {
            self.entries.drain(..overflow);
        }
    }
}

impl<K: Eq + Hash, V: PartialEq> PartialEq for RecencyCache<K, V> {
    /// Two caches are equal when they hold the same entries, regardless of
    /// capacity or recency order.
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(key, value)| other.entries.get(key) == Some(value))
    }
}
