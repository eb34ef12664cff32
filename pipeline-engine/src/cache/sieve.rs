// SIEVE Eviction Index
// Capacity-bounded index of cache keys using the SIEVE eviction policy

use super::CacheError;

use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;

/// Hit/miss counters of an index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Percentage of lookups that hit, 0 when nothing was looked up
    pub fn hit_rate(&self) -> u64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0
        } else {
            self.hits * 100 / total
        }
    }
}

#[derive(Debug)]
struct Slot<K> {
    key: K,
    visited: bool,
    /// Neighbour towards the head
    newer: Option<usize>,
    /// Neighbour towards the tail
    older: Option<usize>,
}

/// Keys ordered by insertion, newest at the head.
///
/// A lookup sets the key's visited bit. When the index is full the hand walks
/// from the oldest key towards the newest, clearing visited bits, and evicts
/// the first key it finds unvisited. The hand keeps its position between
/// evictions and wraps back to the oldest key when it runs off the head.
#[derive(Debug)]
pub struct SieveIndex<K> {
    slots: Vec<Option<Slot<K>>>,
    free: Vec<usize>,
    lookup: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    hand: Option<usize>,
    capacity: usize,
    stats: CacheStats,
}

impl<K> SieveIndex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::Capacity(
                "cache capacity cannot be zero".to_string(),
            ));
        }

        Ok(Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            lookup: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
            hand: None,
            capacity,
            stats: CacheStats::default(),
        })
    }

    /// Add a key, returning the key evicted to make room.
    ///
    /// Inserting a key that is already present counts as a visit.
    pub fn insert(&mut self, key: K) -> Option<K> {
        if let Some(&i) = self.lookup.get(&key) {
            if let Some(slot) = self.slots[i].as_mut() {
                slot.visited = true;
            }
            return None;
        }

        let evicted = if self.lookup.len() >= self.capacity {
            self.evict()
        } else {
            None
        };

        let slot = Slot {
            key: key.clone(),
            visited: false,
            newer: None,
            older: self.head,
        };

        let i = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        if let Some(old_head) = self.head {
            if let Some(slot) = self.slots[old_head].as_mut() {
                slot.newer = Some(i);
            }
        }
        self.head = Some(i);
        if self.tail.is_none() {
            self.tail = Some(i);
        }
        self.lookup.insert(key, i);

        evicted
    }

    /// Look a key up, marking it visited. Counts towards the stats.
    pub fn access(&mut self, key: &K) -> bool {
        match self.lookup.get(key) {
            Some(&i) => {
                if let Some(slot) = self.slots[i].as_mut() {
                    slot.visited = true;
                }
                self.stats.hits += 1;
                true
            }
            None => {
                self.stats.misses += 1;
                false
            }
        }
    }

    /// Membership test without side effects
    pub fn contains(&self, key: &K) -> bool {
        self.lookup.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> bool {
        let Some(&i) = self.lookup.get(key) else {
            return false;
        };

        if self.hand == Some(i) {
            self.hand = self.slots[i].as_ref().and_then(|s| s.newer);
        }
        self.unlink(i);
        true
    }

    pub fn purge(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.lookup.clear();
        self.head = None;
        self.tail = None;
        self.hand = None;
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn keys_oldest_first(&self) -> Vec<&K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.tail;
        while let Some(slot) = cursor.and_then(|i| self.slots[i].as_ref()) {
            keys.push(&slot.key);
            cursor = slot.newer;
        }
        keys
    }

    fn evict(&mut self) -> Option<K> {
        let mut cursor = self.hand.or(self.tail);

        while let Some(i) = cursor {
            let slot = self.slots[i].as_mut()?;

            if !slot.visited {
                self.hand = slot.newer;
                return self.unlink(i);
            }

            slot.visited = false;
            cursor = slot.newer.or(self.tail);
        }

        None
    }

    fn unlink(&mut self, i: usize) -> Option<K> {
        let slot = self.slots[i].take()?;

        match slot.newer {
            Some(newer) => {
                if let Some(s) = self.slots[newer].as_mut() {
                    s.older = slot.older;
                }
            }
            None => self.head = slot.older,
        }

        match slot.older {
            Some(older) => {
                if let Some(s) = self.slots[older].as_mut() {
                    s.newer = slot.newer;
                }
            }
            None => self.tail = slot.newer,
        }

        self.free.push(i);
        self.lookup.remove(&slot.key);
        Some(slot.key)
    }
}
