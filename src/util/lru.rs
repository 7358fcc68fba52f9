//! A byte-budgeted cache with combined recency/frequency eviction.
//!
//! Entries carry an explicit size. The cache tracks a soft byte budget;
//! once exceeded, eviction removes entries in order of a score combining
//! the last-use tick with a bounded use-count bonus, so an entry touched
//! often survives one touched recently but only once. There is no hard
//! capacity: a single oversized entry is admitted and evicted on the next
//! insertion.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Use-count bonus per recorded hit, in ticks.
const FREQUENCY_BOOST: u64 = 8;

/// Hits counted toward the bonus; beyond this, frequency saturates.
const MAX_COUNTED_USES: u32 = 32;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    size: usize,
    last_used: u64,
    uses: u32,
}

impl<V> Slot<V> {
    fn score(&self) -> u64 {
        self.last_used + u64::from(self.uses.min(MAX_COUNTED_USES)) * FREQUENCY_BOOST
    }
}

/// A weight-bounded map evicting by least (recency + frequency) first.
#[derive(Debug)]
pub struct WeightedLru<K, V> {
    map: HashMap<K, Slot<V>>,
    budget: usize,
    used: usize,
    tick: u64,
}

impl<K: Eq + Hash, V> WeightedLru<K, V> {
    pub fn new(budget: usize) -> Self {
        Self {
            map: HashMap::new(),
            budget,
            used: 0,
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Bytes currently accounted for.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Replaces the soft budget, evicting immediately if it shrank.
    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
        self.evict_to_budget();
    }

    /// Looks up `key`, recording a hit.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.map.get_mut(key)?;
        slot.last_used = tick;
        slot.uses = slot.uses.saturating_add(1);
        Some(&slot.value)
    }

    /// Inserts or replaces `key`, then evicts past the budget.
    pub fn insert(&mut self, key: K, value: V, size: usize) {
        self.tick += 1;
        if let Some(old) = self.map.insert(
            key,
            Slot {
                value,
                size,
                last_used: self.tick,
                uses: 1,
            },
        ) {
            self.used -= old.size;
        }
        self.used += size;
        self.evict_to_budget();
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let slot = self.map.remove(key)?;
        self.used -= slot.size;
        Some(slot.value)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.used = 0;
    }

    fn evict_to_budget(&mut self) {
        while self.used > self.budget && self.map.len() > 1 {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Removes the entry with the lowest score. Two passes over the map:
    /// find the minimal score, then drop the first entry carrying it; this
    /// avoids cloning keys of arbitrary type.
    fn evict_one(&mut self) -> bool {
        let min_score = match self.map.values().map(Slot::score).min() {
            Some(s) => s,
            None => return false,
        };
        let mut removed_size = None;
        self.map.retain(|_, slot| {
            if removed_size.is_none() && slot.score() == min_score {
                removed_size = Some(slot.size);
                false
            } else {
                true
            }
        });
        match removed_size {
            Some(size) => {
                self.used -= size;
                true
            }
            None => false,
        }
    }
}
