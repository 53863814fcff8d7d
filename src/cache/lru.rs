//! LRU (Least Recently Used) index over published cache entries

use crate::fingerprint::Fingerprint;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy)]
struct Slot {
    size: u64,
    tick: u64,
}

/// Access order and size tracking for eviction.
///
/// Not synchronized; the cache keeps it behind its own lock.
#[derive(Debug, Default)]
pub struct LruIndex {
    /// Key → size and last-access tick
    slots: HashMap<Fingerprint, Slot>,
    /// Tick → key, oldest first
    order: BTreeMap<u64, Fingerprint>,
    /// Total bytes tracked
    total_size: u64,
    next_tick: u64,
}

impl LruIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new entry as most recently used, replacing any previous record.
    pub fn insert(&mut self, key: Fingerprint, size: u64) {
        self.remove(&key);
        let tick = self.bump();
        self.slots.insert(key, Slot { size, tick });
        self.order.insert(tick, key);
        self.total_size += size;
    }

    /// Mark an entry as just used. Returns false when it is not tracked.
    pub fn touch(&mut self, key: &Fingerprint) -> bool {
        let tick = self.bump();
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, *key);
        true
    }

    /// Stop tracking an entry, returning its size.
    pub fn remove(&mut self, key: &Fingerprint) -> Option<u64> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        self.total_size -= slot.size;
        Some(slot.size)
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.slots.contains_key(key)
    }

    pub fn size_of(&self, key: &Fingerprint) -> Option<u64> {
        self.slots.get(key).map(|s| s.size)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Keys from least to most recently used.
    pub fn oldest_first(&self) -> impl Iterator<Item = &Fingerprint> {
        self.order.values()
    }

    /// Oldest entries to drop so the total fits in `target_bytes`.
    ///
    /// Entries for which `is_pinned` is true are skipped. The result may not
    /// reach the target when too much is pinned.
    pub fn victims<F>(&self, target_bytes: u64, is_pinned: F) -> Vec<Fingerprint>
    where
        F: Fn(&Fingerprint) -> bool,
    {
        let mut remaining = self.total_size;
        let mut victims = Vec::new();
        for key in self.order.values() {
            if remaining <= target_bytes {
                break;
            }
            if is_pinned(key) {
                continue;
            }
            if let Some(slot) = self.slots.get(key) {
                remaining -= slot.size;
                victims.push(*key);
            }
        }
        victims
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
        self.total_size = 0;
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}
