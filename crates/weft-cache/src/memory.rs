use crate::entry::CacheEntry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

struct Slot {
    entry: CacheEntry,
    /// Monotonic access stamp; the smallest is the least recently used.
    tick: u64,
}

/// Result of a tier lookup.
#[derive(Debug)]
pub(crate) enum Lookup {
    Hit(CacheEntry),
    /// The key was present but past its TTL; it has been removed.
    Expired,
    Absent,
}

/// Size-bounded in-process tier with LRU eviction.
///
/// Not synchronised on its own; the owning cache wraps it in a mutex so each
/// `get`/`set` is atomic.
pub(crate) struct MemoryTier {
    slots: HashMap<String, Slot>,
    used: u64,
    max: u64,
    clock: u64,
}

impl MemoryTier {
    pub(crate) fn new(max: u64) -> Self {
        Self {
            slots: HashMap::new(),
            used: 0,
            max,
            clock: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn get(&mut self, key: &str, now: DateTime<Utc>) -> Lookup {
        let expired = match self.slots.get(key) {
            None => return Lookup::Absent,
            Some(slot) => slot.entry.is_expired_at(now),
        };
        if expired {
            self.remove(key);
            return Lookup::Expired;
        }
        let tick = self.next_tick();
        match self.slots.get_mut(key) {
            Some(slot) => {
                slot.tick = tick;
                slot.entry.touch();
                Lookup::Hit(slot.entry.clone())
            }
            None => Lookup::Absent,
        }
    }

    /// Insert `entry`, evicting least recently used entries until it fits.
    ///
    /// Returns the evicted keys, or `None` if the entry alone exceeds the
    /// tier budget. Any previous value under the key is dropped either way.
    pub(crate) fn insert(&mut self, entry: CacheEntry) -> Option<Vec<String>> {
        self.remove(&entry.key);
        if entry.size > self.max {
            return None;
        }

        let mut evicted = Vec::new();
        while self.used + entry.size > self.max {
            let Some(victim) = self.least_recent() else {
                break;
            };
            self.remove(&victim);
            evicted.push(victim);
        }

        let tick = self.next_tick();
        self.used += entry.size;
        self.slots.insert(entry.key.clone(), Slot { entry, tick });
        Some(evicted)
    }

    fn least_recent(&self) -> Option<String> {
        self.slots
            .iter()
            .min_by_key(|(_, slot)| slot.tick)
            .map(|(key, _)| key.clone())
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.used = self.used.saturating_sub(slot.entry.size);
        Some(slot.entry)
    }

    /// Drop every expired entry and return their keys.
    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.used = 0;
    }

    pub(crate) fn contains(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired_at(now))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn used(&self) -> u64 {
        self.used
    }

    #[cfg(test)]
    pub(crate) fn max(&self) -> u64 {
        self.max
    }
}
