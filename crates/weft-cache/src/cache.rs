use crate::config::{CacheConfig, CacheMode};
use crate::disk::DiskTier;
use crate::entry::{CacheEntry, CacheTier};
use crate::events::{CacheEvent, EvictionReason};
use crate::memory::{Lookup, MemoryTier};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use weft_core::{EventBus, EventSubscription, WeftError, WeftResult};

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// `hits / (hits + misses)`, or 0 before the first lookup.
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Key/value cache with a memory tier, a disk tier, or both.
///
/// Values are JSON documents. Every entry carries its own TTL; expired entries
/// are invisible to `get` immediately and are physically removed either lazily
/// on access or by the background sweeper.
pub struct Cache {
    config: CacheConfig,
    memory: Option<parking_lot::Mutex<MemoryTier>>,
    disk: Option<tokio::sync::Mutex<DiskTier>>,
    events: EventBus<CacheEvent>,
    counters: Counters,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Build a cache from configuration, indexing any existing disk entries.
    pub async fn open(config: CacheConfig) -> WeftResult<Self> {
        let memory = config
            .mode
            .uses_memory()
            .then(|| parking_lot::Mutex::new(MemoryTier::new(config.max_memory_bytes)));
        let disk = if config.mode.uses_disk() {
            let tier = DiskTier::open(&config.disk_dir, config.max_disk_bytes).await?;
            Some(tokio::sync::Mutex::new(tier))
        } else {
            None
        };
        info!(
            mode = ?config.mode,
            max_memory_bytes = config.max_memory_bytes,
            max_disk_bytes = config.max_disk_bytes,
            "Cache opened"
        );
        Ok(Self {
            config,
            memory,
            disk,
            events: EventBus::default(),
            counters: Counters::default(),
            sweeper: parking_lot::Mutex::new(None),
        })
    }

    /// A memory-only cache with the given byte budget.
    pub fn in_memory(max_bytes: u64) -> Self {
        let config = CacheConfig {
            mode: CacheMode::Memory,
            max_memory_bytes: max_bytes,
            ..CacheConfig::default()
        };
        Self {
            memory: Some(parking_lot::Mutex::new(MemoryTier::new(max_bytes))),
            disk: None,
            config,
            events: EventBus::default(),
            counters: Counters::default(),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Subscribe to hit/miss/set/evicted/expired/cleared events.
    pub fn subscribe(&self) -> EventSubscription<CacheEvent> {
        self.events.subscribe()
    }

    /// Look up `key`, memory first, then disk.
    ///
    /// Under hybrid mode a disk hit is copied into the memory tier.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// Like [`Cache::get`] but returns the whole entry, metadata included.
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let started = Instant::now();
        let now = Utc::now();

        if let Some(memory) = &self.memory {
            let lookup = memory.lock().get(key, now);
            match lookup {
                Lookup::Hit(entry) => {
                    self.record_hit(key, CacheTier::Memory, started);
                    return Some(entry);
                }
                Lookup::Expired => self.record_expired(key, CacheTier::Memory),
                Lookup::Absent => {}
            }
        }

        if let Some(disk) = &self.disk {
            let lookup = disk.lock().await.get(key, now).await;
            match lookup {
                Lookup::Hit(entry) => {
                    if self.config.mode == CacheMode::Hybrid {
                        self.promote(&entry);
                    }
                    self.record_hit(key, CacheTier::Disk, started);
                    return Some(entry);
                }
                Lookup::Expired => self.record_expired(key, CacheTier::Disk),
                Lookup::Absent => {}
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key, "Cache miss");
        self.events.publish(CacheEvent::Miss {
            key: key.to_string(),
            latency: started.elapsed(),
        });
        None
    }

    fn promote(&self, entry: &CacheEntry) {
        let Some(memory) = &self.memory else {
            return;
        };
        let evicted = memory.lock().insert(entry.clone());
        if let Some(evicted) = evicted {
            debug!(key = %entry.key, "Promoted disk entry into memory");
            self.record_evictions(evicted, CacheTier::Memory, EvictionReason::LeastRecentlyUsed);
        }
    }

    /// Store `value` under `key` in every enabled tier.
    ///
    /// `ttl` defaults to the configured TTL. Fails only if the entry is larger
    /// than every enabled tier's whole budget.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        metadata: Option<HashMap<String, Value>>,
    ) -> WeftResult<()> {
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let entry = CacheEntry::new(key, value, ttl, metadata.unwrap_or_default())?;
        let size = entry.size;
        let mut tiers = Vec::with_capacity(2);

        // Disk first: a failed write must leave memory untouched.
        if let Some(disk) = &self.disk {
            let evicted = disk.lock().await.insert(&entry).await?;
            if let Some(evicted) = evicted {
                tiers.push(CacheTier::Disk);
                self.record_evictions(evicted, CacheTier::Disk, EvictionReason::DiskPressure);
            }
        }

        if let Some(memory) = &self.memory {
            let evicted = memory.lock().insert(entry);
            if let Some(evicted) = evicted {
                tiers.insert(0, CacheTier::Memory);
                self.record_evictions(evicted, CacheTier::Memory, EvictionReason::LeastRecentlyUsed);
            }
        }

        if tiers.is_empty() {
            return Err(WeftError::Cache(format!(
                "Entry '{key}' of {size} bytes exceeds every tier budget"
            )));
        }

        trace!(key, size, ?tiers, "Cache set");
        self.events.publish(CacheEvent::Set {
            key: key.to_string(),
            size,
            tiers,
        });
        Ok(())
    }

    /// Remove `key` from every tier. Returns whether anything was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        if let Some(memory) = &self.memory {
            removed |= memory.lock().remove(key).is_some();
        }
        if let Some(disk) = &self.disk {
            removed |= disk.lock().await.remove(key).await;
        }
        if removed {
            self.events.publish(CacheEvent::Deleted {
                key: key.to_string(),
            });
        }
        removed
    }

    /// Whether a live entry exists in any tier. Does not count as an access.
    pub async fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        if let Some(memory) = &self.memory {
            if memory.lock().contains(key, now) {
                return true;
            }
        }
        match &self.disk {
            Some(disk) => disk.lock().await.contains(key, now),
            None => false,
        }
    }

    /// Wipe both tiers, disk files included.
    pub async fn clear(&self) {
        if let Some(memory) = &self.memory {
            memory.lock().clear();
        }
        if let Some(disk) = &self.disk {
            disk.lock().await.clear().await;
        }
        info!("Cache cleared");
        self.events.publish(CacheEvent::Cleared);
    }

    /// Remove every expired entry from both tiers. Returns how many were
    /// removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        if let Some(memory) = &self.memory {
            let expired = memory.lock().purge_expired(now);
            removed += expired.len();
            for key in expired {
                self.record_expired(&key, CacheTier::Memory);
            }
        }
        if let Some(disk) = &self.disk {
            let expired = disk.lock().await.purge_expired(now).await;
            removed += expired.len();
            for key in expired {
                self.record_expired(&key, CacheTier::Disk);
            }
        }
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Spawn the periodic TTL sweep. Calling it again replaces the running
    /// sweeper. The task holds only a weak reference and ends with the cache.
    pub fn start_sweeper(self: &Arc<Self>) {
        let interval = self.config.cleanup_interval();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                cache.sweep_expired().await;
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the background sweep. Cached data is kept.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Cache sweeper stopped");
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let (memory_entries, memory_bytes) = match &self.memory {
            Some(memory) => {
                let tier = memory.lock();
                (tier.len(), tier.used())
            }
            None => (0, 0),
        };
        let (disk_entries, disk_bytes) = match &self.disk {
            Some(disk) => {
                let tier = disk.lock().await;
                (tier.len(), tier.used())
            }
            None => (0, 0),
        };
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            memory_entries,
            memory_bytes,
            disk_entries,
            disk_bytes,
            hits,
            misses,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Typed lookup. A value that no longer deserializes into `T` is an error.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> WeftResult<Option<T>> {
        match self.get(key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_serialized<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> WeftResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, ttl, None).await
    }

    /// Return the cached value for `key`, or run `compute` and cache its
    /// result. Errors from `compute` are returned and not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> WeftResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WeftResult<Value>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = compute().await?;
        if let Err(e) = self.set(key, value.clone(), ttl, None).await {
            warn!(key, error = %e, "Computed value was not cached");
        }
        Ok(value)
    }

    fn record_hit(&self, key: &str, tier: CacheTier, started: Instant) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        trace!(key, %tier, "Cache hit");
        self.events.publish(CacheEvent::Hit {
            key: key.to_string(),
            tier,
            latency: started.elapsed(),
        });
    }

    fn record_expired(&self, key: &str, tier: CacheTier) {
        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        self.events.publish(CacheEvent::Expired {
            key: key.to_string(),
            tier,
        });
    }

    fn record_evictions(&self, keys: Vec<String>, tier: CacheTier, reason: EvictionReason) {
        if keys.is_empty() {
            return;
        }
        self.counters
            .evictions
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        debug!(%tier, count = keys.len(), ?reason, "Evicted cache entries");
        for key in keys {
            self.events.publish(CacheEvent::Evicted { key, tier, reason });
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
