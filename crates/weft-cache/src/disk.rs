use crate::entry::CacheEntry;
use crate::memory::Lookup;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use weft_core::{WeftError, WeftResult};

struct DiskSlot {
    path: PathBuf,
    size: u64,
    expires_at: Option<DateTime<Utc>>,
    tick: u64,
}

impl DiskSlot {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| now > expiry)
    }
}

/// File name for a key: lowercase hex SHA-256 plus `.json`.
pub fn entry_file_name(key: &str) -> String {
    format!("{}.json", hex::encode(Sha256::digest(key.as_bytes())))
}

/// Size-bounded tier storing one JSON file per entry.
///
/// The in-memory index mirrors the directory; it is rebuilt by scanning the
/// directory on [`DiskTier::open`].
pub(crate) struct DiskTier {
    dir: PathBuf,
    index: HashMap<String, DiskSlot>,
    used: u64,
    max: u64,
    clock: u64,
}

impl DiskTier {
    /// Open (or create) the cache directory and index every live entry in it.
    ///
    /// Unparsable, expired, and leftover temporary files are removed.
    pub(crate) async fn open(dir: impl Into<PathBuf>, max: u64) -> WeftResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let now = Utc::now();
        let mut loaded: Vec<(DateTime<Utc>, String, DiskSlot)> = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = entries.next_entry().await? {
            let path = dirent.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".tmp") {
                discard(&path).await;
                continue;
            }
            if !name.ends_with(".json") {
                continue;
            }
            let entry = match read_entry(&path).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Dropping unreadable cache file");
                    discard(&path).await;
                    continue;
                }
            };
            if entry.is_expired_at(now) {
                discard(&path).await;
                continue;
            }
            let slot = DiskSlot {
                path,
                size: entry.size,
                expires_at: entry.expires_at(),
                tick: 0,
            };
            loaded.push((entry.last_accessed, entry.key, slot));
        }

        // Oldest access gets the smallest tick.
        loaded.sort_by_key(|(last_accessed, _, _)| *last_accessed);

        let mut tier = Self {
            dir,
            index: HashMap::with_capacity(loaded.len()),
            used: 0,
            max,
            clock: 0,
        };
        for (_, key, mut slot) in loaded {
            slot.tick = tier.next_tick();
            tier.used += slot.size;
            tier.index.insert(key, slot);
        }
        debug!(dir = %tier.dir.display(), entries = tier.index.len(), bytes = tier.used, "Disk cache indexed");

        tier.evict_until_within_budget().await;
        Ok(tier)
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) async fn get(&mut self, key: &str, now: DateTime<Utc>) -> Lookup {
        let (path, expired) = match self.index.get(key) {
            None => return Lookup::Absent,
            Some(slot) => (slot.path.clone(), slot.is_expired_at(now)),
        };
        if expired {
            self.remove(key).await;
            return Lookup::Expired;
        }
        let mut entry = match read_entry(&path).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Cache file vanished or is corrupt");
                self.remove(key).await;
                return Lookup::Absent;
            }
        };
        let tick = self.next_tick();
        if let Some(slot) = self.index.get_mut(key) {
            slot.tick = tick;
        }
        entry.touch();
        // the access time is what orders eviction after a reopen
        if let Err(e) = write_atomic(&path, &entry).await {
            warn!(key, error = %e, "Failed to record cache access on disk");
        }
        Lookup::Hit(entry)
    }

    /// Persist `entry`, then evict the oldest quarter of the tier until the
    /// budget holds again.
    ///
    /// Returns the evicted keys, or `None` if the entry alone exceeds the
    /// tier budget, in which case any previous value under the key is
    /// removed.
    pub(crate) async fn insert(&mut self, entry: &CacheEntry) -> WeftResult<Option<Vec<String>>> {
        if entry.size > self.max {
            self.remove(&entry.key).await;
            return Ok(None);
        }
        let path = self.dir.join(entry_file_name(&entry.key));
        write_atomic(&path, entry).await?;

        if let Some(old) = self.index.remove(&entry.key) {
            self.used = self.used.saturating_sub(old.size);
        }
        let tick = self.next_tick();
        self.used += entry.size;
        self.index.insert(
            entry.key.clone(),
            DiskSlot {
                path,
                size: entry.size,
                expires_at: entry.expires_at(),
                tick,
            },
        );

        Ok(Some(self.evict_until_within_budget().await))
    }

    async fn evict_until_within_budget(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.used > self.max && !self.index.is_empty() {
            let mut by_age: Vec<(u64, String)> = self
                .index
                .iter()
                .map(|(key, slot)| (slot.tick, key.clone()))
                .collect();
            by_age.sort_unstable();
            let batch = by_age.len().div_ceil(4);
            for (_, key) in by_age.into_iter().take(batch) {
                self.remove(&key).await;
                evicted.push(key);
            }
        }
        evicted
    }

    pub(crate) async fn remove(&mut self, key: &str) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.used = self.used.saturating_sub(slot.size);
        discard(&slot.path).await;
        true
    }

    /// Drop every expired entry and return their keys.
    pub(crate) async fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|(_, slot)| slot.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key).await;
        }
        expired
    }

    pub(crate) async fn clear(&mut self) {
        let paths: Vec<PathBuf> = self.index.drain().map(|(_, slot)| slot.path).collect();
        for path in paths {
            discard(&path).await;
        }
        self.used = 0;
    }

    pub(crate) fn contains(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.index
            .get(key)
            .is_some_and(|slot| !slot.is_expired_at(now))
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn used(&self) -> u64 {
        self.used
    }

    #[cfg(test)]
    pub(crate) fn max(&self) -> u64 {
        self.max
    }
}

async fn read_entry(path: &Path) -> WeftResult<CacheEntry> {
    let data = tokio::fs::read(path).await?;
    serde_json::from_slice(&data)
        .map_err(|e| WeftError::Cache(format!("Failed to parse cache file: {e}")))
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, entry: &CacheEntry) -> WeftResult<()> {
    let json = serde_json::to_vec(entry)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        discard(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache file"),
    }
}
