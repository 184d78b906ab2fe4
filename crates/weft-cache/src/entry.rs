use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use weft_core::WeftResult;

/// Storage level of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// In-process map.
    Memory,
    /// One JSON file per key.
    Disk,
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Memory => write!(f, "memory"),
            CacheTier::Disk => write!(f, "disk"),
        }
    }
}

/// A single cached value plus the bookkeeping needed for TTL and LRU.
///
/// Disk files contain exactly this structure, so the disk tier can be rebuilt
/// from a directory scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Time to live in milliseconds, counted from `created_at`.
    pub ttl_ms: u64,
    /// Approximate size: the JSON byte length of `value`.
    pub size: u64,
    #[serde(default)]
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CacheEntry {
    /// Build an entry, measuring the serialized size of `value`.
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        ttl: Duration,
        metadata: HashMap<String, serde_json::Value>,
    ) -> WeftResult<Self> {
        let size = serialized_size(&value)?;
        let now = Utc::now();
        Ok(Self {
            key: key.into(),
            value,
            created_at: now,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            size,
            access_count: 0,
            last_accessed: now,
            metadata,
        })
    }

    /// Instant after which the entry is invisible. `None` means the TTL is
    /// too large to represent and the entry never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = TimeDelta::try_milliseconds(i64::try_from(self.ttl_ms).ok()?)?;
        self.created_at.checked_add_signed(ttl)
    }

    /// `true` once `now > created_at + ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expiry| now > expiry)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Record a read.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

/// JSON byte length of a value.
pub fn serialized_size(value: &serde_json::Value) -> WeftResult<u64> {
    let bytes = serde_json::to_vec(value)?;
    Ok(bytes.len() as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size_is_json_length() {
        let entry = CacheEntry::new("k", json!("a".repeat(38)), Duration::from_secs(1), HashMap::new())
            .unwrap();
        assert_eq!(entry.size, 40);
    }

    #[test]
    fn test_expiry_boundary() {
        let entry =
            CacheEntry::new("k", json!(1), Duration::from_millis(500), HashMap::new()).unwrap();
        let expiry = entry.expires_at().unwrap();
        assert!(!entry.is_expired_at(expiry));
        assert!(entry.is_expired_at(expiry + TimeDelta::milliseconds(1)));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let entry = CacheEntry::new("k", json!(null), Duration::MAX, HashMap::new()).unwrap();
        assert!(!entry.is_expired_at(Utc::now() + TimeDelta::days(365 * 100)));
    }

    #[test]
    fn test_touch_counts_reads() {
        let mut entry =
            CacheEntry::new("k", json!({"a": 1}), Duration::from_secs(5), HashMap::new()).unwrap();
        entry.touch();
        entry.touch();
        assert_eq!(entry.access_count, 2);
    }
}
