use crate::entry::CacheTier;
use std::time::Duration;

/// Why an entry left the cache before being read again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Made room under the memory budget.
    LeastRecentlyUsed,
    /// Part of the oldest quarter dropped from an over-budget disk tier.
    DiskPressure,
}

/// Observable cache activity.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Hit {
        key: String,
        tier: CacheTier,
        latency: Duration,
    },
    Miss {
        key: String,
        latency: Duration,
    },
    Set {
        key: String,
        size: u64,
        tiers: Vec<CacheTier>,
    },
    Evicted {
        key: String,
        tier: CacheTier,
        reason: EvictionReason,
    },
    Expired {
        key: String,
        tier: CacheTier,
    },
    Deleted {
        key: String,
    },
    Cleared,
}
