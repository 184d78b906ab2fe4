use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which tiers a cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Memory tier only.
    #[default]
    Memory,
    /// Disk tier only.
    Disk,
    /// Write-through to both tiers; disk hits are promoted into memory.
    Hybrid,
}

impl CacheMode {
    /// Whether the memory tier is enabled.
    pub fn uses_memory(self) -> bool {
        matches!(self, CacheMode::Memory | CacheMode::Hybrid)
    }

    /// Whether the disk tier is enabled.
    pub fn uses_disk(self) -> bool {
        matches!(self, CacheMode::Disk | CacheMode::Hybrid)
    }
}

/// Cache configuration, usually read from the `[cache]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub mode: CacheMode,
    /// Budget for the memory tier, in serialized bytes.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Budget for the disk tier, in serialized bytes.
    #[serde(default = "default_max_disk_bytes")]
    pub max_disk_bytes: u64,
    /// TTL applied when `set` is called without one.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Directory holding one file per disk entry.
    #[serde(default = "default_disk_dir")]
    pub disk_dir: PathBuf,
}

fn default_max_memory_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_disk_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_disk_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::default(),
            max_memory_bytes: default_max_memory_bytes(),
            max_disk_bytes: default_max_disk_bytes(),
            default_ttl_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            disk_dir: default_disk_dir(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: CacheConfig = parse(r#"{"mode": "hybrid", "max_memory_bytes": 512}"#);
        assert_eq!(config.mode, CacheMode::Hybrid);
        assert_eq!(config.max_memory_bytes, 512);
        assert_eq!(config.max_disk_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.default_ttl(), Duration::from_secs(3600));
        assert!(config.mode.uses_memory() && config.mode.uses_disk());
    }

    #[test]
    fn test_mode_tiers() {
        assert!(CacheMode::Memory.uses_memory());
        assert!(!CacheMode::Memory.uses_disk());
        assert!(!CacheMode::Disk.uses_memory());
        assert!(CacheMode::Disk.uses_disk());
    }

    fn parse(json: &str) -> CacheConfig {
        serde_json::from_str(json).unwrap()
    }
}
