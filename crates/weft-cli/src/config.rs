//! `weft.toml` loading.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use weft_cache::CacheConfig;
use weft_orchestrator::{SchedulerConfig, TrackerConfig};
use weft_workers::{CoordinatorConfig, WorkerConfig};

/// Config file used when `--config` is not given. It may be absent.
pub const DEFAULT_CONFIG_PATH: &str = "weft.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct WeftConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            coordinator: CoordinatorConfig::default(),
            workers: Vec::new(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl WeftConfig {
    /// Read and parse `path`. A missing default config yields the built-in
    /// defaults; a missing explicit config is an error.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && path == Path::new(DEFAULT_CONFIG_PATH) => {
                info!("No {DEFAULT_CONFIG_PATH} found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read config file '{}': {e}",
                    path.display()
                ))
            }
        };
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Coordinator settings with top-level `[[workers]]` merged into the
    /// registry.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let mut coordinator = self.coordinator.clone();
        coordinator.workers.extend(self.workers.iter().cloned());
        coordinator
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use weft_cache::CacheMode;
    use weft_workers::StartPriority;

    const FULL: &str = r#"
data_dir = "/var/lib/weft"

[coordinator]
port_range_start = 3100
port_range_end = 3199
max_concurrent_startups = 3
health_check_interval_secs = 30
unhealthy_threshold = 3
pool_growth_factor = 1.5
max_pool_capacity = 200

[[workers]]
name = "embedder"
command = "node"
script = "workers/embedder.js"
args = ["{port}"]
priority = "high"
auto_restart = true
max_memory_mb = 512
max_cpu_percent = 80.0
max_connections = 20

[cache]
mode = "hybrid"
max_memory_bytes = 104857600
max_disk_bytes = 1073741824
default_ttl_secs = 3600
cleanup_interval_secs = 300

[scheduler]
max_concurrency = 4
max_concurrency_ceiling = 16
adaptive = true
adaptive_interval_secs = 10

[tracker]
base_retry_delay_ms = 1000
breaker_threshold = 5
breaker_timeout_secs = 60
bottleneck_avg_secs = 30
bottleneck_max_secs = 60
"#;

    #[test]
    fn test_full_config() {
        let config = WeftConfig::parse(FULL).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/weft"));
        assert_eq!(config.cache.mode, CacheMode::Hybrid);
        assert_eq!(config.scheduler.max_concurrency_ceiling, 16);
        assert_eq!(config.tracker.breaker_threshold, 5);

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.workers.len(), 1);
        let embedder = &coordinator.workers[0];
        assert_eq!(embedder.name, "embedder");
        assert_eq!(embedder.priority, StartPriority::High);
        assert_eq!(embedder.max_connections, Some(20));
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/var/lib/weft/checkpoints"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = WeftConfig::parse("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.coordinator.port_range_start, 3100);
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.tracker.base_retry_delay_ms, 1000);
        assert!(config.coordinator_config().workers.is_empty());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(WeftConfig::parse("[cache]\nmode = \"tape\"").is_err());
    }

    #[tokio::test]
    async fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WeftConfig::load(&dir.path().join("nope.toml")).await.is_err());

        let path = dir.path().join("weft.toml");
        std::fs::write(&path, "data_dir = \"/tmp/w\"").unwrap();
        let config = WeftConfig::load(&path).await.unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/w"));
    }
}
