use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Startup priority. High-priority requests jump ahead of queued ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Configuration for a single external worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique worker name.
    pub name: String,
    /// Executable to run (e.g. `node`, `python3`, or a path).
    pub command: String,
    /// Script handed to `command` as its first argument. Must exist.
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Extra arguments; `{port}` is replaced with the assigned port.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Environment variable that receives the assigned port.
    #[serde(default = "default_port_env")]
    pub port_env: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Full health URL template. Defaults to
    /// `http://127.0.0.1:{port}` followed by `health_path`.
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub priority: StartPriority,
    /// Restart automatically after a crash or repeated health failures.
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Health polls before startup is declared failed.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
    #[serde(default = "default_startup_poll_interval_ms")]
    pub startup_poll_interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    /// How long a soft-terminated worker may take to exit before it is killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default)]
    pub max_memory_mb: Option<f64>,
    #[serde(default)]
    pub max_cpu_percent: Option<f64>,
    /// Initial connection pool capacity.
    #[serde(default)]
    pub max_connections: Option<u32>,
}

fn default_true() -> bool {
    true
}
fn default_port_env() -> String {
    "PORT".to_string()
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_max_restarts() -> u32 {
    5
}
fn default_restart_delay_ms() -> u64 {
    5_000
}
fn default_startup_attempts() -> u32 {
    30
}
fn default_startup_poll_interval_ms() -> u64 {
    1_000
}
fn default_health_timeout_ms() -> u64 {
    5_000
}
fn default_stop_grace_ms() -> u64 {
    5_000
}

impl WorkerConfig {
    /// A config with every optional field at its default.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            script: None,
            args: Vec::new(),
            env: HashMap::new(),
            port_env: default_port_env(),
            health_path: default_health_path(),
            health_url: None,
            priority: StartPriority::default(),
            auto_restart: default_true(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            startup_attempts: default_startup_attempts(),
            startup_poll_interval_ms: default_startup_poll_interval_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            max_memory_mb: None,
            max_cpu_percent: None,
            max_connections: None,
        }
    }

    /// The file that must exist before the worker can launch: the script if
    /// one is configured, else the command when it is given as a path.
    pub fn launch_artifact(&self) -> Option<&Path> {
        if let Some(script) = &self.script {
            return Some(script);
        }
        let command = Path::new(&self.command);
        (command.components().count() > 1).then_some(command)
    }

    /// Command-line arguments with `{port}` substituted.
    pub fn resolved_args(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        let mut args = Vec::with_capacity(self.args.len() + 1);
        if let Some(script) = &self.script {
            args.push(script.display().to_string());
        }
        args.extend(self.args.iter().map(|arg| arg.replace("{port}", &port)));
        args
    }

    pub fn health_url_for(&self, port: u16) -> String {
        let template = match &self.health_url {
            Some(url) => url.clone(),
            None => format!("http://127.0.0.1:{{port}}{}", self.health_path),
        };
        template.replace("{port}", &port.to_string())
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Coordinator-wide settings plus the static worker registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Last port of the range, inclusive.
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_max_concurrent_startups")]
    pub max_concurrent_startups: usize,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Consecutive failed health checks before a worker is restarted.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_pool_growth_factor")]
    pub pool_growth_factor: f64,
    #[serde(default = "default_max_pool_capacity")]
    pub max_pool_capacity: u32,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

fn default_port_range_start() -> u16 {
    3100
}
fn default_port_range_end() -> u16 {
    3199
}
fn default_max_concurrent_startups() -> usize {
    3
}
fn default_health_check_interval_secs() -> u64 {
    30
}
/// Consecutive failed health checks after which a worker counts as unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

fn default_unhealthy_threshold() -> u32 {
    DEFAULT_UNHEALTHY_THRESHOLD
}
fn default_pool_growth_factor() -> f64 {
    1.5
}
fn default_max_pool_capacity() -> u32 {
    200
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            max_concurrent_startups: default_max_concurrent_startups(),
            health_check_interval_secs: default_health_check_interval_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
            pool_growth_factor: default_pool_growth_factor(),
            max_pool_capacity: default_max_pool_capacity(),
            workers: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config: WorkerConfig =
            serde_json::from_str(r#"{"name":"embedder","command":"node"}"#).unwrap();
        assert_eq!(config.port_env, "PORT");
        assert_eq!(config.health_path, "/health");
        assert_eq!(config.priority, StartPriority::Normal);
        assert!(config.auto_restart);
        assert_eq!(config.max_restarts, 5);
        assert_eq!(config.startup_attempts, 30);
        assert_eq!(config.health_url_for(3105), "http://127.0.0.1:3105/health");
    }

    #[test]
    fn test_port_substitution() {
        let mut config = WorkerConfig::new("w", "node");
        config.script = Some(PathBuf::from("workers/w.js"));
        config.args = vec!["--port={port}".into(), "--quiet".into()];
        config.health_url = Some("http://localhost:{port}/ready".into());

        assert_eq!(
            config.resolved_args(3150),
            vec!["workers/w.js", "--port=3150", "--quiet"]
        );
        assert_eq!(config.health_url_for(3150), "http://localhost:3150/ready");
    }

    #[test]
    fn test_launch_artifact() {
        let bare = WorkerConfig::new("a", "node");
        assert!(bare.launch_artifact().is_none());

        let path = WorkerConfig::new("b", "/opt/bin/worker");
        assert_eq!(path.launch_artifact(), Some(Path::new("/opt/bin/worker")));

        let mut script = WorkerConfig::new("c", "python3");
        script.script = Some(PathBuf::from("w.py"));
        assert_eq!(script.launch_artifact(), Some(Path::new("w.py")));
    }

    #[test]
    fn test_priority_order() {
        assert!(StartPriority::High > StartPriority::Normal);
        assert!(StartPriority::Normal > StartPriority::Low);
        let p: StartPriority = serde_json::from_str(r#""high""#).unwrap();
        assert_eq!(p, StartPriority::High);
    }

    #[test]
    fn test_coordinator_defaults() {
        let config: CoordinatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port_range_start, 3100);
        assert_eq!(config.port_range_end, 3199);
        assert_eq!(config.max_concurrent_startups, 3);
        assert_eq!(config.unhealthy_threshold, 3);
        assert!((config.pool_growth_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.max_pool_capacity, 200);
    }
}
