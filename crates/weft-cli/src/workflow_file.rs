//! Workflow files: TOML documents whose steps are external commands.
//!
//! ```toml
//! id = "nightly-report"
//!
//! [[steps]]
//! id = "fetch"
//! weight = 0.4
//! command = "curl"
//! args = ["-sf", "https://example.com/data.json"]
//! cache_key = "fetch:data.json"
//!
//! [[steps]]
//! id = "render"
//! weight = 0.6
//! depends_on = ["fetch"]
//! command = "./render.sh"
//! recovery = "skip"
//! ```
//!
//! A step's stdout becomes its result: parsed as JSON when it is JSON,
//! otherwise kept as a trimmed string.

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use weft_core::{WeftError, WeftResult};
use weft_orchestrator::{work_fn, RecoveryStrategy, WorkflowDefinition, WorkflowStep};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<CommandStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandStep {
    pub id: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// Worker to restart when this step fails with a worker-side error.
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub recovery: Option<RecoveryStrategy>,
    /// Result to record if the step fails. Implies `recovery = "fallback"`
    /// unless `recovery` says otherwise.
    #[serde(default)]
    pub fallback: Option<Value>,
}

fn default_weight() -> f64 {
    1.0
}

impl WorkflowFile {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read workflow file '{}': {e}", path.display())
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn into_definition(self) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(self.id);
        if let Some(name) = self.name {
            definition = definition.with_name(name);
        }
        for step in self.steps {
            definition = definition.step(step.into_step());
        }
        definition
    }
}

impl CommandStep {
    fn into_step(self) -> WorkflowStep {
        let command = Arc::new(self.clone());
        let work = work_fn(move || {
            let command = Arc::clone(&command);
            async move { command.run().await }
        });

        let mut step = WorkflowStep::new(self.id, self.weight, work)
            .depends_on(self.depends_on)
            .with_priority(self.priority);
        if let Some(key) = self.cache_key {
            step = step.with_cache_key(key, self.cache_ttl_secs.map(Duration::from_secs));
        }
        if let Some(worker) = self.worker {
            step = step.with_worker(worker);
        }
        if let Some(max_retries) = self.max_retries {
            step = step.with_max_retries(max_retries);
        }
        if let Some(value) = self.fallback {
            step = step.with_fallback_value(value);
        }
        if let Some(recovery) = self.recovery {
            step = step.with_recovery(recovery);
        }
        step
    }

    /// Run the command once and turn its stdout into the step result.
    pub async fn run(&self) -> WeftResult<Value> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        debug!(step = %self.id, command = %self.command, args = ?self.args, "Running step command");

        let output = match self.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), cmd.output())
                .await
                .map_err(|_| {
                    WeftError::Timeout(format!("Step '{}' timed out after {secs}s", self.id))
                })??,
            None => cmd.output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WeftError::step(format!(
                "`{}` failed ({}): {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }
}
