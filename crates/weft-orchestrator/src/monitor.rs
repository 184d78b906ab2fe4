use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Durations kept per step id.
pub const DURATION_WINDOW: usize = 100;

/// How far past its thresholds a step is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Mean above the average threshold.
    Warning,
    /// Slowest run above the peak threshold.
    Critical,
}

/// A step that runs slower than the configured thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub step_id: String,
    pub mean_ms: u64,
    pub max_ms: u64,
    pub samples: usize,
    pub severity: Severity,
}

/// Duration summary for one step id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub step_id: String,
    pub mean_ms: u64,
    pub max_ms: u64,
    pub samples: usize,
}

/// Tracks recent step durations and reports bottlenecks.
pub struct StepMonitor {
    samples: Arc<RwLock<HashMap<String, VecDeque<Duration>>>>,
}

impl StepMonitor {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record one observed duration, keeping only the latest
    /// [`DURATION_WINDOW`] per step.
    pub async fn record(&self, step_id: &str, duration: Duration) {
        let mut samples = self.samples.write().await;
        let window = samples.entry(step_id.to_string()).or_default();
        if window.len() == DURATION_WINDOW {
            window.pop_front();
        }
        window.push_back(duration);
    }

    pub async fn stats(&self, step_id: &str) -> Option<DurationStats> {
        let samples = self.samples.read().await;
        samples.get(step_id).and_then(|w| summarize(step_id, w))
    }

    /// Summaries for every step, sorted by id.
    pub async fn snapshot(&self) -> Vec<DurationStats> {
        let samples = self.samples.read().await;
        let mut all: Vec<DurationStats> = samples
            .iter()
            .filter_map(|(id, w)| summarize(id, w))
            .collect();
        all.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        all
    }

    /// Steps whose mean exceeds `avg_threshold` or whose slowest run exceeds
    /// `max_threshold`, worst first.
    pub async fn bottlenecks(&self, avg_threshold: Duration, max_threshold: Duration) -> Vec<Bottleneck> {
        let avg_ms = avg_threshold.as_millis() as u64;
        let max_ms = max_threshold.as_millis() as u64;
        let mut found: Vec<Bottleneck> = self
            .snapshot()
            .await
            .into_iter()
            .filter_map(|s| {
                let severity = if s.max_ms > max_ms {
                    Severity::Critical
                } else if s.mean_ms > avg_ms {
                    Severity::Warning
                } else {
                    return None;
                };
                Some(Bottleneck {
                    step_id: s.step_id,
                    mean_ms: s.mean_ms,
                    max_ms: s.max_ms,
                    samples: s.samples,
                    severity,
                })
            })
            .collect();
        found.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.mean_ms.cmp(&a.mean_ms))
                .then(b.max_ms.cmp(&a.max_ms))
        });
        found
    }

    /// Serialize the current summaries as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "steps": self.snapshot().await })
    }
}

impl Default for StepMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(step_id: &str, window: &VecDeque<Duration>) -> Option<DurationStats> {
    if window.is_empty() {
        return None;
    }
    let total: Duration = window.iter().sum();
    let max = window.iter().max().copied().unwrap_or_default();
    Some(DurationStats {
        step_id: step_id.to_string(),
        mean_ms: (total / window.len() as u32).as_millis() as u64,
        max_ms: max.as_millis() as u64,
        samples: window.len(),
    })
}
