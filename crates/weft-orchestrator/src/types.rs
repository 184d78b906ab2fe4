use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use weft_core::{ErrorCategory, WeftResult};

/// A zero-argument unit of work. It may be invoked more than once when the
/// task is retried.
pub type WorkFn = Arc<dyn Fn() -> BoxFuture<'static, WeftResult<Value>> + Send + Sync>;

/// Wrap an async closure as a [`WorkFn`].
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WeftResult<Value>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// A unit of work submitted to the [`Scheduler`](crate::Scheduler).
#[derive(Clone)]
pub struct TaskSpec {
    pub id: String,
    /// Higher runs first.
    pub priority: i32,
    pub dependencies: Vec<String>,
    /// How many times the scheduler re-enqueues the task after a failure.
    pub max_retries: u32,
    pub work: WorkFn,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, work: WorkFn) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            dependencies: Vec::new(),
            max_retries: 0,
            work,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Status of a task in the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed { reason: String },
}

/// Status of one workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Starting,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    Recovering,
}

impl StepStatus {
    /// Completed, failed, and cancelled steps never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Starting => write!(f, "starting"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Cancelled => write!(f, "cancelled"),
            StepStatus::Retrying => write!(f, "retrying"),
            StepStatus::Recovering => write!(f, "recovering"),
        }
    }
}

/// Overall status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What recovery does with a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    RestartWorker,
    Fallback,
    Skip,
    ManualIntervention,
    FailFast,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStrategy::Retry => write!(f, "retry"),
            RecoveryStrategy::RestartWorker => write!(f, "restart_worker"),
            RecoveryStrategy::Fallback => write!(f, "fallback"),
            RecoveryStrategy::Skip => write!(f, "skip"),
            RecoveryStrategy::ManualIntervention => write!(f, "manual_intervention"),
            RecoveryStrategy::FailFast => write!(f, "fail_fast"),
        }
    }
}

/// A classified failure recorded against a workflow. Never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub category: ErrorCategory,
    pub message: String,
    pub step_id: String,
    pub strategy: RecoveryStrategy,
    pub recoverable: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Declaration of one step handed to
/// [`ProgressTracker::initialize_workflow`](crate::ProgressTracker::initialize_workflow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Share of the parent's progress, in (0, 1].
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Overrides the category's retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides the category's strategy.
    #[serde(default)]
    pub recovery: Option<RecoveryStrategy>,
    /// Result recorded when the `fallback` strategy completes the step.
    #[serde(default)]
    pub fallback_value: Option<Value>,
    /// Worker to restart when the step fails with a worker-side error.
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub substeps: Vec<StepDefinition>,
}

fn default_weight() -> f64 {
    1.0
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            name: None,
            weight,
            max_retries: None,
            recovery: None,
            fallback_value: None,
            worker: None,
            substeps: Vec::new(),
        }
    }

    pub fn with_substeps(mut self, substeps: Vec<StepDefinition>) -> Self {
        self.substeps = substeps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryStrategy) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_fallback_value(mut self, value: Value) -> Self {
        self.recovery = Some(RecoveryStrategy::Fallback);
        self.fallback_value = Some(value);
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }
}

/// How a step reached `completed` other than by its own work succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAnnotation {
    UsedFallback,
    Skipped,
    Restored,
}

/// Live state of one step, as reported in a [`WorkflowSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStep {
    pub id: String,
    pub name: Option<String>,
    pub weight: f64,
    pub status: StepStatus,
    /// 0 to 100.
    pub progress: f64,
    pub retry_count: u32,
    pub max_retries: Option<u32>,
    pub recovery: Option<RecoveryStrategy>,
    pub worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub annotation: Option<StepAnnotation>,
    pub result: Option<Value>,
    #[serde(skip)]
    pub(crate) fallback_value: Option<Value>,
    pub substeps: Vec<ProgressStep>,
}

impl ProgressStep {
    pub(crate) fn from_definition(def: &StepDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            weight: def.weight,
            status: StepStatus::Pending,
            progress: 0.0,
            retry_count: 0,
            max_retries: def.max_retries,
            recovery: def.recovery,
            worker: def.worker.clone(),
            started_at: None,
            completed_at: None,
            annotation: None,
            result: None,
            fallback_value: def.fallback_value.clone(),
            substeps: def.substeps.iter().map(ProgressStep::from_definition).collect(),
        }
    }

    /// Wall time between start and completion, if both are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Read-only view of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub status: WorkflowStatus,
    pub steps: Vec<ProgressStep>,
    pub overall_progress: f64,
    pub errors: Vec<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowSnapshot {
    /// Look up a top-level step or substep by id.
    pub fn step(&self, step_id: &str) -> Option<&ProgressStep> {
        fn find<'a>(steps: &'a [ProgressStep], id: &str) -> Option<&'a ProgressStep> {
            steps.iter().find_map(|s| {
                if s.id == id {
                    Some(s)
                } else {
                    find(&s.substeps, id)
                }
            })
        }
        find(&self.steps, step_id)
    }

    /// The most recent error, if any.
    pub fn last_error(&self) -> Option<&WorkflowError> {
        self.errors.last()
    }
}
