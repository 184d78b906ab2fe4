use crate::scheduler::Scheduler;
use crate::task_queue::has_cycle;
use crate::tracker::{ProgressTracker, RecoveryOutcome};
use crate::types::{work_fn, RecoveryStrategy, StepDefinition, TaskSpec, WorkFn, WorkflowSnapshot};
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use weft_cache::Cache;
use weft_core::{WeftError, WeftResult};

/// One executable step of a [`WorkflowDefinition`].
#[derive(Clone)]
pub struct WorkflowStep {
    /// Progress and recovery settings handed to the tracker.
    pub definition: StepDefinition,
    pub depends_on: Vec<String>,
    pub priority: i32,
    pub work: WorkFn,
    /// When set and the runner has a cache, a cached value under this key
    /// stands in for running the work.
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, weight: f64, work: WorkFn) -> Self {
        Self {
            definition: StepDefinition::new(id, weight),
            depends_on: Vec::new(),
            priority: 0,
            work,
            cache_key: None,
            cache_ttl: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>, ttl: Option<Duration>) -> Self {
        self.cache_key = Some(key.into());
        self.cache_ttl = ttl;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.definition.name = Some(name.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.definition = self.definition.with_max_retries(max_retries);
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryStrategy) -> Self {
        self.definition = self.definition.with_recovery(recovery);
        self
    }

    pub fn with_fallback_value(mut self, value: Value) -> Self {
        self.definition = self.definition.with_fallback_value(value);
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.definition = self.definition.with_worker(worker);
        self
    }
}

impl std::fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("definition", &self.definition)
            .field("depends_on", &self.depends_on)
            .field("priority", &self.priority)
            .field("cache_key", &self.cache_key)
            .finish_non_exhaustive()
    }
}

/// A workflow the [`WorkflowRunner`] can execute.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Step ids must be unique, every dependency must name a step of this
    /// workflow, and the dependency graph must be acyclic.
    pub fn validate(&self) -> WeftResult<()> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id()) {
                return Err(WeftError::Workflow(format!(
                    "Workflow '{}' declares step '{}' twice",
                    self.id,
                    step.id()
                )));
            }
        }
        for step in &self.steps {
            if let Some(missing) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(WeftError::Workflow(format!(
                    "Step '{}' depends on unknown step '{missing}'",
                    step.id()
                )));
            }
        }
        let graph: HashMap<String, Vec<String>> = self
            .steps
            .iter()
            .map(|s| (s.id().to_string(), s.depends_on.clone()))
            .collect();
        if has_cycle(&graph) {
            return Err(WeftError::Workflow(format!(
                "Dependency cycle detected in workflow '{}'",
                self.id
            )));
        }
        Ok(())
    }

    fn step_definitions(&self) -> Vec<StepDefinition> {
        self.steps.iter().map(|s| s.definition.clone()).collect()
    }
}

/// Runs workflows: each step becomes a scheduler task whose failures are
/// routed through the tracker's recovery.
///
/// The scheduler's own retry budget is always zero, so a step is retried
/// only when the tracker says so.
pub struct WorkflowRunner {
    scheduler: Arc<Scheduler>,
    tracker: Arc<ProgressTracker>,
    cache: Option<Arc<Cache>>,
}

impl WorkflowRunner {
    pub fn new(
        scheduler: Arc<Scheduler>,
        tracker: Arc<ProgressTracker>,
        cache: Option<Arc<Cache>>,
    ) -> Self {
        Self {
            scheduler,
            tracker,
            cache,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Run every step and return the final snapshot. A failed workflow is
    /// still `Ok`; its snapshot carries the status and error list.
    pub async fn run(&self, definition: WorkflowDefinition) -> WeftResult<WorkflowSnapshot> {
        definition.validate()?;
        info!(workflow = %definition.id, steps = definition.steps.len(), "Runner: starting workflow");
        self.tracker
            .initialize_workflow(&definition.id, definition.name.clone(), definition.step_definitions())
            .await?;
        self.execute(definition, HashSet::new()).await
    }

    /// Run only the steps the stored checkpoint does not list as completed.
    /// Without a checkpoint this is the same as [`run`](Self::run).
    pub async fn resume(&self, definition: WorkflowDefinition) -> WeftResult<WorkflowSnapshot> {
        definition.validate()?;
        self.tracker
            .initialize_workflow(&definition.id, definition.name.clone(), definition.step_definitions())
            .await?;
        let completed: HashSet<String> = match self.tracker.resume_from_checkpoint(&definition.id).await? {
            Some(checkpoint) => checkpoint.completed_steps.into_iter().collect(),
            None => {
                info!(workflow = %definition.id, "Runner: no checkpoint, running from the start");
                HashSet::new()
            }
        };
        self.execute(definition, completed).await
    }

    /// Cancel a running workflow. Steps that have not started yet never run.
    pub async fn cancel(&self, workflow_id: &str) -> WeftResult<()> {
        self.tracker.cancel_workflow(workflow_id).await
    }

    async fn execute(
        &self,
        definition: WorkflowDefinition,
        completed: HashSet<String>,
    ) -> WeftResult<WorkflowSnapshot> {
        let start = Instant::now();
        let workflow_id = definition.id;
        // scheduler ids are global, so every run gets its own namespace
        let run_id = Uuid::new_v4().simple().to_string();
        let run_prefix = format!("{workflow_id}/{run_id}/");
        let task_id = |step: &str| format!("{run_prefix}{step}");

        let mut specs = Vec::new();
        for step in definition.steps {
            if completed.contains(step.id()) {
                self.scheduler.mark_completed(task_id(step.id()));
                continue;
            }
            let spec_id = task_id(step.id());
            let dependencies: Vec<String> = step.depends_on.iter().map(|d| task_id(d)).collect();
            let priority = step.priority;
            let task = Arc::new(StepTask {
                tracker: Arc::clone(&self.tracker),
                cache: self.cache.clone(),
                workflow_id: workflow_id.clone(),
                step,
            });
            let work = work_fn(move || {
                let task = Arc::clone(&task);
                async move { task.run().await }
            });
            specs.push(
                TaskSpec::new(spec_id, work)
                    .with_priority(priority)
                    .with_dependencies(dependencies)
                    .with_max_retries(0),
            );
        }

        info!(
            workflow = %workflow_id,
            scheduled = specs.len(),
            skipped = completed.len(),
            "Runner: submitting steps"
        );
        let handles = match self.scheduler.add_all(specs) {
            Ok(handles) => handles,
            Err(e) => {
                warn!(workflow = %workflow_id, error = %e, "Runner: scheduler rejected workflow");
                self.scheduler.forget(&run_prefix);
                if let Err(cancel_err) = self.tracker.cancel_workflow(&workflow_id).await {
                    debug!(workflow = %workflow_id, error = %cancel_err, "Runner: cancel after rejection failed");
                }
                return Err(e);
            }
        };

        let failed = join_all(handles)
            .await
            .into_iter()
            .filter(|result| result.is_err())
            .count();
        // every task of this run is settled; keep the scheduler's records bounded
        self.scheduler.forget(&run_prefix);

        let snapshot = self
            .tracker
            .workflow(&workflow_id)
            .await
            .ok_or_else(|| WeftError::Workflow(format!("Workflow '{workflow_id}' disappeared")))?;
        info!(
            workflow = %workflow_id,
            status = %snapshot.status,
            progress = snapshot.overall_progress,
            failed_tasks = failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Runner: workflow finished"
        );
        Ok(snapshot)
    }
}

struct StepTask {
    tracker: Arc<ProgressTracker>,
    cache: Option<Arc<Cache>>,
    workflow_id: String,
    step: WorkflowStep,
}

impl StepTask {
    async fn run(&self) -> WeftResult<Value> {
        let workflow_id = self.workflow_id.as_str();
        let step_id = self.step.id();
        self.tracker.start_step(workflow_id, step_id).await?;

        loop {
            let error = match self.attempt().await {
                Ok(value) => {
                    self.tracker
                        .complete_step(workflow_id, step_id, Some(value.clone()))
                        .await?;
                    return Ok(value);
                }
                Err(e) => e,
            };
            match self.tracker.fail_step(workflow_id, step_id, &error).await? {
                RecoveryOutcome::Retry { attempt } => {
                    debug!(workflow = workflow_id, step = step_id, attempt, "Runner: retrying step");
                }
                RecoveryOutcome::Fallback(value) => return Ok(value.unwrap_or(Value::Null)),
                RecoveryOutcome::Skipped => return Ok(Value::Null),
                RecoveryOutcome::WorkflowFailed(record) => {
                    return Err(WeftError::categorized(record.category, record.message))
                }
                RecoveryOutcome::Cancelled => {
                    return Err(WeftError::Workflow(format!(
                        "Workflow '{workflow_id}' was cancelled"
                    )))
                }
            }
        }
    }

    async fn attempt(&self) -> WeftResult<Value> {
        let work = Arc::clone(&self.step.work);
        let call = async move {
            match AssertUnwindSafe(work()).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(WeftError::step("step work panicked")),
            }
        };
        match (&self.cache, &self.step.cache_key) {
            (Some(cache), Some(key)) => cache.get_or_compute(key, self.step.cache_ttl, || call).await,
            _ => call.await,
        }
    }
}
