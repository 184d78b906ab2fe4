use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
use crate::circuit_breaker::{CircuitBreakers, CircuitState};
use crate::monitor::{Bottleneck, StepMonitor};
use crate::progress;
use crate::recovery::{compute_backoff, ErrorClassifier, RecoveryPolicy};
use crate::types::{
    ProgressStep, RecoveryStrategy, StepAnnotation, StepDefinition, StepStatus, WorkflowError,
    WorkflowSnapshot, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use weft_core::{
    ErrorCategory, EventBus, EventSubscription, RestartRequest, WeftError, WeftResult,
};

/// Tracker configuration (the `[tracker]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Base of the exponential retry backoff.
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub breaker_timeout_secs: u64,
    /// Mean step duration above which a step is reported.
    #[serde(default = "default_bottleneck_avg")]
    pub bottleneck_avg_secs: u64,
    /// Single-run duration above which a step is reported as critical.
    #[serde(default = "default_bottleneck_max")]
    pub bottleneck_max_secs: u64,
    #[serde(default = "default_bottleneck_interval")]
    pub bottleneck_interval_secs: u64,
    /// How long to wait for a worker restart to be confirmed.
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,
}

fn default_base_retry_delay() -> u64 {
    1000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    60
}

fn default_bottleneck_avg() -> u64 {
    30
}

fn default_bottleneck_max() -> u64 {
    60
}

fn default_bottleneck_interval() -> u64 {
    60
}

fn default_restart_timeout() -> u64 {
    30
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_ms: default_base_retry_delay(),
            breaker_threshold: default_breaker_threshold(),
            breaker_timeout_secs: default_breaker_timeout(),
            bottleneck_avg_secs: default_bottleneck_avg(),
            bottleneck_max_secs: default_bottleneck_max(),
            bottleneck_interval_secs: default_bottleneck_interval(),
            restart_timeout_secs: default_restart_timeout(),
        }
    }
}

impl TrackerConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

/// Workflow lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    Initialized {
        workflow_id: String,
        steps: usize,
    },
    StepStarted {
        workflow_id: String,
        step_id: String,
    },
    ProgressUpdated {
        workflow_id: String,
        step_id: String,
        progress: f64,
        overall: f64,
    },
    StepCompleted {
        workflow_id: String,
        step_id: String,
    },
    StepFailed {
        workflow_id: String,
        step_id: String,
        category: ErrorCategory,
        message: String,
    },
    RecoveryAttempted {
        workflow_id: String,
        step_id: String,
        strategy: RecoveryStrategy,
        attempt: u32,
    },
    StepRetried {
        workflow_id: String,
        step_id: String,
        retry_count: u32,
        delay: Duration,
    },
    FallbackUsed {
        workflow_id: String,
        step_id: String,
    },
    StepSkipped {
        workflow_id: String,
        step_id: String,
    },
    WorkflowCompleted {
        workflow_id: String,
    },
    WorkflowFailed {
        workflow_id: String,
        step_id: String,
        reason: String,
    },
    WorkflowCancelled {
        workflow_id: String,
    },
    WorkflowResumed {
        workflow_id: String,
        completed_steps: usize,
    },
    BottlenecksDetected {
        bottlenecks: Vec<Bottleneck>,
    },
}

/// What the caller should do after [`ProgressTracker::fail_step`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Run the step's work again. Any backoff has already elapsed.
    Retry { attempt: u32 },
    /// The step was completed with its fallback value.
    Fallback(Option<Value>),
    /// The step was completed without a result.
    Skipped,
    /// Recovery gave up and the workflow is failed.
    WorkflowFailed(WorkflowError),
    /// The workflow was cancelled while recovery was in progress.
    Cancelled,
}

struct WorkflowState {
    id: String,
    name: Option<String>,
    status: WorkflowStatus,
    steps: Vec<ProgressStep>,
    errors: Vec<WorkflowError>,
    current_step: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    fn new(id: &str, name: Option<String>, steps: &[StepDefinition]) -> Self {
        Self {
            id: id.to_string(),
            name,
            status: WorkflowStatus::Pending,
            steps: steps.iter().map(ProgressStep::from_definition).collect(),
            errors: Vec::new(),
            current_step: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn overall_progress(&self) -> f64 {
        progress::overall_progress(&self.steps)
    }

    fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            steps: self.steps.clone(),
            overall_progress: self.overall_progress(),
            errors: self.errors.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            workflow_id: self.id.clone(),
            timestamp: Utc::now(),
            completed_steps: progress::completed_ids(&self.steps),
            current_step: self.current_step.clone(),
            overall_progress: self.overall_progress(),
            errors: self.errors.clone(),
        }
    }

    fn step_mut(&mut self, step_id: &str) -> WeftResult<&mut ProgressStep> {
        let workflow_id = &self.id;
        progress::find_mut(&mut self.steps, step_id).ok_or_else(|| {
            WeftError::Workflow(format!(
                "Workflow '{workflow_id}' has no step '{step_id}'"
            ))
        })
    }

    /// Mark a step completed along with its unfinished substeps, then close
    /// any ancestor whose substeps are now all terminal. Returns how long
    /// the step ran.
    fn finish_step(
        &mut self,
        step_id: &str,
        annotation: Option<StepAnnotation>,
        result: Option<Value>,
    ) -> WeftResult<Option<Duration>> {
        let now = Utc::now();
        let step = self.step_mut(step_id)?;
        step.status = StepStatus::Completed;
        step.progress = 100.0;
        step.completed_at = Some(now);
        step.annotation = annotation;
        step.result = result;
        for child in &mut step.substeps {
            progress::for_each_mut(child, &mut |s| {
                if !s.status.is_terminal() {
                    s.status = StepStatus::Completed;
                    s.progress = 100.0;
                    s.completed_at = Some(now);
                }
            });
        }
        let elapsed = step
            .started_at
            .and_then(|start| (now - start).to_std().ok());

        let mut child = step_id.to_string();
        while let Some(parent_id) = progress::parent_of(&self.steps, &child) {
            let parent = self.step_mut(&parent_id)?;
            if parent.status.is_terminal() || !progress::all_terminal(&parent.substeps) {
                break;
            }
            parent.status = StepStatus::Completed;
            parent.progress = 100.0;
            parent.completed_at = Some(now);
            child = parent_id;
        }
        Ok(elapsed)
    }

    /// Outcome to report when recovery finds the workflow already finished.
    fn interrupted(&self) -> RecoveryOutcome {
        match (self.status, self.errors.last()) {
            (WorkflowStatus::Failed, Some(last)) => RecoveryOutcome::WorkflowFailed(last.clone()),
            _ => RecoveryOutcome::Cancelled,
        }
    }
}

type Workflows = HashMap<String, WorkflowState>;

fn get_mut<'a>(workflows: &'a mut Workflows, workflow_id: &str) -> WeftResult<&'a mut WorkflowState> {
    workflows
        .get_mut(workflow_id)
        .ok_or_else(|| WeftError::Workflow(format!("Unknown workflow '{workflow_id}'")))
}

/// Like [`get_mut`], but a finished workflow is an error.
fn active_mut<'a>(workflows: &'a mut Workflows, workflow_id: &str) -> WeftResult<&'a mut WorkflowState> {
    let state = get_mut(workflows, workflow_id)?;
    if state.status.is_terminal() {
        return Err(WeftError::Workflow(format!(
            "Workflow '{workflow_id}' is {}",
            state.status
        )));
    }
    Ok(state)
}

enum Persist {
    Save(Checkpoint),
    Delete(String),
}

/// Weighted progress tracking, failure classification, recovery, and
/// checkpointing for workflows.
///
/// Every step-affecting call writes the workflow's checkpoint. Completion
/// deletes it; failure keeps it so the workflow can be resumed.
pub struct ProgressTracker {
    config: TrackerConfig,
    workflows: RwLock<Workflows>,
    store: Arc<dyn CheckpointStore>,
    /// Taken before the workflow lock is released so checkpoint writes land
    /// in the order the state changed.
    save_lock: Mutex<()>,
    breakers: parking_lot::Mutex<CircuitBreakers>,
    classifier: ErrorClassifier,
    monitor: StepMonitor,
    events: EventBus<WorkflowEvent>,
    restart_requests: EventBus<RestartRequest>,
    next_request_id: AtomicU64,
    bottleneck_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ProgressTracker {
    pub fn new(config: TrackerConfig, store: Arc<dyn CheckpointStore>) -> Self {
        let breakers = CircuitBreakers::new(config.breaker_threshold, config.breaker_timeout());
        Self {
            config,
            workflows: RwLock::new(HashMap::new()),
            store,
            save_lock: Mutex::new(()),
            breakers: parking_lot::Mutex::new(breakers),
            classifier: ErrorClassifier::new(),
            monitor: StepMonitor::new(),
            events: EventBus::default(),
            restart_requests: EventBus::default(),
            next_request_id: AtomicU64::new(1),
            bottleneck_loop: parking_lot::Mutex::new(None),
        }
    }

    /// A tracker whose checkpoints live only in memory.
    pub fn in_memory(config: TrackerConfig) -> Self {
        Self::new(config, Arc::new(InMemoryCheckpointStore::new()))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> EventSubscription<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Restart requests raised by `restart_worker` recovery. Hand this to
    /// the worker coordinator.
    pub fn subscribe_restart_requests(&self) -> EventSubscription<RestartRequest> {
        self.restart_requests.subscribe()
    }

    pub fn monitor(&self) -> &StepMonitor {
        &self.monitor
    }

    pub fn circuit_state(&self, step_id: &str) -> CircuitState {
        self.breakers.lock().state(step_id)
    }

    pub fn classify(&self, error: &WeftError) -> ErrorCategory {
        self.classifier.classify(error)
    }

    /// Register a workflow with every step `pending`.
    ///
    /// Weights must lie in (0, 1] and step ids must be unique across the
    /// tree. An id still in use by an unfinished workflow is rejected.
    pub async fn initialize_workflow(
        &self,
        workflow_id: &str,
        name: Option<String>,
        steps: Vec<StepDefinition>,
    ) -> WeftResult<WorkflowSnapshot> {
        progress::validate(&steps)?;
        let snapshot = {
            let mut workflows = self.workflows.write().await;
            if let Some(existing) = workflows.get(workflow_id) {
                if !existing.status.is_terminal() {
                    return Err(WeftError::Workflow(format!(
                        "Workflow '{workflow_id}' is already {}",
                        existing.status
                    )));
                }
            }
            let state = WorkflowState::new(workflow_id, name, &steps);
            let snapshot = state.snapshot();
            workflows.insert(workflow_id.to_string(), state);
            snapshot
        };
        info!(workflow = workflow_id, steps = steps.len(), "Workflow initialized");
        self.events.publish(WorkflowEvent::Initialized {
            workflow_id: workflow_id.to_string(),
            steps: steps.len(),
        });
        Ok(snapshot)
    }

    pub async fn start_step(&self, workflow_id: &str, step_id: &str) -> WeftResult<()> {
        let mut workflows = self.workflows.write().await;
        let state = active_mut(&mut workflows, workflow_id)?;
        let now = Utc::now();

        let step = state.step_mut(step_id)?;
        if step.status.is_terminal() {
            return Err(WeftError::Workflow(format!(
                "Step '{step_id}' is already {}",
                step.status
            )));
        }
        step.status = StepStatus::InProgress;
        step.started_at.get_or_insert(now);

        if let Some(parent_id) = progress::parent_of(&state.steps, step_id) {
            let parent = state.step_mut(&parent_id)?;
            if parent.status == StepStatus::Pending {
                parent.status = StepStatus::InProgress;
                parent.started_at = Some(now);
            }
        }
        state.status = WorkflowStatus::Running;
        state.started_at.get_or_insert(now);
        state.current_step = Some(step_id.to_string());
        let checkpoint = state.checkpoint();

        debug!(workflow = workflow_id, step = step_id, "Step started");
        self.events.publish(WorkflowEvent::StepStarted {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
        });
        self.persist(workflows, Persist::Save(checkpoint)).await;
        Ok(())
    }

    /// Set a step's progress (clamped to 0..=100). Returns the workflow's
    /// overall progress.
    pub async fn update_step_progress(
        &self,
        workflow_id: &str,
        step_id: &str,
        progress: f64,
    ) -> WeftResult<f64> {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 100.0)
        };
        let overall = {
            let mut workflows = self.workflows.write().await;
            let state = active_mut(&mut workflows, workflow_id)?;
            state.step_mut(step_id)?.progress = progress;
            state.overall_progress()
        };
        self.events.publish(WorkflowEvent::ProgressUpdated {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            progress,
            overall,
        });
        Ok(overall)
    }

    /// Mark a step completed. When every top-level step is terminal the
    /// workflow is finalized and its checkpoint deleted.
    pub async fn complete_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        result: Option<Value>,
    ) -> WeftResult<()> {
        self.breakers.lock().record_success(step_id);
        self.settle_step(workflow_id, step_id, None, result).await
    }

    async fn settle_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        annotation: Option<StepAnnotation>,
        result: Option<Value>,
    ) -> WeftResult<()> {
        let mut workflows = self.workflows.write().await;
        let state = active_mut(&mut workflows, workflow_id)?;
        let elapsed = state.finish_step(step_id, annotation, result)?;

        let finished = progress::all_terminal(&state.steps);
        let action = if finished {
            state.status = if state.steps.iter().any(|s| s.status == StepStatus::Failed) {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            };
            state.completed_at = Some(Utc::now());
            state.current_step = None;
            Persist::Delete(workflow_id.to_string())
        } else {
            Persist::Save(state.checkpoint())
        };
        let status = state.status;

        debug!(workflow = workflow_id, step = step_id, ?annotation, "Step completed");
        self.events.publish(WorkflowEvent::StepCompleted {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
        });
        if finished {
            info!(workflow = workflow_id, %status, "Workflow finished");
            self.events.publish(WorkflowEvent::WorkflowCompleted {
                workflow_id: workflow_id.to_string(),
            });
        }
        self.persist(workflows, action).await;

        if let Some(elapsed) = elapsed {
            self.monitor.record(step_id, elapsed).await;
        }
        Ok(())
    }

    /// Record a step failure and run recovery.
    ///
    /// The error is classified and appended to the workflow's error list.
    /// The step's circuit breaker is consulted before the failure counts
    /// against it; an open breaker, a non-recoverable category, or exhausted
    /// retries fail the workflow. `retry` and `restart_worker` sleep through
    /// the backoff before returning [`RecoveryOutcome::Retry`].
    pub async fn fail_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        error: &WeftError,
    ) -> WeftResult<RecoveryOutcome> {
        let category = self.classifier.classify(error);
        let policy = RecoveryPolicy::for_category(category);
        let message = error.to_string();

        let (strategy, recoverable, max_retries, worker) = {
            let mut workflows = self.workflows.write().await;
            let state = active_mut(&mut workflows, workflow_id)?;
            let step = state.step_mut(step_id)?;
            let strategy = step.recovery.unwrap_or(policy.strategy);
            let recoverable = policy.recoverable || step.recovery.is_some();
            let max_retries = step.max_retries.unwrap_or(policy.max_retries);
            let worker = step.worker.clone();
            step.status = StepStatus::Recovering;
            let record = WorkflowError {
                category,
                message: message.clone(),
                step_id: step_id.to_string(),
                strategy,
                recoverable,
                retry_count: step.retry_count,
                max_retries,
                occurred_at: Utc::now(),
            };
            state.errors.push(record);
            state.current_step = Some(step_id.to_string());
            let checkpoint = state.checkpoint();

            warn!(
                workflow = workflow_id,
                step = step_id,
                %category,
                %strategy,
                error = %message,
                "Step failed"
            );
            self.events.publish(WorkflowEvent::StepFailed {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
                category,
                message: message.clone(),
            });
            self.persist(workflows, Persist::Save(checkpoint)).await;
            (strategy, recoverable, max_retries, worker)
        };

        loop {
            if !self.breakers.lock().check_and_record(step_id) {
                return self
                    .fail_workflow(
                        workflow_id,
                        step_id,
                        format!("Circuit breaker open for step '{step_id}'"),
                    )
                    .await;
            }
            if !recoverable {
                return self
                    .fail_workflow(
                        workflow_id,
                        step_id,
                        format!("Non-recoverable {category} error: {message}"),
                    )
                    .await;
            }
            match strategy {
                RecoveryStrategy::ManualIntervention | RecoveryStrategy::FailFast => {
                    return self
                        .fail_workflow(
                            workflow_id,
                            step_id,
                            format!("{category} error requires {strategy}: {message}"),
                        )
                        .await;
                }
                RecoveryStrategy::Fallback => {
                    return self
                        .finish_by_recovery(workflow_id, step_id, StepAnnotation::UsedFallback)
                        .await;
                }
                RecoveryStrategy::Skip => {
                    return self
                        .finish_by_recovery(workflow_id, step_id, StepAnnotation::Skipped)
                        .await;
                }
                RecoveryStrategy::Retry | RecoveryStrategy::RestartWorker => {}
            }

            let retry_count = {
                let mut workflows = self.workflows.write().await;
                match active_mut(&mut workflows, workflow_id) {
                    Ok(state) => Some(state.step_mut(step_id)?.retry_count),
                    Err(_) => None,
                }
            };
            let Some(retry_count) = retry_count else {
                return self.interrupted(workflow_id).await;
            };
            if retry_count >= max_retries {
                return self
                    .fail_workflow(
                        workflow_id,
                        step_id,
                        format!("Retries exhausted after {retry_count} attempts: {message}"),
                    )
                    .await;
            }

            info!(
                workflow = workflow_id,
                step = step_id,
                %strategy,
                attempt = retry_count + 1,
                max_retries,
                "Attempting recovery"
            );
            self.events.publish(WorkflowEvent::RecoveryAttempted {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
                strategy,
                attempt: retry_count + 1,
            });

            if strategy == RecoveryStrategy::RestartWorker {
                if let Err(e) = self
                    .request_restart(workflow_id, step_id, worker.clone())
                    .await
                {
                    warn!(
                        workflow = workflow_id,
                        step = step_id,
                        error = %e,
                        "Worker restart failed"
                    );
                    // a failed restart uses up one retry and counts against the breaker
                    let mut workflows = self.workflows.write().await;
                    if let Ok(state) = active_mut(&mut workflows, workflow_id) {
                        state.step_mut(step_id)?.retry_count += 1;
                    }
                    continue;
                }
            }

            return self.retry_after_backoff(workflow_id, step_id, retry_count).await;
        }
    }

    async fn retry_after_backoff(
        &self,
        workflow_id: &str,
        step_id: &str,
        retry_count: u32,
    ) -> WeftResult<RecoveryOutcome> {
        let delay = compute_backoff(self.config.base_retry_delay(), retry_count);
        let still_active = {
            let mut workflows = self.workflows.write().await;
            match active_mut(&mut workflows, workflow_id) {
                Ok(state) => {
                    state.step_mut(step_id)?.status = StepStatus::Retrying;
                    true
                }
                Err(_) => false,
            }
        };
        if !still_active {
            return self.interrupted(workflow_id).await;
        }
        debug!(
            workflow = workflow_id,
            step = step_id,
            delay_ms = delay.as_millis() as u64,
            "Backing off before retry"
        );
        tokio::time::sleep(delay).await;

        let mut workflows = self.workflows.write().await;
        if active_mut(&mut workflows, workflow_id).is_err() {
            drop(workflows);
            return self.interrupted(workflow_id).await;
        }
        let state = active_mut(&mut workflows, workflow_id)?;
        let step = state.step_mut(step_id)?;
        step.retry_count += 1;
        step.status = StepStatus::InProgress;
        let attempt = step.retry_count;
        let checkpoint = state.checkpoint();

        self.events.publish(WorkflowEvent::StepRetried {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            retry_count: attempt,
            delay,
        });
        self.persist(workflows, Persist::Save(checkpoint)).await;
        Ok(RecoveryOutcome::Retry { attempt })
    }

    async fn finish_by_recovery(
        &self,
        workflow_id: &str,
        step_id: &str,
        annotation: StepAnnotation,
    ) -> WeftResult<RecoveryOutcome> {
        let value = {
            let mut workflows = self.workflows.write().await;
            match active_mut(&mut workflows, workflow_id) {
                Ok(state) => Ok(match annotation {
                    StepAnnotation::UsedFallback => state.step_mut(step_id)?.fallback_value.clone(),
                    _ => None,
                }),
                Err(e) => Err(e),
            }
        };
        let Ok(value) = value else {
            return self.interrupted(workflow_id).await;
        };

        let event = match annotation {
            StepAnnotation::UsedFallback => WorkflowEvent::FallbackUsed {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
            },
            _ => WorkflowEvent::StepSkipped {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
            },
        };
        info!(workflow = workflow_id, step = step_id, ?annotation, "Step finished by recovery");
        self.events.publish(event);
        self.settle_step(workflow_id, step_id, Some(annotation), value.clone())
            .await?;

        Ok(match annotation {
            StepAnnotation::UsedFallback => RecoveryOutcome::Fallback(value),
            _ => RecoveryOutcome::Skipped,
        })
    }

    async fn fail_workflow(
        &self,
        workflow_id: &str,
        step_id: &str,
        reason: String,
    ) -> WeftResult<RecoveryOutcome> {
        let mut workflows = self.workflows.write().await;
        let state = get_mut(&mut workflows, workflow_id)?;
        if state.status.is_terminal() {
            return Ok(state.interrupted());
        }
        state.step_mut(step_id)?.status = StepStatus::Failed;
        state.status = WorkflowStatus::Failed;
        state.completed_at = Some(Utc::now());
        let last = state.errors.last().cloned().ok_or_else(|| {
            WeftError::Workflow(format!("Workflow '{workflow_id}' failed without an error"))
        })?;
        let checkpoint = state.checkpoint();

        error!(workflow = workflow_id, step = step_id, %reason, "Workflow failed");
        self.events.publish(WorkflowEvent::WorkflowFailed {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            reason,
        });
        self.persist(workflows, Persist::Save(checkpoint)).await;
        Ok(RecoveryOutcome::WorkflowFailed(last))
    }

    async fn interrupted(&self, workflow_id: &str) -> WeftResult<RecoveryOutcome> {
        let workflows = self.workflows.read().await;
        workflows
            .get(workflow_id)
            .map(WorkflowState::interrupted)
            .ok_or_else(|| WeftError::Workflow(format!("Unknown workflow '{workflow_id}'")))
    }

    /// Publish a restart request and wait for the coordinator's answer.
    /// With nobody listening there is nothing to wait for.
    async fn request_restart(
        &self,
        workflow_id: &str,
        step_id: &str,
        worker: Option<String>,
    ) -> WeftResult<()> {
        if self.restart_requests.subscriber_count() == 0 {
            warn!(
                workflow = workflow_id,
                step = step_id,
                "No restart handler subscribed, retrying without a restart"
            );
            return Ok(());
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (request, reply) = RestartRequest::new(request_id, worker.clone(), workflow_id, step_id);
        info!(request_id, ?worker, workflow = workflow_id, step = step_id, "Requesting worker restart");
        self.restart_requests.publish(request);

        match tokio::time::timeout(self.config.restart_timeout(), reply).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(WeftError::Worker(message)),
            Ok(Err(_)) => Err(WeftError::Worker(format!(
                "Restart request {request_id} was dropped unanswered"
            ))),
            Err(_) => Err(WeftError::Timeout(format!(
                "Restart request {request_id} got no reply within {:?}",
                self.config.restart_timeout()
            ))),
        }
    }

    /// Cancel every unfinished step and discard the checkpoint. Cancelling
    /// twice is a no-op; cancelling a completed or failed workflow is an
    /// error.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> WeftResult<()> {
        let mut workflows = self.workflows.write().await;
        let state = get_mut(&mut workflows, workflow_id)?;
        match state.status {
            WorkflowStatus::Cancelled => return Ok(()),
            WorkflowStatus::Completed | WorkflowStatus::Failed => {
                return Err(WeftError::Workflow(format!(
                    "Workflow '{workflow_id}' is already {}",
                    state.status
                )))
            }
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
        }
        let mut cancelled = 0usize;
        for step in &mut state.steps {
            progress::for_each_mut(step, &mut |s| {
                if !s.status.is_terminal() {
                    s.status = StepStatus::Cancelled;
                    cancelled += 1;
                }
            });
        }
        state.status = WorkflowStatus::Cancelled;
        state.completed_at = Some(Utc::now());
        state.current_step = None;

        info!(workflow = workflow_id, cancelled, "Workflow cancelled");
        self.events.publish(WorkflowEvent::WorkflowCancelled {
            workflow_id: workflow_id.to_string(),
        });
        self.persist(workflows, Persist::Delete(workflow_id.to_string()))
            .await;
        Ok(())
    }

    /// Reload the stored checkpoint into an initialized workflow: completed
    /// steps are restored and the error list replaced. Returns `None` when
    /// no checkpoint exists.
    ///
    /// Overall progress is recomputed from the restored steps. A step that
    /// was part-way through when the checkpoint was written starts again from
    /// zero, so the result can be lower than the checkpoint's
    /// `overall_progress`.
    pub async fn resume_from_checkpoint(&self, workflow_id: &str) -> WeftResult<Option<Checkpoint>> {
        let Some(checkpoint) = self.store.load(workflow_id).await? else {
            return Ok(None);
        };
        {
            let mut workflows = self.workflows.write().await;
            let state = get_mut(&mut workflows, workflow_id)?;
            for step_id in &checkpoint.completed_steps {
                match progress::find_mut(&mut state.steps, step_id) {
                    Some(step) => {
                        step.status = StepStatus::Completed;
                        step.progress = 100.0;
                        step.annotation = Some(StepAnnotation::Restored);
                        step.completed_at = Some(checkpoint.timestamp);
                    }
                    None => warn!(
                        workflow = workflow_id,
                        step = %step_id,
                        "Checkpoint names a step the workflow does not have"
                    ),
                }
            }
            state.errors = checkpoint.errors.clone();
            state.current_step = checkpoint.current_step.clone();
            state.status = WorkflowStatus::Running;
            state.completed_at = None;
            state.started_at.get_or_insert(checkpoint.timestamp);
        }
        info!(
            workflow = workflow_id,
            completed = checkpoint.completed_steps.len(),
            progress = checkpoint.overall_progress,
            "Workflow resumed from checkpoint"
        );
        self.events.publish(WorkflowEvent::WorkflowResumed {
            workflow_id: workflow_id.to_string(),
            completed_steps: checkpoint.completed_steps.len(),
        });
        Ok(Some(checkpoint))
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<WorkflowSnapshot> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .map(WorkflowState::snapshot)
    }

    /// Snapshots of every known workflow, sorted by id.
    pub async fn workflows(&self) -> Vec<WorkflowSnapshot> {
        let workflows = self.workflows.read().await;
        let mut all: Vec<WorkflowSnapshot> = workflows.values().map(WorkflowState::snapshot).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Run one bottleneck pass, publishing the result when anything is slow.
    pub async fn analyze_bottlenecks(&self) -> Vec<Bottleneck> {
        let found = self
            .monitor
            .bottlenecks(
                Duration::from_secs(self.config.bottleneck_avg_secs),
                Duration::from_secs(self.config.bottleneck_max_secs),
            )
            .await;
        if !found.is_empty() {
            warn!(
                count = found.len(),
                worst = %found[0].step_id,
                "Bottlenecks detected"
            );
            self.events.publish(WorkflowEvent::BottlenecksDetected {
                bottlenecks: found.clone(),
            });
        }
        found
    }

    /// Spawn the periodic bottleneck pass. Calling it again replaces the
    /// running loop.
    pub fn start_bottleneck_analysis(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.config.bottleneck_interval_secs.max(1));
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tracker) = weak.upgrade() else {
                    break;
                };
                tracker.analyze_bottlenecks().await;
            }
        });
        if let Some(previous) = self.bottleneck_loop.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.bottleneck_loop.lock().take() {
            handle.abort();
            info!("Bottleneck analysis stopped");
        }
    }

    async fn persist(&self, workflows: RwLockWriteGuard<'_, Workflows>, action: Persist) {
        let _order = self.save_lock.lock().await;
        drop(workflows);
        match action {
            Persist::Save(checkpoint) => {
                if let Err(e) = self.store.save(&checkpoint).await {
                    error!(workflow = %checkpoint.workflow_id, error = %e, "Failed to save checkpoint");
                }
            }
            Persist::Delete(workflow_id) => match self.store.delete(&workflow_id).await {
                Ok(true) => debug!(workflow = %workflow_id, "Checkpoint deleted"),
                Ok(false) => {}
                Err(e) => error!(workflow = %workflow_id, error = %e, "Failed to delete checkpoint"),
            },
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.bottleneck_loop.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tracker() -> (Arc<ProgressTracker>, Arc<InMemoryCheckpointStore>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let tracker = ProgressTracker::new(
            TrackerConfig {
                base_retry_delay_ms: 10,
                ..TrackerConfig::default()
            },
            store.clone(),
        );
        (Arc::new(tracker), store)
    }

    fn three_steps() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new("fetch", 0.25),
            StepDefinition::new("parse", 0.25),
            StepDefinition::new("render", 0.5),
        ]
    }

    #[test]
    fn test_config_defaults() {
        let config: TrackerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.base_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.breaker_threshold, 5);
        assert_eq!(config.breaker_timeout(), Duration::from_secs(60));
        assert_eq!(config.restart_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_weights_and_duplicates() {
        let (tracker, _) = tracker();
        assert!(tracker
            .initialize_workflow("wf", None, vec![StepDefinition::new("a", 0.0)])
            .await
            .is_err());
        tracker.initialize_workflow("wf", None, three_steps()).await.unwrap();
        assert!(tracker.initialize_workflow("wf", None, three_steps()).await.is_err());
    }

    #[tokio::test]
    async fn test_progress_and_completion_lifecycle() {
        let (tracker, store) = tracker();
        let mut events = tracker.subscribe();
        tracker
            .initialize_workflow("wf", Some("report".into()), three_steps())
            .await
            .unwrap();

        tracker.start_step("wf", "fetch").await.unwrap();
        assert!(store.load("wf").await.unwrap().is_some());
        let overall = tracker.update_step_progress("wf", "fetch", 50.0).await.unwrap();
        assert!((overall - 12.5).abs() < 1e-9);

        tracker.complete_step("wf", "fetch", Some(Value::from("body"))).await.unwrap();
        let checkpoint = store.load("wf").await.unwrap().unwrap();
        assert_eq!(checkpoint.completed_steps, vec!["fetch"]);
        assert!((checkpoint.overall_progress - 25.0).abs() < 1e-9);

        for step in ["parse", "render"] {
            tracker.start_step("wf", step).await.unwrap();
            tracker.complete_step("wf", step, None).await.unwrap();
        }
        let snapshot = tracker.workflow("wf").await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.overall_progress, 100.0);
        assert_eq!(snapshot.step("fetch").unwrap().result, Some(Value::from("body")));
        assert!(store.load("wf").await.unwrap().is_none());

        let seen = events.drain();
        assert!(matches!(seen.first(), Some(WorkflowEvent::Initialized { steps: 3, .. })));
        assert!(matches!(seen.last(), Some(WorkflowEvent::WorkflowCompleted { .. })));
        assert!(tracker.start_step("wf", "fetch").await.is_err());
    }

    #[tokio::test]
    async fn test_substeps_roll_up_into_parent() {
        let (tracker, _) = tracker();
        tracker
            .initialize_workflow(
                "wf",
                None,
                vec![StepDefinition::new("batch", 1.0).with_substeps(vec![
                    StepDefinition::new("part-1", 1.0),
                    StepDefinition::new("part-2", 1.0),
                ])],
            )
            .await
            .unwrap();
        tracker.start_step("wf", "part-1").await.unwrap();
        assert_eq!(
            tracker.workflow("wf").await.unwrap().step("batch").unwrap().status,
            StepStatus::InProgress
        );
        tracker.complete_step("wf", "part-1", None).await.unwrap();
        assert_eq!(tracker.workflow("wf").await.unwrap().overall_progress, 50.0);

        tracker.start_step("wf", "part-2").await.unwrap();
        tracker.complete_step("wf", "part-2", None).await.unwrap();
        let snapshot = tracker.workflow("wf").await.unwrap();
        assert_eq!(snapshot.step("batch").unwrap().status, StepStatus::Completed);
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_network_error_retries_with_backoff() {
        let (tracker, _) = tracker();
        tracker.initialize_workflow("wf", None, three_steps()).await.unwrap();
        tracker.start_step("wf", "fetch").await.unwrap();

        let error = WeftError::step("ECONNRESET while reading body");
        for attempt in 1..=3 {
            let outcome = tracker.fail_step("wf", "fetch", &error).await.unwrap();
            assert_eq!(outcome, RecoveryOutcome::Retry { attempt });
        }
        let outcome = tracker.fail_step("wf", "fetch", &error).await.unwrap();
        let RecoveryOutcome::WorkflowFailed(last) = outcome else {
            panic!("expected workflow failure, got {outcome:?}");
        };
        assert_eq!(last.category, ErrorCategory::Network);
        assert_eq!(last.retry_count, 3);
        assert_eq!(last.max_retries, 3);

        let snapshot = tracker.workflow("wf").await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Failed);
        assert_eq!(snapshot.errors.len(), 4);
        assert_eq!(snapshot.step("fetch").unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_non_recoverable_category_fails_immediately() {
        let (tracker, store) = tracker();
        tracker.initialize_workflow("wf", None, three_steps()).await.unwrap();
        tracker.start_step("wf", "fetch").await.unwrap();
        tracker.complete_step("wf", "fetch", None).await.unwrap();
        tracker.start_step("wf", "parse").await.unwrap();

        let outcome = tracker
            .fail_step("wf", "parse", &WeftError::step("invalid document structure"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RecoveryOutcome::WorkflowFailed(WorkflowError {
                category: ErrorCategory::Validation,
                strategy: RecoveryStrategy::ManualIntervention,
                recoverable: false,
                ..
            })
        ));
        // completed work survives in the checkpoint
        let checkpoint = store.load("wf").await.unwrap().unwrap();
        assert_eq!(checkpoint.completed_steps, vec!["fetch"]);
        assert_eq!(checkpoint.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_and_skip_overrides() {
        let (tracker, _) = tracker();
        tracker
            .initialize_workflow(
                "wf",
                None,
                vec![
                    StepDefinition::new("thumb", 0.5).with_fallback_value(Value::from("placeholder.png")),
                    StepDefinition::new("lint", 0.5).with_recovery(RecoveryStrategy::Skip),
                ],
            )
            .await
            .unwrap();

        tracker.start_step("wf", "thumb").await.unwrap();
        let outcome = tracker
            .fail_step("wf", "thumb", &WeftError::step("invalid image"))
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Fallback(Some(Value::from("placeholder.png"))));

        tracker.start_step("wf", "lint").await.unwrap();
        let outcome = tracker
            .fail_step("wf", "lint", &WeftError::step("Segmentation fault"))
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Skipped);

        let snapshot = tracker.workflow("wf").await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert_eq!(
            snapshot.step("thumb").unwrap().annotation,
            Some(StepAnnotation::UsedFallback)
        );
        assert_eq!(snapshot.step("lint").unwrap().annotation, Some(StepAnnotation::Skipped));
        assert_eq!(snapshot.errors.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_rejects_sixth_failure() {
        let (tracker, _) = tracker();
        tracker
            .initialize_workflow(
                "wf",
                None,
                vec![StepDefinition::new("slow", 1.0).with_max_retries(10)],
            )
            .await
            .unwrap();
        tracker.start_step("wf", "slow").await.unwrap();

        let error = WeftError::step("operation timeout");
        for attempt in 1..=5 {
            let outcome = tracker.fail_step("wf", "slow", &error).await.unwrap();
            assert_eq!(outcome, RecoveryOutcome::Retry { attempt });
        }
        assert_eq!(tracker.circuit_state("slow"), CircuitState::Open);

        let outcome = tracker.fail_step("wf", "slow", &error).await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::WorkflowFailed(_)));
        let snapshot = tracker.workflow("wf").await.unwrap();
        assert_eq!(snapshot.step("slow").unwrap().retry_count, 5);
        assert_eq!(snapshot.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_restart_worker_round_trip() {
        let (tracker, _) = tracker();
        let mut requests = tracker.subscribe_restart_requests();
        let server = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            assert_eq!(request.worker.as_deref(), Some("embedder"));
            assert_eq!(request.step_id, "embed");
            request.respond(Ok(()));
        });

        tracker
            .initialize_workflow(
                "wf",
                None,
                vec![StepDefinition::new("embed", 1.0).with_worker("embedder")],
            )
            .await
            .unwrap();
        tracker.start_step("wf", "embed").await.unwrap();
        let outcome = tracker
            .fail_step("wf", "embed", &WeftError::step("worker crashed unexpectedly"))
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Retry { attempt: 1 });
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_restart_consumes_retries() {
        let (tracker, _) = tracker();
        let mut requests = tracker.subscribe_restart_requests();
        let server = tokio::spawn(async move {
            let mut served = 0;
            while let Some(request) = requests.recv().await {
                request.respond(Err("spawn failed".into()));
                served += 1;
                if served == 2 {
                    break;
                }
            }
            served
        });

        tracker
            .initialize_workflow("wf", None, vec![StepDefinition::new("embed", 1.0)])
            .await
            .unwrap();
        tracker.start_step("wf", "embed").await.unwrap();
        let outcome = tracker
            .fail_step(
                "wf",
                "embed",
                &WeftError::categorized(ErrorCategory::Resource, "heap limit"),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RecoveryOutcome::WorkflowFailed(_)));
        assert_eq!(server.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restart_without_listener_just_retries() {
        let (tracker, _) = tracker();
        tracker
            .initialize_workflow("wf", None, vec![StepDefinition::new("embed", 1.0)])
            .await
            .unwrap();
        tracker.start_step("wf", "embed").await.unwrap();
        let outcome = tracker
            .fail_step("wf", "embed", &WeftError::step("503 Service Unavailable"))
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Retry { attempt: 1 });
    }

    #[tokio::test]
    async fn test_cancel_marks_unfinished_steps() {
        let (tracker, store) = tracker();
        tracker.initialize_workflow("wf", None, three_steps()).await.unwrap();
        tracker.start_step("wf", "fetch").await.unwrap();
        tracker.complete_step("wf", "fetch", None).await.unwrap();
        tracker.start_step("wf", "parse").await.unwrap();

        tracker.cancel_workflow("wf").await.unwrap();
        tracker.cancel_workflow("wf").await.unwrap();
        let snapshot = tracker.workflow("wf").await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
        assert_eq!(snapshot.step("fetch").unwrap().status, StepStatus::Completed);
        assert_eq!(snapshot.step("parse").unwrap().status, StepStatus::Cancelled);
        assert_eq!(snapshot.step("render").unwrap().status, StepStatus::Cancelled);
        assert!(store.load("wf").await.unwrap().is_none());
        assert!(tracker.start_step("wf", "render").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let tracker = Arc::new(ProgressTracker::new(
            TrackerConfig {
                base_retry_delay_ms: 200,
                ..TrackerConfig::default()
            },
            store,
        ));
        tracker.initialize_workflow("wf", None, three_steps()).await.unwrap();
        tracker.start_step("wf", "fetch").await.unwrap();

        let failing = Arc::clone(&tracker);
        let recovery = tokio::spawn(async move {
            failing
                .fail_step("wf", "fetch", &WeftError::step("connection refused"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.cancel_workflow("wf").await.unwrap();
        assert_eq!(recovery.await.unwrap().unwrap(), RecoveryOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_resume_restores_completed_steps() {
        let (tracker, store) = tracker();
        tracker.initialize_workflow("wf", None, three_steps()).await.unwrap();
        tracker.start_step("wf", "fetch").await.unwrap();
        tracker.complete_step("wf", "fetch", None).await.unwrap();
        tracker.start_step("wf", "parse").await.unwrap();
        tracker
            .fail_step("wf", "parse", &WeftError::step("permission denied"))
            .await
            .unwrap();
        let saved = store.load("wf").await.unwrap().unwrap();

        // a fresh process picks up the same store
        let resumed = ProgressTracker::new(TrackerConfig::default(), store.clone());
        resumed.initialize_workflow("wf", None, three_steps()).await.unwrap();
        let checkpoint = resumed.resume_from_checkpoint("wf").await.unwrap().unwrap();
        assert_eq!(checkpoint.completed_steps, saved.completed_steps);

        let snapshot = resumed.workflow("wf").await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Running);
        assert_eq!(snapshot.step("fetch").unwrap().annotation, Some(StepAnnotation::Restored));
        assert!((snapshot.overall_progress - saved.overall_progress).abs() < 1e-9);
        assert_eq!(snapshot.errors.len(), 1);

        assert!(resumed.resume_from_checkpoint("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_drops_partial_step_progress() {
        let (tracker, store) = tracker();
        tracker.initialize_workflow("wf", None, three_steps()).await.unwrap();
        tracker.start_step("wf", "render").await.unwrap();
        tracker.update_step_progress("wf", "render", 50.0).await.unwrap();
        tracker.start_step("wf", "fetch").await.unwrap();
        tracker.complete_step("wf", "fetch", None).await.unwrap();
        let saved = store.load("wf").await.unwrap().unwrap();
        assert!((saved.overall_progress - 50.0).abs() < 1e-9);

        let resumed = ProgressTracker::new(TrackerConfig::default(), store.clone());
        resumed.initialize_workflow("wf", None, three_steps()).await.unwrap();
        resumed.resume_from_checkpoint("wf").await.unwrap().unwrap();

        let snapshot = resumed.workflow("wf").await.unwrap();
        assert_eq!(snapshot.step("render").unwrap().status, StepStatus::Pending);
        assert!((snapshot.overall_progress - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_bottleneck_pass_publishes() {
        let (tracker, _) = tracker();
        let mut events = tracker.subscribe();
        tracker.monitor().record("render", Duration::from_secs(45)).await;
        tracker.monitor().record("fetch", Duration::from_secs(2)).await;

        let found = tracker.analyze_bottlenecks().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].step_id, "render");
        assert!(matches!(
            events.try_recv(),
            Some(WorkflowEvent::BottlenecksDetected { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_step() {
        let (tracker, _) = tracker();
        assert!(tracker.start_step("nope", "a").await.is_err());
        tracker.initialize_workflow("wf", None, three_steps()).await.unwrap();
        assert!(tracker.start_step("wf", "nope").await.is_err());
        assert!(tracker.cancel_workflow("nope").await.is_err());
    }
}
