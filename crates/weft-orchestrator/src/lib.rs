//! Workflow execution for Weft: a priority and dependency aware task
//! scheduler, weighted progress tracking, error classification with
//! recovery, per-step circuit breakers, and checkpoints to resume from.
//!
//! # Main types
//!
//! - [`Scheduler`] — Concurrency-limited executor with adaptive scaling and cached batches.
//! - [`ProgressTracker`] — Step progress, failure recovery, and checkpointing per workflow.
//! - [`WorkflowRunner`] — Runs a [`WorkflowDefinition`] through the scheduler and tracker.
//! - [`ErrorClassifier`] — Maps failures to an error category and default recovery policy.
//! - [`CheckpointStore`] — Persistence for checkpoints, on disk or in memory.
//! - [`StepMonitor`] — Step duration windows and bottleneck reports.

/// Checkpoint documents and stores.
pub mod checkpoint;
/// Per-step circuit breakers.
pub mod circuit_breaker;
/// Step duration monitoring.
pub mod monitor;
/// Host resource sampling for adaptive scaling.
pub mod probe;
/// Weighted progress over step trees.
pub mod progress;
/// Error classification and recovery policies.
pub mod recovery;
/// Workflow runner.
pub mod runner;
/// Task scheduler.
pub mod scheduler;
mod task_queue;
/// Progress and recovery tracker.
pub mod tracker;
/// Shared task and workflow types.
pub mod types;

pub use checkpoint::{
    checkpoint_file_name, Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakers, CircuitState};
pub use monitor::{Bottleneck, DurationStats, Severity, StepMonitor, DURATION_WINDOW};
pub use probe::{FixedProbe, ResourceProbe, ResourceSample, SystemProbe};
pub use recovery::{compute_backoff, ErrorClassifier, RecoveryPolicy};
pub use runner::{WorkflowDefinition, WorkflowRunner, WorkflowStep};
pub use scheduler::{BatchOptions, Scheduler, SchedulerConfig, SchedulerStats, TaskEvent, TaskHandle};
pub use task_queue::has_cycle;
pub use tracker::{ProgressTracker, RecoveryOutcome, TrackerConfig, WorkflowEvent};
pub use types::{
    work_fn, ProgressStep, RecoveryStrategy, StepAnnotation, StepDefinition, StepStatus,
    TaskSpec, TaskStatus, WorkFn, WorkflowError, WorkflowSnapshot, WorkflowStatus,
};
