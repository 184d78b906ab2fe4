use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` alias using [`WeftError`].
pub type WeftResult<T> = Result<T, WeftError>;

/// Coarse classification of a failure, used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection refused/reset, DNS, socket errors.
    Network,
    /// Deadlines and timeouts.
    Timeout,
    /// Malformed or rejected input.
    Validation,
    /// Memory, disk, quota exhaustion.
    Resource,
    /// Access denied.
    Permission,
    /// A required module, package, or upstream step is missing.
    Dependency,
    /// Host-level failure.
    System,
    /// Bad input supplied by a human operator.
    UserInput,
    /// The external worker process crashed or misbehaved.
    WorkerServer,
    /// Anything that matched no other category.
    Unknown,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::Validation,
        ErrorCategory::Resource,
        ErrorCategory::Permission,
        ErrorCategory::Dependency,
        ErrorCategory::System,
        ErrorCategory::UserInput,
        ErrorCategory::WorkerServer,
        ErrorCategory::Unknown,
    ];
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::System => "system",
            ErrorCategory::UserInput => "user_input",
            ErrorCategory::WorkerServer => "worker_server",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Top-level error type for the Weft runtime.
///
/// Most variants name the subsystem that produced the error. The structured
/// variants carry data callers are expected to match on.
#[derive(Error, Debug)]
pub enum WeftError {
    /// A worker supervisor or coordinator failure.
    #[error("Worker error: {0}")]
    Worker(String),

    /// A worker failed to become healthy.
    #[error("Startup error: {0}")]
    Startup(String),

    /// The worker's launch script or executable does not exist.
    #[error("Launch artifact not found: {}", .0.display())]
    LaunchArtifactMissing(PathBuf),

    /// Every port in the configured range is reserved.
    #[error("No free port in range {start}-{end}")]
    PortsExhausted {
        /// First port of the range.
        start: u16,
        /// Last port of the range (inclusive).
        end: u16,
    },

    /// The coordinator has no worker registered under this name.
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    /// A cache tier failure.
    #[error("Cache error: {0}")]
    Cache(String),

    /// A scheduler failure (rejected submission, cyclic graph, dropped task).
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A workflow bookkeeping failure (unknown workflow or step, bad state).
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Reading or writing a checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// The step's circuit breaker is open.
    #[error("Circuit breaker open for step '{step_id}'")]
    CircuitOpen {
        /// Step whose breaker rejected the attempt.
        step_id: String,
    },

    /// A unit of work failed. `category` is set when the work knows why.
    #[error("{message}")]
    Step {
        /// Explicit classification, if the work supplied one.
        category: Option<ErrorCategory>,
        /// Human-readable failure message.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WeftError {
    /// A step failure with no explicit category; it will be classified from
    /// its message.
    pub fn step(message: impl Into<String>) -> Self {
        WeftError::Step {
            category: None,
            message: message.into(),
        }
    }

    /// A step failure with an explicit category.
    pub fn categorized(category: ErrorCategory, message: impl Into<String>) -> Self {
        WeftError::Step {
            category: Some(category),
            message: message.into(),
        }
    }
}
