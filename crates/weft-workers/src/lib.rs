//! External worker process management for Weft.
//!
//! Each worker is an external process (a Node or Python service, say) that
//! serves an HTTP health endpoint on a port assigned from a shared range.
//!
//! # Main types
//!
//! - [`WorkerSupervisor`] — Launches one worker, waits for health, stops it, restarts it after crashes.
//! - [`Coordinator`] — Registry of supervisors with a priority startup queue, health sweeps, and resource optimisation.
//! - [`PortPool`] — Port reservations over a fixed range.
//! - [`HealthProbe`] — Timed HTTP health probe that also reads resource metrics.
//! - [`WorkerEvent`] — Lifecycle notifications.

/// Worker and coordinator configuration.
pub mod config;
/// Lifecycle coordinator.
pub mod coordinator;
/// Worker lifecycle events.
pub mod events;
/// HTTP health probing.
pub mod health;
/// Port reservations.
pub mod ports;
mod startup_queue;
/// Per-worker process supervisor.
pub mod supervisor;

pub use config::{CoordinatorConfig, StartPriority, WorkerConfig, DEFAULT_UNHEALTHY_THRESHOLD};
pub use coordinator::{Coordinator, OptimizationAction, OptimizationKind};
pub use events::WorkerEvent;
pub use health::{HealthProbe, WorkerMetrics};
pub use ports::PortPool;
pub use supervisor::{WorkerState, WorkerStatus, WorkerSupervisor};
