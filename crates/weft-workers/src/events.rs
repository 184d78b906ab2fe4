/// Observable worker lifecycle activity.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker passed its startup health check.
    Started { worker: String, pid: Option<u32>, port: u16 },
    Stopped { worker: String },
    Error { worker: String, message: String },
    /// The process ended on its own. `code` is `None` when killed by a signal.
    Exited { worker: String, code: Option<i32> },
    Restarted { worker: String, restart_count: u32 },
    HealthCheckFailed { worker: String, consecutive_failures: u32 },
    /// CPU over budget; what throttling means is up to the subscriber.
    ThrottleRequested { worker: String, cpu_percent: f64, limit: f64 },
    PoolExpanded { worker: String, from: u32, to: u32 },
}

impl WorkerEvent {
    /// Name of the worker the event is about.
    pub fn worker(&self) -> &str {
        match self {
            WorkerEvent::Started { worker, .. }
            | WorkerEvent::Stopped { worker }
            | WorkerEvent::Error { worker, .. }
            | WorkerEvent::Exited { worker, .. }
            | WorkerEvent::Restarted { worker, .. }
            | WorkerEvent::HealthCheckFailed { worker, .. }
            | WorkerEvent::ThrottleRequested { worker, .. }
            | WorkerEvent::PoolExpanded { worker, .. } => worker,
        }
    }
}
