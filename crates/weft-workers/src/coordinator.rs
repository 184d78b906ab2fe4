use crate::config::{CoordinatorConfig, StartPriority};
use crate::events::WorkerEvent;
use crate::ports::PortPool;
use crate::startup_queue::StartupQueue;
use crate::supervisor::{WorkerState, WorkerStatus, WorkerSupervisor};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use weft_core::{EventBus, EventSubscription, RestartRequest, WeftError, WeftResult};

/// What `optimize_resources` did to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    Restart,
    Throttle,
    ExpandPool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationAction {
    pub worker: String,
    pub kind: OptimizationKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy)]
enum StartKind {
    Start,
    Restart,
}

struct StartRequest {
    supervisor: Arc<WorkerSupervisor>,
    kind: StartKind,
    reply: oneshot::Sender<WeftResult<u16>>,
}

/// Registry of named worker supervisors with bounded-concurrency startup,
/// periodic health sweeps, and resource-based optimisation.
pub struct Coordinator {
    config: CoordinatorConfig,
    ports: Arc<PortPool>,
    events: EventBus<WorkerEvent>,
    workers: BTreeMap<String, Arc<WorkerSupervisor>>,
    queue: parking_lot::Mutex<StartupQueue<StartRequest>>,
    startup_slots: Arc<Semaphore>,
    health_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build supervisors for every configured worker. Names must be unique.
    pub fn new(config: CoordinatorConfig) -> WeftResult<Self> {
        let ports = Arc::new(PortPool::new(config.port_range_start, config.port_range_end)?);
        let events = EventBus::default();

        let mut workers = BTreeMap::new();
        for worker in &config.workers {
            if workers.contains_key(&worker.name) {
                return Err(WeftError::Config(format!(
                    "Duplicate worker name '{}'",
                    worker.name
                )));
            }
            let supervisor = WorkerSupervisor::new(worker.clone(), ports.clone(), events.clone())
                .with_unhealthy_threshold(config.unhealthy_threshold);
            workers.insert(worker.name.clone(), Arc::new(supervisor));
        }

        info!(
            workers = workers.len(),
            ports = %format!("{}-{}", config.port_range_start, config.port_range_end),
            max_concurrent_startups = config.max_concurrent_startups,
            "Coordinator configured"
        );

        Ok(Self {
            startup_slots: Arc::new(Semaphore::new(config.max_concurrent_startups.max(1))),
            config,
            ports,
            events,
            workers,
            queue: parking_lot::Mutex::new(StartupQueue::new()),
            health_task: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Lifecycle events from every supervised worker.
    pub fn subscribe(&self) -> EventSubscription<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Reserve the first free port of the configured range.
    pub fn available_port(&self) -> WeftResult<u16> {
        self.ports.acquire()
    }

    pub fn worker(&self, name: &str) -> Option<&Arc<WorkerSupervisor>> {
        self.workers.get(name)
    }

    fn supervisor(&self, name: &str) -> WeftResult<Arc<WorkerSupervisor>> {
        self.workers
            .get(name)
            .cloned()
            .ok_or_else(|| WeftError::UnknownWorker(name.to_string()))
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Queue a startup and wait for its outcome. Returns the worker's port.
    pub async fn start_worker(self: &Arc<Self>, name: &str, priority: StartPriority) -> WeftResult<u16> {
        self.enqueue(name, priority, StartKind::Start).await
    }

    /// Stop and start a worker, counting the restart. Goes through the same
    /// startup queue as `start_worker`, at high priority.
    pub async fn restart_worker(self: &Arc<Self>, name: &str) -> WeftResult<u16> {
        self.enqueue(name, StartPriority::High, StartKind::Restart).await
    }

    /// Start every configured worker at its configured priority.
    pub async fn start_all(self: &Arc<Self>) -> Vec<(String, WeftResult<u16>)> {
        let starts = self.workers.values().map(|supervisor| {
            let name = supervisor.name().to_string();
            let priority = supervisor.config().priority;
            async move {
                let result = self.start_worker(&name, priority).await;
                (name, result)
            }
        });
        join_all(starts).await
    }

    pub async fn stop_worker(&self, name: &str) -> WeftResult<()> {
        self.supervisor(name)?.stop().await;
        Ok(())
    }

    async fn enqueue(self: &Arc<Self>, name: &str, priority: StartPriority, kind: StartKind) -> WeftResult<u16> {
        let supervisor = self.supervisor(name)?;
        let (reply, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock();
            queue.push(
                priority,
                StartRequest {
                    supervisor,
                    kind,
                    reply,
                },
            );
            debug!(worker = %name, ?priority, queued = queue.len(), "Startup queued");
        }
        self.drain();
        rx.await
            .map_err(|_| WeftError::Worker(format!("Startup of '{name}' was abandoned")))?
    }

    /// Launch queued startups while a startup slot is free.
    fn drain(self: &Arc<Self>) {
        loop {
            let Ok(permit) = self.startup_slots.clone().try_acquire_owned() else {
                return;
            };
            let Some(request) = self.queue.lock().pop() else {
                return;
            };
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let result = match request.kind {
                    StartKind::Start => request.supervisor.start().await,
                    StartKind::Restart => request.supervisor.restart().await,
                };
                if let Err(e) = &result {
                    warn!(worker = %request.supervisor.name(), error = %e, "Worker startup failed");
                }
                let _ = request.reply.send(result);
                drop(permit);
                coordinator.drain();
            });
        }
    }

    /// Health-check every running worker once. Workers reaching the unhealthy
    /// threshold go to `error` and are restarted when they allow it.
    pub async fn health_sweep(self: &Arc<Self>) {
        let running: Vec<Arc<WorkerSupervisor>> = self
            .workers
            .values()
            .filter(|w| w.state() == WorkerState::Running)
            .cloned()
            .collect();

        let checks = running.iter().map(|w| async move { (w, w.perform_health_check().await) });
        for (worker, healthy) in join_all(checks).await {
            if healthy {
                continue;
            }
            let failures = worker.consecutive_failures();
            if failures < self.config.unhealthy_threshold {
                continue;
            }
            if !worker.config().auto_restart {
                warn!(worker = %worker.name(), failures, "Worker unhealthy, auto-restart disabled");
                continue;
            }
            warn!(worker = %worker.name(), failures, "Worker unhealthy, restarting");
            if let Err(e) = self.restart_worker(worker.name()).await {
                error!(worker = %worker.name(), error = %e, "Restart of unhealthy worker failed");
            }
        }
    }

    /// Start the periodic health sweep. Replaces a running one.
    pub fn start_health_loop(self: &Arc<Self>) {
        let interval = self.config.health_check_interval();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.health_sweep().await;
            }
        });
        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Compare each running worker's last-known metrics with its ceilings.
    ///
    /// Memory over budget restarts the worker, CPU over budget publishes a
    /// throttle request, and a saturated connection pool grows by the
    /// configured factor up to the capacity cap.
    pub async fn optimize_resources(self: &Arc<Self>) -> Vec<OptimizationAction> {
        let mut actions = Vec::new();

        for worker in self.workers.values() {
            if worker.state() != WorkerState::Running {
                continue;
            }
            let Some(metrics) = worker.metrics() else {
                continue;
            };
            let config = worker.config();
            let name = worker.name().to_string();

            if let (Some(used), Some(limit)) = (metrics.memory_mb, config.max_memory_mb) {
                if used > limit {
                    info!(worker = %name, memory_mb = used, limit, "Memory over budget, restarting worker");
                    let detail = match self.restart_worker(&name).await {
                        Ok(port) => format!("memory {used:.1}MB > {limit:.1}MB, restarted on port {port}"),
                        Err(e) => format!("memory {used:.1}MB > {limit:.1}MB, restart failed: {e}"),
                    };
                    actions.push(OptimizationAction {
                        worker: name,
                        kind: OptimizationKind::Restart,
                        detail,
                    });
                    continue;
                }
            }

            if let (Some(cpu), Some(limit)) = (metrics.cpu_percent, config.max_cpu_percent) {
                if cpu > limit {
                    info!(worker = %name, cpu_percent = cpu, limit, "CPU over budget, requesting throttle");
                    self.events.publish(WorkerEvent::ThrottleRequested {
                        worker: name.clone(),
                        cpu_percent: cpu,
                        limit,
                    });
                    actions.push(OptimizationAction {
                        worker: name.clone(),
                        kind: OptimizationKind::Throttle,
                        detail: format!("cpu {cpu:.1}% > {limit:.1}%"),
                    });
                }
            }

            if let (Some(connections), Some(capacity)) = (metrics.connections, worker.pool_capacity()) {
                if connections >= capacity {
                    let grown = (f64::from(capacity) * self.config.pool_growth_factor).ceil() as u32;
                    let grown = grown.min(self.config.max_pool_capacity);
                    if grown > capacity {
                        worker.set_pool_capacity(grown);
                        info!(worker = %name, from = capacity, to = grown, "Connection pool expanded");
                        self.events.publish(WorkerEvent::PoolExpanded {
                            worker: name.clone(),
                            from: capacity,
                            to: grown,
                        });
                        actions.push(OptimizationAction {
                            worker: name,
                            kind: OptimizationKind::ExpandPool,
                            detail: format!("pool {capacity} -> {grown}"),
                        });
                    } else {
                        debug!(worker = %name, capacity, "Connection pool saturated at cap");
                    }
                }
            }
        }

        actions
    }

    /// Serve restart requests until every publisher is gone.
    pub fn serve_restart_requests(
        self: &Arc<Self>,
        mut requests: EventSubscription<RestartRequest>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                info!(
                    request_id = request.request_id,
                    worker = ?request.worker,
                    workflow = %request.workflow_id,
                    step = %request.step_id,
                    "Restart requested"
                );
                let result = coordinator.handle_restart_request(&request).await;
                if let Err(e) = &result {
                    warn!(request_id = request.request_id, error = %e, "Restart request failed");
                }
                request.respond(result.map_err(|e| e.to_string()));
            }
            debug!("Restart request channel closed");
        })
    }

    async fn handle_restart_request(self: &Arc<Self>, request: &RestartRequest) -> WeftResult<()> {
        if let Some(name) = &request.worker {
            return self.restart_worker(name).await.map(|_| ());
        }

        let failing: Vec<String> = self
            .workers
            .values()
            .filter(|w| {
                matches!(w.state(), WorkerState::Error | WorkerState::Recovery)
                    || w.consecutive_failures() > 0
            })
            .map(|w| w.name().to_string())
            .collect();
        if failing.is_empty() {
            debug!(request_id = request.request_id, "No failing workers to restart");
        }

        let mut first_error = None;
        for name in failing {
            if let Err(e) = self.restart_worker(&name).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.workers.values().map(|w| w.status()).collect()
    }

    /// Stop the health sweep, then every worker. Ports are released.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
        info!(workers = self.workers.len(), "Shutting down workers");
        join_all(self.workers.values().map(|w| w.stop())).await;
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.health_task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn health_server(body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    fn sleeper(name: &str, server: &MockServer) -> WorkerConfig {
        let mut config = WorkerConfig::new(name, "sleep");
        config.args = vec!["30".into()];
        config.health_url = Some(format!("{}/health", server.uri()));
        config.startup_attempts = 5;
        config.startup_poll_interval_ms = 20;
        config.stop_grace_ms = 500;
        config
    }

    fn coordinator(workers: Vec<WorkerConfig>, max_concurrent_startups: usize) -> Arc<Coordinator> {
        Arc::new(
            Coordinator::new(CoordinatorConfig {
                port_range_start: 4200,
                port_range_end: 4220,
                max_concurrent_startups,
                workers,
                ..CoordinatorConfig::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_unknown_worker() {
        let coord = coordinator(vec![], 1);
        let err = coord.start_worker("nope", StartPriority::Normal).await.unwrap_err();
        assert!(matches!(err, WeftError::UnknownWorker(name) if name == "nope"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let a = WorkerConfig::new("same", "sleep");
        let b = WorkerConfig::new("same", "sleep");
        let result = Coordinator::new(CoordinatorConfig {
            workers: vec![a, b],
            ..CoordinatorConfig::default()
        });
        assert!(matches!(result, Err(WeftError::Config(_))));
    }

    #[test]
    fn test_available_port_reserves() {
        let coord = coordinator(vec![], 1);
        assert_eq!(coord.available_port().unwrap(), 4200);
        assert_eq!(coord.available_port().unwrap(), 4201);
        assert!(coord.ports().is_reserved(4200));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_high_priority_started_before_earlier_low() {
        let server = health_server(serde_json::json!({})).await;
        let coord = coordinator(
            vec![
                sleeper("first", &server),
                sleeper("low", &server),
                sleeper("high", &server),
            ],
            1,
        );
        let mut events = coord.subscribe();

        let c = coord.clone();
        let first = tokio::spawn(async move { c.start_worker("first", StartPriority::Normal).await });
        tokio::task::yield_now().await;
        let c = coord.clone();
        let low = tokio::spawn(async move { c.start_worker("low", StartPriority::Low).await });
        tokio::task::yield_now().await;
        let c = coord.clone();
        let high = tokio::spawn(async move { c.start_worker("high", StartPriority::High).await });

        first.await.unwrap().unwrap();
        low.await.unwrap().unwrap();
        high.await.unwrap().unwrap();

        let order: Vec<String> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::Started { worker, .. } => Some(worker),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["first", "high", "low"]);
        coord.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_optimize_resources_actions() {
        let server = health_server(serde_json::json!({
            "memory": 100.0,
            "cpu": 95.0,
            "connections": 10
        }))
        .await;
        let mut hungry = sleeper("hungry", &server);
        hungry.max_memory_mb = Some(50.0);
        let mut busy = sleeper("busy", &server);
        busy.max_cpu_percent = Some(80.0);
        busy.max_connections = Some(10);

        let coord = coordinator(vec![hungry, busy], 2);
        let mut events = coord.subscribe();
        coord.start_all().await;

        let actions = coord.optimize_resources().await;
        let kinds: Vec<(&str, OptimizationKind)> = actions
            .iter()
            .map(|a| (a.worker.as_str(), a.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("busy", OptimizationKind::Throttle),
                ("busy", OptimizationKind::ExpandPool),
                ("hungry", OptimizationKind::Restart),
            ]
        );
        assert_eq!(coord.worker("busy").unwrap().pool_capacity(), Some(15));
        assert_eq!(coord.worker("hungry").unwrap().status().restart_count, 1);

        let got = events.drain();
        assert!(got.iter().any(|e| matches!(e, WorkerEvent::ThrottleRequested { worker, .. } if worker == "busy")));
        assert!(got.iter().any(|e| matches!(e, WorkerEvent::PoolExpanded { from: 10, to: 15, .. })));
        coord.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pool_growth_capped() {
        let server = health_server(serde_json::json!({"connections": 190})).await;
        let mut worker = sleeper("pool", &server);
        worker.max_connections = Some(190);
        let coord = coordinator(vec![worker], 1);
        coord.start_all().await;

        let actions = coord.optimize_resources().await;
        assert_eq!(actions[0].kind, OptimizationKind::ExpandPool);
        assert_eq!(coord.worker("pool").unwrap().pool_capacity(), Some(200));

        // at the cap nothing more happens
        assert!(coord.optimize_resources().await.is_empty());
        coord.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_request_served() {
        let server = health_server(serde_json::json!({})).await;
        let coord = coordinator(vec![sleeper("svc", &server)], 1);
        coord.start_all().await;

        let bus: EventBus<RestartRequest> = EventBus::new(8);
        let server_task = coord.serve_restart_requests(bus.subscribe());

        let (request, reply) = RestartRequest::new(1, Some("svc".into()), "wf-1", "embed");
        assert_eq!(bus.publish(request), 1);
        let answer = tokio::time::timeout(Duration::from_secs(5), reply).await.unwrap().unwrap();
        assert_eq!(answer, Ok(()));
        assert_eq!(coord.worker("svc").unwrap().status().restart_count, 1);

        let (request, reply) = RestartRequest::new(2, Some("missing".into()), "wf-1", "embed");
        bus.publish(request);
        let answer = tokio::time::timeout(Duration::from_secs(5), reply).await.unwrap().unwrap();
        assert!(answer.unwrap_err().contains("missing"));

        drop(bus);
        server_task.await.unwrap();
        coord.shutdown().await;
    }
}
