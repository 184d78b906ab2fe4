use crate::config::{WorkerConfig, DEFAULT_UNHEALTHY_THRESHOLD};
use crate::events::WorkerEvent;
use crate::health::{HealthProbe, WorkerMetrics};
use crate::ports::PortPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use weft_core::{EventBus, WeftError, WeftResult};

/// Lifecycle state of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Crashed or failed to start.
    Error,
    /// Waiting for a scheduled automatic restart.
    Recovery,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Error => "error",
            WorkerState::Recovery => "recovery",
        };
        f.write_str(s)
    }
}

/// Read-only snapshot of a supervised worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub metrics: Option<WorkerMetrics>,
    pub pool_capacity: Option<u32>,
}

struct Inner {
    state: WorkerState,
    pid: Option<u32>,
    port: Option<u16>,
    started_at: Option<DateTime<Utc>>,
    restart_count: u32,
    consecutive_failures: u32,
    metrics: Option<WorkerMetrics>,
    pool_capacity: Option<u32>,
    /// Tells the monitor task to terminate the child.
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

/// Owns one external worker process: launch, health, stop, and crash
/// recovery.
///
/// `start`, `stop` and `restart` are serialised. Once running, the child is
/// owned by a monitor task that either observes its exit or terminates it on
/// request.
pub struct WorkerSupervisor {
    config: WorkerConfig,
    ports: Arc<PortPool>,
    events: EventBus<WorkerEvent>,
    probe: HealthProbe,
    inner: parking_lot::Mutex<Inner>,
    op_lock: tokio::sync::Mutex<()>,
    /// Consecutive failed health checks that move a running worker to `error`.
    unhealthy_threshold: u32,
}

impl WorkerSupervisor {
    pub fn new(config: WorkerConfig, ports: Arc<PortPool>, events: EventBus<WorkerEvent>) -> Self {
        let pool_capacity = config.max_connections;
        Self {
            config,
            ports,
            events,
            probe: HealthProbe::new(),
            inner: parking_lot::Mutex::new(Inner {
                state: WorkerState::Stopped,
                pid: None,
                port: None,
                started_at: None,
                restart_count: 0,
                consecutive_failures: 0,
                metrics: None,
                pool_capacity,
                stop_tx: None,
                monitor: None,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }

    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.lock().port
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn metrics(&self) -> Option<WorkerMetrics> {
        self.inner.lock().metrics.clone()
    }

    pub fn pool_capacity(&self) -> Option<u32> {
        self.inner.lock().pool_capacity
    }

    pub(crate) fn set_pool_capacity(&self, capacity: u32) {
        self.inner.lock().pool_capacity = Some(capacity);
    }

    pub fn status(&self) -> WorkerStatus {
        let inner = self.inner.lock();
        WorkerStatus {
            name: self.config.name.clone(),
            state: inner.state,
            pid: inner.pid,
            port: inner.port,
            started_at: inner.started_at,
            restart_count: inner.restart_count,
            consecutive_failures: inner.consecutive_failures,
            metrics: inner.metrics.clone(),
            pool_capacity: inner.pool_capacity,
        }
    }

    /// Launch the worker and wait until its health endpoint answers.
    ///
    /// Returns the assigned port. Starting a running worker is a no-op.
    pub async fn start(self: &Arc<Self>) -> WeftResult<u16> {
        let _op = self.op_lock.lock().await;
        self.start_locked().await
    }

    /// Gracefully stop the worker and release its port.
    pub async fn stop(&self) {
        let _op = self.op_lock.lock().await;
        self.stop_locked().await;
    }

    /// Stop, then start again, counting the restart.
    pub async fn restart(self: &Arc<Self>) -> WeftResult<u16> {
        let _op = self.op_lock.lock().await;
        self.stop_locked().await;
        let port = self.start_locked().await?;
        let restart_count = {
            let mut inner = self.inner.lock();
            inner.restart_count += 1;
            inner.restart_count
        };
        info!(worker = %self.config.name, port, restart_count, "Worker restarted");
        self.events.publish(WorkerEvent::Restarted {
            worker: self.config.name.clone(),
            restart_count,
        });
        Ok(port)
    }

    async fn start_locked(self: &Arc<Self>) -> WeftResult<u16> {
        {
            let inner = self.inner.lock();
            if inner.state == WorkerState::Running {
                if let Some(port) = inner.port {
                    return Ok(port);
                }
            }
        }

        if let Some(artifact) = self.config.launch_artifact() {
            if tokio::fs::metadata(artifact).await.is_err() {
                let err = WeftError::LaunchArtifactMissing(artifact.to_path_buf());
                self.fail(&err);
                return Err(err);
            }
        }

        self.inner.lock().state = WorkerState::Starting;
        let port = match self.ports.acquire() {
            Ok(port) => port,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        info!(worker = %self.config.name, command = %self.config.command, port, "Starting worker");
        let mut child = match self.spawn(port) {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port);
                self.fail(&e);
                return Err(e);
            }
        };
        let pid = child.id();

        let metrics = match self.wait_until_healthy(&mut child, port).await {
            Ok(metrics) => metrics,
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    debug!(worker = %self.config.name, error = %kill_err, "Kill after failed startup");
                }
                self.ports.release(port);
                self.fail(&e);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(
            Arc::downgrade(self),
            child,
            stop_rx,
            self.config.stop_grace(),
            self.config.name.clone(),
        ));

        {
            let mut inner = self.inner.lock();
            inner.state = WorkerState::Running;
            inner.pid = pid;
            inner.port = Some(port);
            inner.started_at = Some(Utc::now());
            inner.consecutive_failures = 0;
            inner.metrics = Some(metrics);
            inner.stop_tx = Some(stop_tx);
            inner.monitor = Some(monitor);
        }

        info!(worker = %self.config.name, pid = ?pid, port, "Worker running");
        self.events.publish(WorkerEvent::Started {
            worker: self.config.name.clone(),
            pid,
            port,
        });
        Ok(port)
    }

    fn spawn(&self, port: u16) -> WeftResult<Child> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.config.resolved_args(port))
            .envs(&self.config.env)
            .env(&self.config.port_env, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            WeftError::Startup(format!(
                "Failed to spawn worker '{}' ({}): {e}",
                self.config.name, self.config.command
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(self.config.name.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(self.config.name.clone(), "stderr", stderr));
        }
        Ok(child)
    }

    async fn wait_until_healthy(&self, child: &mut Child, port: u16) -> WeftResult<WorkerMetrics> {
        let url = self.config.health_url_for(port);
        let attempts = self.config.startup_attempts;

        for attempt in 1..=attempts {
            if let Some(status) = child.try_wait()? {
                return Err(WeftError::Startup(format!(
                    "Worker '{}' exited during startup ({status})",
                    self.config.name
                )));
            }
            match self.probe.probe(&url, self.config.health_timeout()).await {
                Ok(metrics) => return Ok(metrics),
                Err(e) => {
                    debug!(worker = %self.config.name, attempt, attempts, error = %e, "Worker not ready yet");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.startup_poll_interval()).await;
            }
        }

        Err(WeftError::Startup(format!(
            "Worker '{}' not healthy after {attempts} attempts",
            self.config.name
        )))
    }

    fn fail(&self, err: &WeftError) {
        self.inner.lock().state = WorkerState::Error;
        error!(worker = %self.config.name, error = %err, "Worker failed to start");
        self.events.publish(WorkerEvent::Error {
            worker: self.config.name.clone(),
            message: err.to_string(),
        });
    }

    async fn stop_locked(&self) {
        let (stop_tx, monitor, port, was) = {
            let mut inner = self.inner.lock();
            let was = inner.state;
            if was == WorkerState::Stopped {
                return;
            }
            inner.state = WorkerState::Stopping;
            (inner.stop_tx.take(), inner.monitor.take(), inner.port.take(), was)
        };

        info!(worker = %self.config.name, from = %was, "Stopping worker");
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!(worker = %self.config.name, error = %e, "Worker monitor task failed");
            }
        }
        if let Some(port) = port {
            self.ports.release(port);
        }

        {
            let mut inner = self.inner.lock();
            inner.state = WorkerState::Stopped;
            inner.pid = None;
            inner.consecutive_failures = 0;
        }
        info!(worker = %self.config.name, "Worker stopped");
        self.events.publish(WorkerEvent::Stopped {
            worker: self.config.name.clone(),
        });
    }

    /// Probe the health endpoint once. Never errors: a failed probe bumps the
    /// consecutive-failure counter and returns `false`. Reaching the unhealthy
    /// threshold moves the worker to `error`; the process is left running
    /// for whoever decides to restart or stop it.
    pub async fn perform_health_check(&self) -> bool {
        let port = {
            let inner = self.inner.lock();
            match (inner.state, inner.port) {
                (WorkerState::Running, Some(port)) => port,
                _ => return false,
            }
        };
        let url = self.config.health_url_for(port);

        match self.probe.probe(&url, self.config.health_timeout()).await {
            Ok(metrics) => {
                let mut inner = self.inner.lock();
                inner.consecutive_failures = 0;
                inner.metrics = Some(metrics);
                true
            }
            Err(e) => {
                let (consecutive_failures, now_unhealthy) = {
                    let mut inner = self.inner.lock();
                    inner.consecutive_failures += 1;
                    let now_unhealthy = inner.state == WorkerState::Running
                        && inner.consecutive_failures >= self.unhealthy_threshold;
                    if now_unhealthy {
                        inner.state = WorkerState::Error;
                    }
                    (inner.consecutive_failures, now_unhealthy)
                };
                warn!(worker = %self.config.name, consecutive_failures, error = %e, "Worker health check failed");
                self.events.publish(WorkerEvent::HealthCheckFailed {
                    worker: self.config.name.clone(),
                    consecutive_failures,
                });
                if now_unhealthy {
                    error!(worker = %self.config.name, consecutive_failures, "Worker unhealthy");
                    self.events.publish(WorkerEvent::Error {
                        worker: self.config.name.clone(),
                        message: format!("{consecutive_failures} consecutive failed health checks"),
                    });
                }
                false
            }
        }
    }

    /// Called by the monitor when the child ends without being asked to.
    fn handle_exit(self: &Arc<Self>, code: Option<i32>) {
        let (port, was_unhealthy) = {
            let mut inner = self.inner.lock();
            let was_unhealthy = match inner.state {
                WorkerState::Running => false,
                // marked unhealthy while its process was still up
                WorkerState::Error if inner.monitor.is_some() => true,
                // a stop is in progress and owns the transition
                _ => return,
            };
            inner.pid = None;
            inner.stop_tx = None;
            inner.monitor = None;
            inner.state = if code == Some(0) {
                WorkerState::Stopped
            } else {
                WorkerState::Error
            };
            (inner.port.take(), was_unhealthy)
        };
        if let Some(port) = port {
            self.ports.release(port);
        }

        let name = self.config.name.clone();
        self.events.publish(WorkerEvent::Exited {
            worker: name.clone(),
            code,
        });
        if was_unhealthy {
            info!(worker = %name, code = ?code, "Unhealthy worker exited");
            return;
        }

        if code == Some(0) {
            info!(worker = %name, "Worker exited cleanly");
            self.events.publish(WorkerEvent::Stopped { worker: name });
            return;
        }

        warn!(worker = %name, code = ?code, "Worker exited unexpectedly");
        self.events.publish(WorkerEvent::Error {
            worker: name,
            message: format!("exited unexpectedly with code {code:?}"),
        });
        self.schedule_recovery();
    }

    fn schedule_recovery(self: &Arc<Self>) {
        let name = &self.config.name;
        {
            let mut inner = self.inner.lock();
            if !self.config.auto_restart || inner.restart_count >= self.config.max_restarts {
                error!(
                    worker = %name,
                    restarts = inner.restart_count,
                    max_restarts = self.config.max_restarts,
                    "Worker will not be restarted"
                );
                return;
            }
            inner.state = WorkerState::Recovery;
        }

        let delay = self.config.restart_delay();
        info!(worker = %name, delay_ms = delay.as_millis() as u64, "Scheduling worker restart");
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.recover().await;
        });
    }

    async fn recover(self: &Arc<Self>) {
        let _op = self.op_lock.lock().await;
        let restart_count = {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Recovery {
                // stopped or restarted by someone else in the meantime
                return;
            }
            inner.restart_count += 1;
            inner.restart_count
        };

        match self.start_locked().await {
            Ok(port) => {
                info!(worker = %self.config.name, port, restart_count, "Worker recovered");
                self.events.publish(WorkerEvent::Restarted {
                    worker: self.config.name.clone(),
                    restart_count,
                });
            }
            Err(e) => {
                warn!(worker = %self.config.name, restart_count, error = %e, "Automatic restart failed");
                self.schedule_recovery();
            }
        }
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(tx) = inner.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(port) = inner.port.take() {
            self.ports.release(port);
        }
    }
}

/// Owns the running child until it exits or a stop is requested.
async fn monitor(
    supervisor: Weak<WorkerSupervisor>,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    name: String,
) {
    tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(worker = %name, error = %e, "Failed to wait on worker process");
                    None
                }
            };
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.handle_exit(code);
            }
        }
        _ = stop_rx => {
            terminate(&mut child, grace, &name).await;
        }
    }
}

/// Soft-terminate, wait up to `grace`, then kill.
async fn terminate(child: &mut Child, grace: Duration, name: &str) {
    let signalled = match child.id() {
        Some(pid) => send_term(pid).await,
        None => false,
    };
    if signalled {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker = %name, %status, "Worker exited after SIGTERM");
                return;
            }
            Ok(Err(e)) => warn!(worker = %name, error = %e, "Failed to wait on worker process"),
            Err(_) => warn!(worker = %name, grace_ms = grace.as_millis() as u64, "Worker ignored SIGTERM, killing"),
        }
    }
    if let Err(e) = child.kill().await {
        warn!(worker = %name, error = %e, "Failed to kill worker process");
    }
}

#[cfg(unix)]
async fn send_term(pid: u32) -> bool {
    match Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!(pid, error = %e, "Could not run kill");
            false
        }
    }
}

#[cfg(not(unix))]
async fn send_term(_pid: u32) -> bool {
    false
}

async fn forward_output<R: AsyncRead + Unpin>(worker: String, stream: &'static str, source: R) {
    let mut lines = BufReader::new(source).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(worker = %worker, stream, line = %line, "worker output"),
            Ok(None) => break,
            Err(e) => {
                debug!(worker = %worker, stream, error = %e, "worker output closed");
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn healthy_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"memory": 64.0})))
            .mount(&server)
            .await;
        server
    }

    fn quick(name: &str, command: &str, args: &[&str], server: &MockServer) -> WorkerConfig {
        let mut config = WorkerConfig::new(name, command);
        config.args = args.iter().map(|a| (*a).to_string()).collect();
        config.health_url = Some(format!("{}/health?port={{port}}", server.uri()));
        config.startup_attempts = 5;
        config.startup_poll_interval_ms = 20;
        config.health_timeout_ms = 500;
        config.stop_grace_ms = 500;
        config.restart_delay_ms = 20;
        config
    }

    fn supervisor(config: WorkerConfig) -> (Arc<WorkerSupervisor>, Arc<PortPool>, EventBus<WorkerEvent>) {
        let ports = Arc::new(PortPool::new(4100, 4104).unwrap());
        let events = EventBus::new(64);
        let sup = Arc::new(WorkerSupervisor::new(config, ports.clone(), events.clone()));
        (sup, ports, events)
    }

    #[tokio::test]
    async fn test_missing_script_fails_before_port_reserved() {
        let server = healthy_server().await;
        let mut config = quick("ghost", "node", &[], &server);
        config.script = Some(PathBuf::from("/definitely/not/here.js"));
        let (sup, ports, _) = supervisor(config);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, WeftError::LaunchArtifactMissing(_)));
        assert_eq!(ports.reserved_count(), 0);
        assert_eq!(sup.state(), WorkerState::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let server = healthy_server().await;
        let (sup, ports, events) = supervisor(quick("sleeper", "sleep", &["30"], &server));
        let mut sub = events.subscribe();

        let port = sup.start().await.unwrap();
        assert_eq!(port, 4100);
        assert_eq!(sup.state(), WorkerState::Running);
        assert!(ports.is_reserved(port));
        assert_eq!(sup.metrics().unwrap().memory_mb, Some(64.0));

        sup.stop().await;
        assert_eq!(sup.state(), WorkerState::Stopped);
        assert!(!ports.is_reserved(port));

        let got = sub.drain();
        assert!(matches!(got[0], WorkerEvent::Started { port: 4100, .. }));
        assert!(matches!(got.last(), Some(WorkerEvent::Stopped { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_injected_into_env_and_args() {
        let server = healthy_server().await;
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seen");
        let script = format!("echo \"$PORT {{port}}\" > {}; exec sleep 30", out.display());
        let (sup, _, _) = supervisor(quick("echo", "sh", &["-c", &script], &server));

        let port = sup.start().await.unwrap();
        let mut seen = String::new();
        for _ in 0..100 {
            seen = tokio::fs::read_to_string(&out).await.unwrap_or_default();
            if seen.ends_with('\n') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.trim(), format!("{port} {port}"));
        sup.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_repeated_health_failures_move_worker_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let mut config = quick("flaky", "sleep", &["30"], &server);
        config.auto_restart = false;
        let ports = Arc::new(PortPool::new(4100, 4104).unwrap());
        let events = EventBus::new(64);
        let sup = Arc::new(
            WorkerSupervisor::new(config, ports.clone(), events.clone()).with_unhealthy_threshold(2),
        );
        let port = sup.start().await.unwrap();
        let mut sub = events.subscribe();

        assert!(!sup.perform_health_check().await);
        assert_eq!(sup.state(), WorkerState::Running);
        assert!(!sup.perform_health_check().await);
        assert_eq!(sup.state(), WorkerState::Error);
        assert_eq!(sup.consecutive_failures(), 2);
        assert!(sub
            .drain()
            .iter()
            .any(|e| matches!(e, WorkerEvent::Error { .. })));

        // the process is still ours to stop
        assert!(ports.is_reserved(port));
        sup.stop().await;
        assert_eq!(sup.state(), WorkerState::Stopped);
        assert!(!ports.is_reserved(port));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_never_healthy_fails_startup_and_releases_port() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let mut config = quick("sick", "sleep", &["30"], &server);
        config.startup_attempts = 3;
        let (sup, ports, _) = supervisor(config);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, WeftError::Startup(_)));
        assert_eq!(ports.reserved_count(), 0);
        assert_eq!(sup.state(), WorkerState::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_during_startup_detected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let mut config = quick("quitter", "sh", &["-c", "exit 3"], &server);
        config.startup_attempts = 50;
        let (sup, _, _) = supervisor(config);

        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("exited during startup"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_triggers_auto_restart() {
        let server = healthy_server().await;
        let (sup, _, events) = supervisor(quick("crashy", "sh", &["-c", "sleep 0.2; exit 1"], &server));
        let mut sub = events.subscribe();

        sup.start().await.unwrap();
        let restarted = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(WorkerEvent::Restarted { restart_count, .. }) = sub.recv().await {
                    return restart_count;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(restarted, 1);
        sup.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_settles_stopped() {
        let server = healthy_server().await;
        let (sup, ports, events) = supervisor(quick("oneshot", "sh", &["-c", "sleep 0.2"], &server));
        let mut sub = events.subscribe();

        sup.start().await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(WorkerEvent::Exited { code, .. }) = sub.recv().await {
                    return code;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(code, Some(0));
        assert_eq!(sup.state(), WorkerState::Stopped);
        assert_eq!(ports.reserved_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_counts() {
        let server = healthy_server().await;
        let (sup, _, _) = supervisor(quick("again", "sleep", &["30"], &server));
        sup.start().await.unwrap();
        sup.restart().await.unwrap();
        let status = sup.status();
        assert_eq!(status.restart_count, 1);
        assert_eq!(status.state, WorkerState::Running);
        sup.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_check_failures_counted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (sup, _, _) = supervisor(quick("flaky", "sleep", &["30"], &server));

        sup.start().await.unwrap();
        assert!(!sup.perform_health_check().await);
        assert!(!sup.perform_health_check().await);
        assert_eq!(sup.consecutive_failures(), 2);
        sup.stop().await;
    }
}
