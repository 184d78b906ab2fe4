#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_workers::{Coordinator, CoordinatorConfig, WorkerConfig, WorkerEvent, WorkerState};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sleeper(name: &str, health_url: String) -> WorkerConfig {
    let mut config = WorkerConfig::new(name, "sleep");
    config.args = vec!["30".into()];
    config.health_url = Some(health_url);
    config.startup_attempts = 10;
    config.startup_poll_interval_ms = 20;
    config.health_timeout_ms = 1_000;
    config.stop_grace_ms = 500;
    config
}

fn coordinator(workers: Vec<WorkerConfig>, max_concurrent_startups: usize) -> Arc<Coordinator> {
    Arc::new(
        Coordinator::new(CoordinatorConfig {
            port_range_start: 4300,
            port_range_end: 4399,
            max_concurrent_startups,
            health_check_interval_secs: 1,
            unhealthy_threshold: 3,
            workers,
            ..CoordinatorConfig::default()
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn startups_are_bounded_by_max_concurrency() {
    // every health probe takes 200ms, so startup time is dominated by it
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;
    let workers = (0..4)
        .map(|i| sleeper(&format!("w{i}"), format!("{}/health", server.uri())))
        .collect();
    let coord = coordinator(workers, 2);

    let started = Instant::now();
    let results = coord.start_all().await;
    let elapsed = started.elapsed();

    assert!(results.iter().all(|(_, r)| r.is_ok()));
    // four startups two at a time need at least two probe rounds
    assert!(elapsed >= Duration::from_millis(400), "took {elapsed:?}");

    let mut ports: Vec<u16> = coord.status().iter().filter_map(|s| s.port).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 4);

    coord.shutdown().await;
    assert_eq!(coord.ports().reserved_count(), 0);
    assert!(coord
        .status()
        .iter()
        .all(|s| s.state == WorkerState::Stopped));
}

#[tokio::test]
async fn health_sweep_restarts_after_three_failures() {
    let server = MockServer::start().await;
    // startup probe succeeds, then the worker goes bad until it is restarted
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let coord = coordinator(vec![sleeper("svc", format!("{}/health", server.uri()))], 1);
    let mut events = coord.subscribe();
    coord.start_all().await;

    coord.health_sweep().await;
    coord.health_sweep().await;
    assert_eq!(coord.worker("svc").unwrap().consecutive_failures(), 2);
    coord.health_sweep().await;

    let status = coord.status().remove(0);
    assert_eq!(status.restart_count, 1);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.state, WorkerState::Running);
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, WorkerEvent::Restarted { .. })));

    coord.shutdown().await;
}

#[tokio::test]
async fn unhealthy_worker_without_auto_restart_is_marked_error() {
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

    let mut config = sleeper("manual", format!("{}/health", server.uri()));
    config.auto_restart = false;
    let coord = coordinator(vec![config], 1);
    let mut events = coord.subscribe();
    coord.start_all().await;

    for _ in 0..4 {
        coord.health_sweep().await;
    }
    // the fourth sweep skips it: only running workers are checked
    let status = coord.status().remove(0);
    assert_eq!(status.restart_count, 0);
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(status.state, WorkerState::Error);
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, WorkerEvent::Error { .. })));

    coord.shutdown().await;
    assert_eq!(coord.ports().reserved_count(), 0);
}

#[tokio::test]
async fn background_health_loop_runs_until_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"memory": 12.5})))
        .mount(&server)
        .await;
    let coord = coordinator(vec![sleeper("svc", format!("{}/health", server.uri()))], 1);
    coord.start_all().await;
    coord.start_health_loop();

    tokio::time::sleep(Duration::from_millis(1_300)).await;
    // startup probe plus at least one sweep
    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 2, "saw {} probes", requests.len());

    coord.shutdown().await;
    assert_eq!(coord.ports().reserved_count(), 0);
}
