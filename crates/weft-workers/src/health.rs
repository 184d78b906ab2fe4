use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use weft_core::{WeftError, WeftResult};

/// Last-known resource usage reported by a worker's health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub connections: Option<u32>,
    pub probed_at: Option<DateTime<Utc>>,
}

/// Optional JSON body of a health response.
#[derive(Debug, Default, Deserialize)]
struct HealthBody {
    #[serde(default)]
    memory: Option<f64>,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    connections: Option<f64>,
}

/// HTTP health prober shared by every supervisor.
#[derive(Debug, Clone, Default)]
pub struct HealthProbe {
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// GET `url` within `timeout`. Any 2xx is healthy; metrics are read from
    /// the body when it is JSON and left empty otherwise.
    pub async fn probe(&self, url: &str, timeout: Duration) -> WeftResult<WorkerMetrics> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WeftError::Timeout(format!("Health probe to {url} timed out"))
                } else {
                    WeftError::Http(format!("Health probe to {url} failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WeftError::Http(format!(
                "Health probe to {url} returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response.bytes().await.unwrap_or_default();
        let parsed: HealthBody = serde_json::from_slice(&body).unwrap_or_default();
        Ok(WorkerMetrics {
            memory_mb: parsed.memory,
            cpu_percent: parsed.cpu,
            connections: parsed.connections.map(|c| c.max(0.0).round() as u32),
            probed_at: Some(Utc::now()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_metrics_parsed_from_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "memory": 256.5,
                "cpu": 12.0,
                "connections": 7
            })))
            .mount(&server)
            .await;

        let metrics = HealthProbe::new()
            .probe(&format!("{}/health", server.uri()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(metrics.memory_mb, Some(256.5));
        assert_eq!(metrics.cpu_percent, Some(12.0));
        assert_eq!(metrics.connections, Some(7));
        assert!(metrics.probed_at.is_some());
    }

    #[tokio::test]
    async fn test_plain_body_is_healthy_without_metrics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let metrics = HealthProbe::new()
            .probe(&server.uri(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(metrics.memory_mb, None);
    }

    #[tokio::test]
    async fn test_non_success_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = HealthProbe::new()
            .probe(&server.uri(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = HealthProbe::new()
            .probe(&server.uri(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Timeout(_)));
    }
}
