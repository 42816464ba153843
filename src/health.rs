//! HTTP health probes against running services

use crate::registry::ServiceRecord;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome class of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Timeout,
}

/// Result of a single probe. Never changes service status on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub latency_ms: u64,
    /// Status code of the probe response, when one arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Issues `GET http://127.0.0.1:{port}{path}` with a bounded timeout
pub struct HealthChecker {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);

        Self { client, timeout }
    }

    /// Probe a service's configured health endpoint
    pub async fn check(&self, record: &ServiceRecord) -> HealthCheckResult {
        let result = self.probe(record.port, &record.config.health_check).await;
        debug!(
            service = %record.name,
            status = ?result.status,
            latency_ms = result.latency_ms,
            "Health check completed"
        );
        result
    }

    pub async fn probe(&self, port: u16, path: &str) -> HealthCheckResult {
        let uri = format!("http://127.0.0.1:{}{}", port, path);
        let started = Instant::now();

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("User-Agent", "lazygate-health-check")
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                return HealthCheckResult {
                    status: HealthStatus::Unhealthy,
                    latency_ms: 0,
                    http_status: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let outcome = tokio::time::timeout(self.timeout, self.client.request(req)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(response)) => {
                let (status, error) = classify_status(response.status());
                HealthCheckResult {
                    status,
                    latency_ms,
                    http_status: Some(response.status().as_u16()),
                    error,
                }
            }
            Ok(Err(e)) => HealthCheckResult {
                status: HealthStatus::Unhealthy,
                latency_ms,
                http_status: None,
                error: Some(e.to_string()),
            },
            Err(_) => HealthCheckResult {
                status: HealthStatus::Timeout,
                latency_ms,
                http_status: None,
                error: Some(format!(
                    "no response within {}ms",
                    self.timeout.as_millis()
                )),
            },
        }
    }
}

/// 2xx and 3xx are healthy; anything else carries the code as detail
pub fn classify_status(status: StatusCode) -> (HealthStatus, Option<String>) {
    if status.is_success() || status.is_redirection() {
        (HealthStatus::Healthy, None)
    } else {
        (HealthStatus::Unhealthy, Some(format!("HTTP {}", status.as_u16())))
    }
}
