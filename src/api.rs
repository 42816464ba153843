//! Management endpoints under `/api`

use crate::error::{json_error_response, GatewayErrorCode};
use crate::gateway::Gateway;
use crate::registry::ServiceRecord;
use chrono::Utc;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Lifecycle actions accepted by `POST /api/services/{name}/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(ServiceAction::Start),
            "stop" => Some(ServiceAction::Stop),
            "restart" => Some(ServiceAction::Restart),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            ServiceAction::Start => "started",
            ServiceAction::Stop => "stopped",
            ServiceAction::Restart => "restarted",
        }
    }
}

/// Helper to create a JSON response - infallible with valid StatusCode
fn json_response(status: StatusCode, body: &Value) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

/// Serve one management request. Only the method and path are consulted.
pub async fn handle_api_request<B>(
    req: Request<B>,
    gateway: &Gateway,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let method = req.method().clone();
    let path = req.uri().path();
    debug!(%method, path, "Management API request");

    let segments: Vec<&str> = path
        .strip_prefix("/api")
        .unwrap_or(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => gateway_health(gateway),
        (&Method::GET, ["version"]) => json_response(
            StatusCode::OK,
            &json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),
        (&Method::GET, ["services"]) => list_services(gateway),
        (&Method::GET, ["services", name]) => get_service(gateway, name).await,
        (&Method::GET, ["services", name, "health"]) => check_service_health(gateway, name).await,
        (&Method::POST, ["services", name, action]) => service_action(gateway, name, action).await,
        (&Method::GET, ["stats"]) => stats(gateway),
        (&Method::GET, ["config"]) => {
            let snapshot = gateway.config().snapshot();
            match serde_json::to_value(&*snapshot) {
                Ok(value) => json_response(StatusCode::OK, &value),
                Err(e) => {
                    error!(error = %e, "Failed to serialize configuration");
                    json_error_response(GatewayErrorCode::InternalError, "Internal server error")
                }
            }
        }
        _ => json_error_response(GatewayErrorCode::EndpointNotFound, "Endpoint not found"),
    }
}

fn gateway_health(gateway: &Gateway) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "healthy",
            "uptime": gateway.uptime().as_secs(),
            "timestamp": Utc::now().to_rfc3339(),
            "services": gateway.registry().stats(),
        }),
    )
}

fn stats(gateway: &Gateway) -> Response<BoxBody<Bytes, hyper::Error>> {
    let stats = gateway.registry().stats();
    let pool = gateway.pool().stats();
    json_response(
        StatusCode::OK,
        &json!({
            "total": stats.total,
            "running": stats.running,
            "stopped": stats.stopped,
            "starting": stats.starting,
            "stopping": stats.stopping,
            "error": stats.error,
            "totalRequests": stats.total_requests,
            "totalErrors": stats.total_errors,
            "configured": gateway.config().snapshot().services.len(),
            "upstream": {
                "requests": pool.get_total_requests(),
                "failures": pool.get_failed_requests(),
            },
        }),
    )
}

/// Summary shape shared by the list and detail endpoints
fn service_summary(gateway: &Gateway, record: &ServiceRecord) -> Value {
    let settings = gateway.config().settings();
    json!({
        "name": record.name,
        "status": record.status,
        "port": record.port,
        "pid": record.pid,
        "lastActivity": record.last_activity.map(|t| t.to_rfc3339()),
        "startTime": record.start_time.map(|t| t.to_rfc3339()),
        "requestCount": record.request_count,
        "errorCount": record.error_count,
        "config": {
            "command": record.config.command,
            "timeoutMs": record.config.idle_timeout(&settings).as_millis() as u64,
            "healthCheck": record.config.health_check,
            "instances": record.config.instances,
            "autoRestart": record.config.auto_restart,
        },
    })
}

/// Registered records plus configured services nobody has requested yet
fn all_records(gateway: &Gateway) -> Vec<ServiceRecord> {
    let mut records = gateway.registry().list();
    let snapshot = gateway.config().snapshot();
    for (name, config) in &snapshot.services {
        if !gateway.registry().contains(name) {
            records.push(ServiceRecord::from_config(config));
        }
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    records
}

fn find_record(gateway: &Gateway, name: &str) -> Option<ServiceRecord> {
    gateway.registry().get(name).or_else(|| {
        gateway
            .config()
            .service(name)
            .map(|config| ServiceRecord::from_config(&config))
    })
}

fn list_services(gateway: &Gateway) -> Response<BoxBody<Bytes, hyper::Error>> {
    let summaries: Vec<Value> = all_records(gateway)
        .iter()
        .map(|record| service_summary(gateway, record))
        .collect();
    json_response(StatusCode::OK, &Value::Array(summaries))
}

async fn get_service(gateway: &Gateway, name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(record) = find_record(gateway, name) else {
        return json_error_response(GatewayErrorCode::ServiceNotFound, "Service not found");
    };

    let mut summary = service_summary(gateway, &record);
    summary["processes"] = process_details(gateway, name).await;
    json_response(StatusCode::OK, &summary)
}

/// Live instance pids and restart count as the supervisor reports them
async fn process_details(gateway: &Gateway, name: &str) -> Value {
    match gateway.supervisor().list().await {
        Ok(processes) => processes
            .into_iter()
            .find(|info| info.name == name)
            .map(|info| {
                json!({
                    "pids": info.pids,
                    "instances": info.instances,
                    "restarts": info.restarts,
                })
            })
            .unwrap_or(Value::Null),
        Err(e) => {
            warn!(service = name, error = %e, "Failed to list supervised processes");
            Value::Null
        }
    }
}

async fn check_service_health(
    gateway: &Gateway,
    name: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(record) = find_record(gateway, name) else {
        return json_error_response(GatewayErrorCode::ServiceNotFound, "Service not found");
    };
    if !record.is_running() {
        return json_error_response(GatewayErrorCode::ServiceNotRunning, "Service is not running");
    }

    let result = gateway.health().check(&record).await;
    let mut body = json!({ "service": record.name });
    if let (Some(body), Ok(Value::Object(fields))) =
        (body.as_object_mut(), serde_json::to_value(&result))
    {
        body.extend(fields);
    }
    json_response(StatusCode::OK, &body)
}

async fn service_action(
    gateway: &Gateway,
    name: &str,
    action: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(action) = ServiceAction::parse(action) else {
        return json_error_response(
            GatewayErrorCode::InvalidAction,
            "Invalid action. Use start, stop, or restart",
        );
    };

    // Unconfigured names must not leave a record behind
    let registry = gateway.registry();
    if let Err(e) = registry.register_configured(name) {
        debug!(service = name, error = %e, "Lifecycle action on unknown service");
        return json_error_response(GatewayErrorCode::ServiceNotFound, "Service not registered");
    }

    info!(service = name, action = action.as_str(), "Lifecycle action requested");
    let result = match action {
        ServiceAction::Start => registry.start_service(name).await,
        ServiceAction::Stop => registry.stop_service(name).await,
        ServiceAction::Restart => match registry.stop_service(name).await {
            Ok(_) => {
                tokio::time::sleep(gateway.config().settings().restart_delay()).await;
                registry.start_service(name).await
            }
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(record) => json_response(
            StatusCode::OK,
            &json!({
                "success": true,
                "message": format!("Service {} {}", name, action.past_tense()),
                "service": service_summary(gateway, &record),
            }),
        ),
        Err(e) => {
            error!(service = name, action = action.as_str(), error = %e, "Lifecycle action failed");
            json_error_response(e.code(), format!("Failed to {} service", action.as_str()))
        }
    }
}
