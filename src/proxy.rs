use crate::api;
use crate::config::{self, GatewaySettings};
use crate::cors;
use crate::error::{json_error_response, GatewayError, GatewayErrorCode};
use crate::gateway::Gateway;
use crate::health::HealthChecker;
use crate::registry::ServiceRecord;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ORIGIN};
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for the service that served the response
const X_GATEWAY_SERVICE: &str = "x-gateway-service";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// First delay between readiness probes
const READY_POLL_INITIAL_MS: u64 = 50;
/// Upper bound on the delay between readiness probes
const READY_POLL_MAX_MS: u64 = 1_000;

/// A request path split into the target service and the path it receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub service: String,
    /// Path forwarded to the service, always starting with `/`
    pub forwarded_path: String,
    /// Query string, without the leading `?`
    pub query: Option<String>,
}

impl Route {
    /// Forwarded path plus the original query string
    pub fn path_and_query(&self) -> String {
        match self.query {
            Some(ref query) => format!("{}?{}", self.forwarded_path, query),
            None => self.forwarded_path.clone(),
        }
    }
}

/// `/svc/a/b?x=1` becomes service `svc`, path `/a/b`, query `x=1`
pub fn parse_route(uri: &Uri) -> Option<Route> {
    let path = uri.path().trim_start_matches('/');
    let (service, rest) = match path.split_once('/') {
        Some((service, rest)) => (service, rest),
        None => (path, ""),
    };

    if !config::is_valid_service_name(service) {
        return None;
    }

    Some(Route {
        service: service.to_string(),
        forwarded_path: format!("/{}", rest),
        query: uri.query().map(String::from),
    })
}

/// Tracks which start of each service has passed the readiness wait.
///
/// Every request for a freshly started service waits behind the same gate,
/// so none is forwarded before the first probe succeeds or the startup
/// bound expires.
#[derive(Default)]
pub struct ReadinessGates {
    gates: DashMap<String, Arc<tokio::sync::Mutex<Option<DateTime<Utc>>>>>,
}

impl ReadinessGates {
    async fn ensure_ready(
        &self,
        health: &HealthChecker,
        settings: &GatewaySettings,
        record: &ServiceRecord,
    ) {
        let gate = Arc::clone(self.gates.entry(record.name.clone()).or_default().value());

        let mut confirmed = gate.lock().await;
        if *confirmed == record.start_time {
            return;
        }
        wait_until_ready(health, settings, record).await;
        *confirmed = record.start_time;
    }
}

/// Make sure `name` is running, registering and starting it if needed
pub async fn ensure_running(gateway: &Gateway, name: &str) -> Result<ServiceRecord, GatewayError> {
    let registry = gateway.registry();
    let record = match registry.get(name) {
        Some(record) => record,
        None => registry.register_configured(name)?,
    };

    let record = if record.is_running() {
        record
    } else {
        registry.start_service(name).await?
    };

    if !record.is_running() {
        return Err(GatewayError::ServiceUnavailable(name.to_string()));
    }

    let settings = gateway.config().settings();
    gateway
        .readiness()
        .ensure_ready(gateway.health(), &settings, &record)
        .await;
    Ok(record)
}

/// Wait the settle delay, then poll the health endpoint with exponential
/// backoff until it answers or the startup bound expires.
///
/// A 4xx answer counts as ready: the server is up even if the configured
/// path doesn't exist. Returns whether readiness was observed.
pub async fn wait_until_ready(
    health: &HealthChecker,
    settings: &GatewaySettings,
    record: &ServiceRecord,
) -> bool {
    let settle = settings.start_settle();
    if !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }

    let startup_timeout = settings.startup_timeout();
    let deadline = Instant::now() + startup_timeout;
    let mut delay = Duration::from_millis(READY_POLL_INITIAL_MS);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let probe = health.probe(record.port, &record.config.health_check);
        let bound = remaining.max(Duration::from_millis(1));
        if let Ok(result) = tokio::time::timeout(bound, probe).await {
            let ready = result.is_healthy()
                || matches!(result.http_status, Some(code) if (400..500).contains(&code));
            if ready {
                debug!(service = %record.name, attempts, "Service ready");
                return true;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                service = %record.name,
                attempts,
                startup_timeout_ms = startup_timeout.as_millis() as u64,
                "Service not ready within startup timeout, forwarding anyway"
            );
            return false;
        }

        tokio::time::sleep(delay.min(remaining)).await;
        delay = (delay * 2).min(Duration::from_millis(READY_POLL_MAX_MS));
    }
}

/// Route a request to its service and relay the response
pub async fn proxy_request(
    mut req: Request<Incoming>,
    gateway: &Gateway,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let request_id = Uuid::new_v4().to_string();

    let route = match parse_route(req.uri()) {
        Some(route) => route,
        None => {
            debug!(uri = %req.uri(), "No service in request path");
            return json_error_response(GatewayErrorCode::RouteNotFound, "Route not found");
        }
    };

    debug!(
        service = %route.service,
        method = %req.method(),
        path = %route.path_and_query(),
        request_id,
        "Incoming request"
    );

    let record = match ensure_running(gateway, &route.service).await {
        Ok(record) => record,
        Err(GatewayError::ServiceNotConfigured(_)) | Err(GatewayError::ServiceNotRegistered(_)) => {
            return json_error_response(GatewayErrorCode::ServiceNotFound, "Service not found");
        }
        Err(e) => {
            // Detail stays in the log
            error!(service = %route.service, error = %e, "Service unavailable");
            return annotate(
                json_error_response(GatewayErrorCode::ServiceUnavailable, "Service unavailable"),
                &route.service,
                &request_id,
            );
        }
    };

    gateway.registry().update_activity(&route.service);

    let original_host = req.headers().get(hyper::header::HOST).cloned().or_else(|| {
        req.uri()
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    });

    // This gateway is the first trusted hop, so client-supplied values are replaced
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let port = record.port;
    let timeout = gateway.config().settings().proxy_timeout();
    let path_and_query = route.path_and_query();

    let result = tokio::time::timeout(
        timeout,
        gateway.pool().send_request(req, port, &path_and_query),
    )
    .await;

    let response = match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(
                service = %route.service,
                port,
                request_id,
                error = %e,
                "Failed to forward request"
            );
            json_error_response(GatewayErrorCode::UpstreamError, "Internal server error")
        }
        Err(_) => {
            warn!(
                service = %route.service,
                port,
                request_id,
                timeout_ms = timeout.as_millis() as u64,
                "Upstream request timed out"
            );
            json_error_response(GatewayErrorCode::GatewayTimeout, "Gateway timeout")
        }
    };

    annotate(response, &route.service, &request_id)
}

fn annotate(
    mut response: Response<BoxBody<Bytes, hyper::Error>>,
    service: &str,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(service) {
        headers.insert(X_GATEWAY_SERVICE, value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    response
}

/// The gateway's HTTP listener
pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { dispatch(req, gateway, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Send `/api` traffic to the management API and everything else to services
async fn dispatch(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let cors_config = gateway.config().settings().cors;
    let origin = req.headers().get(ORIGIN).cloned();

    if cors_config.enabled && cors::is_preflight(&req) {
        return Ok(cors::preflight_response(&cors_config, origin.as_ref()));
    }

    let path = req.uri().path();
    let is_api = path
        .strip_prefix('/')
        .and_then(|p| p.strip_prefix(config::RESERVED_SERVICE_NAME))
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
    let mut response = if is_api {
        api::handle_api_request(req, &gateway).await
    } else {
        proxy_request(req, &gateway, client_addr).await
    };

    if cors_config.enabled {
        cors::apply_headers(response.headers_mut(), &cors_config, origin.as_ref());
    }
    Ok(response)
}
