//! Gateway errors and JSON error responses

use crate::supervisor::SupervisorError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Failures of registry and routing operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No configuration exists for the requested name
    #[error("service '{0}' is not configured")]
    ServiceNotConfigured(String),

    /// The name has never been registered with the registry
    #[error("service '{0}' is not registered")]
    ServiceNotRegistered(String),

    /// The process supervisor could not launch the service
    #[error("failed to start service '{service}': {source}")]
    StartFailure {
        service: String,
        #[source]
        source: SupervisorError,
    },

    /// The process supervisor could not stop the service
    #[error("failed to stop service '{service}': {source}")]
    StopFailure {
        service: String,
        #[source]
        source: SupervisorError,
    },

    /// The service did not end up running after a start
    #[error("service '{0}' is not running")]
    ServiceUnavailable(String),
}

impl GatewayError {
    /// Client-facing error code for this failure
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::ServiceNotConfigured(_) | GatewayError::ServiceNotRegistered(_) => {
                GatewayErrorCode::ServiceNotFound
            }
            GatewayError::StartFailure { .. } | GatewayError::StopFailure { .. } => {
                GatewayErrorCode::OperationFailed
            }
            GatewayError::ServiceUnavailable(_) => GatewayErrorCode::ServiceUnavailable,
        }
    }
}

/// Error codes returned to gateway clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Path has no service segment
    RouteNotFound,
    /// Unknown or unconfigured service name
    ServiceNotFound,
    /// Management endpoint does not exist
    EndpointNotFound,
    /// Service could not be brought to running
    ServiceUnavailable,
    /// Service must be running for this operation
    ServiceNotRunning,
    /// Unknown lifecycle action
    InvalidAction,
    /// Upstream did not answer within the proxy timeout
    GatewayTimeout,
    /// Upstream connection or transport failure
    UpstreamError,
    /// A start/stop/restart request failed
    OperationFailed,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::ServiceNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::EndpointNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ServiceNotRunning => StatusCode::CONFLICT,
            GatewayErrorCode::InvalidAction => StatusCode::BAD_REQUEST,
            GatewayErrorCode::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::UpstreamError => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::OperationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            GatewayErrorCode::EndpointNotFound => "ENDPOINT_NOT_FOUND",
            GatewayErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            GatewayErrorCode::ServiceNotRunning => "SERVICE_NOT_RUNNING",
            GatewayErrorCode::InvalidAction => "INVALID_ACTION",
            GatewayErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            GatewayErrorCode::UpstreamError => "UPSTREAM_ERROR",
            GatewayErrorCode::OperationFailed => "OPERATION_FAILED",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
