//! Error types shared across the server framework.
//!
//! All request-path failures funnel into [`AppError`], which maps onto an
//! HTTP status code and a JSON body of the form `{ error, message, code }`.
//! Stack traces and internal detail never leave the process; they are logged
//! server-side and the client receives only the stable error code.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Unified error type for request processing, clustering and configuration.
///
/// Variants are grouped by fault class: client faults (4xx), server faults
/// (5xx) and operational faults that never reach a client directly but are
/// reported between subsystems.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    /// Malformed request: unparseable body, bad header, invalid parameters.
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// Request body exceeded the configured size limit.
    #[error("Payload exceeds limit of {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: usize },

    /// Input filtering detected hostile content in the request.
    ///
    /// `paths` lists the offending locations (`body.user.name`,
    /// `query.q`, ...) so clients can correct the input.
    #[error("Request blocked: threats detected at {}", paths.join(", "))]
    ThreatDetected { paths: Vec<String> },

    /// CSRF double-submit verification failed for an unsafe method.
    #[error("CSRF token missing or mismatched")]
    CsrfRejected,

    /// CORS policy rejected the request origin.
    #[error("Origin not allowed: {origin}")]
    OriginRejected { origin: String },

    /// No route matches the requested path.
    #[error("No route found for path: {path}")]
    RouteNotFound { path: String },

    /// A route exists for the path but not for this method.
    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    /// Rate limit exceeded for one of the active scopes.
    #[error("Too many requests (scope {scope}), retry after {retry_after_secs}s")]
    TooManyRequests { scope: String, retry_after_secs: u64 },

    /// Uncaught handler failure or broken internal invariant.
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// The request used an HTTP method the server does not implement.
    #[error("Method not implemented: {method}")]
    NotImplemented { method: String },

    /// Admission control refused the request or the server is draining.
    #[error("Service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// The request exceeded its route timeout budget.
    #[error("Request timed out after {elapsed_ms}ms")]
    GatewayTimeout { elapsed_ms: u64 },

    /// A response was written twice, or headers were set after the body.
    #[error("Response state violation: {message}")]
    ResponseState { message: String },

    /// A worker process failed to become ready within its startup window.
    #[error("Worker {worker_id} failed to start: {reason}")]
    WorkerStartup { worker_id: String, reason: String },

    /// An IPC request-reply expired without an answer.
    #[error("IPC request {envelope_id} timed out")]
    IpcTimeout { envelope_id: String },

    /// An IPC message exceeded the configured size ceiling.
    #[error("IPC message of {size} bytes exceeds limit of {limit} bytes")]
    IpcOversize { size: usize, limit: usize },

    /// The cache could not free enough space within its eviction budget.
    #[error("insufficient-capacity: cache cannot admit {needed_bytes} bytes")]
    CacheCapacity { needed_bytes: usize },

    /// Configuration could not be parsed or failed validation.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// No free port could be acquired within the attempt budget.
    #[error("Unable to acquire a port near {desired} after {attempts} attempts")]
    PortAcquisition { desired: u16, attempts: u32 },
}

impl AppError {
    /// Stable machine-readable code included in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest { .. } => "bad_request",
            AppError::PayloadTooLarge { .. } => "payload_too_large",
            AppError::ThreatDetected { .. } => "threat_detected",
            AppError::CsrfRejected => "csrf_rejected",
            AppError::OriginRejected { .. } => "origin_rejected",
            AppError::RouteNotFound { .. } => "route_not_found",
            AppError::MethodNotAllowed { .. } => "method_not_allowed",
            AppError::TooManyRequests { .. } => "too_many_requests",
            AppError::Internal { .. } => "internal_error",
            AppError::NotImplemented { .. } => "not_implemented",
            AppError::ServiceUnavailable { .. } => "service_unavailable",
            AppError::GatewayTimeout { .. } => "gateway_timeout",
            AppError::ResponseState { .. } => "response_state",
            AppError::WorkerStartup { .. } => "worker_startup_failed",
            AppError::IpcTimeout { .. } => "ipc_timeout",
            AppError::IpcOversize { .. } => "ipc_oversize",
            AppError::CacheCapacity { .. } => "insufficient_capacity",
            AppError::Config { .. } => "config_error",
            AppError::PortAcquisition { .. } => "port_acquisition_failed",
        }
    }

    /// HTTP status for this error when it surfaces on a request path.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest { .. } | AppError::ThreatDetected { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::CsrfRejected | AppError::OriginRejected { .. } => StatusCode::FORBIDDEN,
            AppError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Serializes the client-facing JSON body for this error.
    ///
    /// Internal variants deliberately collapse to a generic message so that
    /// implementation detail (worker ids, capacity numbers, lock state) is
    /// never disclosed to callers.
    pub fn body(&self) -> serde_json::Value {
        let message = match self {
            AppError::Internal { .. }
            | AppError::ResponseState { .. }
            | AppError::WorkerStartup { .. }
            | AppError::IpcTimeout { .. }
            | AppError::IpcOversize { .. }
            | AppError::CacheCapacity { .. }
            | AppError::Config { .. }
            | AppError::PortAcquisition { .. } => "Internal server error".to_string(),
            other => other.to_string(),
        };
        json!({
            "error": self.status().canonical_reason().unwrap_or("Error"),
            "message": message,
            "code": self.code(),
        })
    }

    /// Seconds to advertise in `Retry-After`, when this error is retryable.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::TooManyRequests {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            AppError::ServiceUnavailable { .. } => Some(1),
            _ => None,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status());
        if let Some(secs) = self.retry_after() {
            builder.insert_header(("Retry-After", secs.to_string()));
        }
        builder.json(self.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(
            AppError::BadRequest {
                message: "x".into()
            }
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::CsrfRejected.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::TooManyRequests {
                scope: "ip:1.2.3.4".into(),
                retry_after_secs: 12
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn internal_detail_is_not_disclosed() {
        let err = AppError::WorkerStartup {
            worker_id: "w3".into(),
            reason: "exec not found".into(),
        };
        let body = err.body();
        assert_eq!(body["message"], "Internal server error");
        assert_eq!(body["code"], "worker_startup_failed");
    }

    #[test]
    fn retry_after_present_for_rate_limit() {
        let err = AppError::TooManyRequests {
            scope: "global".into(),
            retry_after_secs: 42,
        };
        assert_eq!(err.retry_after(), Some(42));
        assert_eq!(err.body()["code"], "too_many_requests");
    }
}
