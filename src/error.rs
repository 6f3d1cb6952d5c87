//! Error taxonomy for the gateway decision pipeline.
//!
//! Every variant maps to exactly one HTTP status and one safe, templated
//! message. Internal detail (upstream bodies, parse errors) travels through
//! telemetry, never back to the caller beyond a short truncation.

use axum::http::StatusCode;
use thiserror::Error;

use crate::telemetry::Severity;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// First violated input rule; the message itself is client-safe.
    #[error("{0}")]
    Validation(String),
    #[error("Forbidden: Origin not allowed")]
    OriginForbidden,
    #[error("Method not allowed. Only POST requests are accepted.")]
    MethodNotAllowed,
    #[error("Unauthorized: Invalid API key")]
    ApiKeyInvalid,
    #[error("Invalid request signature")]
    SignatureInvalid,
    #[error("Replay attack detected: nonce already used")]
    ReplayDetected,
    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },
    #[error("Circuit breaker open: API temporarily unavailable")]
    CircuitOpen,
    /// Upstream returned a non-success status or the transport failed. The
    /// detail is already truncated by the invoker.
    #[error("Upstream API error: {status}")]
    Upstream { status: u16, detail: String },
    #[error("Server configuration error")]
    Configuration(String),
    #[error("Internal server error")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::OriginForbidden => StatusCode::FORBIDDEN,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::ApiKeyInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::ReplayDetected => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            // Reflect the upstream status when it is representable, else 502.
            GatewayError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Telemetry event name for the decision branch this error terminates.
    pub fn event(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_input",
            GatewayError::OriginForbidden => "forbidden_origin",
            GatewayError::MethodNotAllowed => "invalid_method",
            GatewayError::ApiKeyInvalid => "invalid_api_key",
            GatewayError::SignatureInvalid => "invalid_signature",
            GatewayError::ReplayDetected => "replay_attack",
            GatewayError::RateLimited { .. } => "rate_limit_exceeded",
            GatewayError::CircuitOpen => "circuit_open",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Configuration(_) => "configuration_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            GatewayError::Validation(_) => Severity::Warning,
            GatewayError::OriginForbidden => Severity::Error,
            GatewayError::MethodNotAllowed => Severity::Warning,
            GatewayError::ApiKeyInvalid => Severity::Warning,
            GatewayError::SignatureInvalid => Severity::Critical,
            GatewayError::ReplayDetected => Severity::Critical,
            GatewayError::RateLimited { .. } => Severity::Warning,
            GatewayError::CircuitOpen => Severity::Warning,
            GatewayError::Upstream { .. } => Severity::Error,
            GatewayError::Configuration(_) => Severity::Critical,
            GatewayError::Internal(_) => Severity::Error,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Client-visible `details` field, if any. Only the truncated upstream
    /// body is ever exposed here.
    pub fn client_details(&self) -> Option<&str> {
        match self {
            GatewayError::Upstream { detail, .. } if !detail.is_empty() => Some(detail),
            _ => None,
        }
    }

    /// Internal detail for telemetry, never sent to the caller.
    pub fn log_detail(&self) -> Option<&str> {
        match self {
            GatewayError::Configuration(detail) => Some(detail),
            GatewayError::Internal(detail) => Some(detail),
            GatewayError::Upstream { detail, .. } => Some(detail),
            _ => None,
        }
    }
}
