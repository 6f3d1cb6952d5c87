//! Response composition: status codes, security/CORS headers and JSON
//! bodies for every exit path of the pipeline.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::upstream::UpstreamImage;
use crate::validate::GenerationPayload;

const CORS_ALLOW_HEADERS: &str = "Content-Type, X-API-Key, X-Timestamp, X-Nonce, X-Signature";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse {
    pub success: bool,
    pub image_url: String,
    pub width: i64,
    pub height: i64,
    pub model: String,
    pub size: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Standard security headers plus CORS headers reflected only for allowed
/// origins.
pub fn security_headers(cfg: &GatewayConfig, origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let fixed: [(HeaderName, &str); 6] = [
        (
            HeaderName::from_static("x-content-type-options"),
            "nosniff",
        ),
        (HeaderName::from_static("x-frame-options"), "DENY"),
        (HeaderName::from_static("x-xss-protection"), "1; mode=block"),
        (
            header::STRICT_TRANSPORT_SECURITY,
            "max-age=31536000; includeSubDomains",
        ),
        (
            HeaderName::from_static("referrer-policy"),
            "strict-origin-when-cross-origin",
        ),
        (
            HeaderName::from_static("permissions-policy"),
            "geolocation=(), microphone=(), camera=()",
        ),
    ];
    for (name, value) in fixed {
        headers.insert(name, HeaderValue::from_static(value));
    }
    if cfg.origin_allowed(origin) {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(CORS_ALLOW_HEADERS),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("POST, OPTIONS"),
            );
            headers.insert(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static("86400"),
            );
        }
    }
    headers
}

/// Preflight answer: 200, CORS headers, empty body. No other component runs.
pub fn preflight(cfg: &GatewayConfig, origin: &str) -> Response {
    (StatusCode::OK, security_headers(cfg, origin)).into_response()
}

pub fn error(cfg: &GatewayConfig, origin: &str, err: &GatewayError) -> Response {
    let mut headers = security_headers(cfg, origin);
    let retry_after = err.retry_after();
    if let Some(secs) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            headers.insert(header::RETRY_AFTER, value);
        }
    }
    let body = ErrorResponse {
        error: err.to_string(),
        details: err.client_details().map(str::to_string),
        retry_after,
    };
    (err.status_code(), headers, Json(body)).into_response()
}

/// Success path: the generated artifact embedded as a base64 data URL.
pub fn success(
    cfg: &GatewayConfig,
    origin: &str,
    payload: &GenerationPayload,
    image: &UpstreamImage,
) -> Response {
    let data_url = format!(
        "data:{};base64,{}",
        image.content_type,
        BASE64.encode(&image.bytes)
    );
    let body = SuccessResponse {
        success: true,
        image_url: data_url,
        width: payload.width,
        height: payload.height,
        model: payload.model.clone(),
        size: image.bytes.len(),
    };
    (
        StatusCode::OK,
        security_headers(cfg, origin),
        Json(body),
    )
        .into_response()
}
