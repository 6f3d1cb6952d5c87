//! Core library for Bloomgate, a hardened gateway in front of a
//! third-party image generation API. This module wires together the
//! security pipeline (origin and key checks, signature verification,
//! replay protection, rate limiting, circuit breaking), shared state
//! and the HTTP handlers.

pub mod breaker;
pub mod config;
pub mod error;
pub mod identity;
pub mod ratelimit;
pub mod response;
pub mod signing;
pub mod store;
pub mod telemetry;
pub mod upstream;
pub mod validate;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use identity::ClientIdentity;
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use store::{CounterStore, MemoryCounters, MemoryNonceLedger, NonceLedger};
pub use telemetry::{RotatingWriter, Severity, TelemetrySink};
pub use upstream::UpstreamClient;
pub use validate::GenerationPayload;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::any, routing::get, Json, Router};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Instant;
use subtle::ConstantTimeEq;

use crate::store::{RedisCounters, RedisNonceLedger};

/// Raw generation request body. Width and height arrive as raw JSON
/// numbers so fractional values can be rejected rather than silently
/// truncated; signing material may arrive here or in headers.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct GenerateRequest {
    pub prompt: Option<String>,
    pub width: Option<serde_json::Number>,
    pub height: Option<serde_json::Number>,
    pub model: Option<String>,
    pub timestamp: Option<i64>,
    pub nonce: Option<String>,
    pub signature: Option<String>,
}

/// Request-outcome counters exposed on `/metrics`.
#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub success_total: AtomicU64,
    pub denied_origin_total: AtomicU64,
    pub denied_method_total: AtomicU64,
    pub denied_auth_total: AtomicU64,
    pub denied_validation_total: AtomicU64,
    pub denied_rate_limit_total: AtomicU64,
    pub denied_breaker_total: AtomicU64,
    pub upstream_errors_total: AtomicU64,
}

impl Metrics {
    fn record(&self, err: &GatewayError) {
        let counter = match err {
            GatewayError::OriginForbidden => &self.denied_origin_total,
            GatewayError::MethodNotAllowed => &self.denied_method_total,
            GatewayError::ApiKeyInvalid
            | GatewayError::SignatureInvalid
            | GatewayError::ReplayDetected => &self.denied_auth_total,
            GatewayError::Validation(_) => &self.denied_validation_total,
            GatewayError::RateLimited { .. } => &self.denied_rate_limit_total,
            GatewayError::CircuitOpen => &self.denied_breaker_total,
            GatewayError::Upstream { .. }
            | GatewayError::Configuration(_)
            | GatewayError::Internal(_) => &self.upstream_errors_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared application state. Cheap to clone; every stateful collaborator
/// sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub breaker: Arc<CircuitBreaker>,
    pub nonces: Arc<dyn NonceLedger>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
    pub telemetry: TelemetrySink,
    pub metrics: Arc<Metrics>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Assemble shared state from a parsed configuration. Opens the telemetry
/// writer and the Redis connection up front; both degrade with a warning
/// rather than failing startup.
pub async fn build_state(config: GatewayConfig) -> anyhow::Result<AppState> {
    let writer = match config.log_file.as_deref() {
        Some(path) => {
            match RotatingWriter::open(
                path,
                config.rotation.max_bytes,
                config.rotation.keep,
                config.rotation.compress,
            ) {
                Ok(writer) => Some(Arc::new(Mutex::new(writer))),
                Err(e) => {
                    tracing::warn!(path=%path, error=%e, "Failed to open security log file; events go to stdout only");
                    None
                }
            }
        }
        None => None,
    };
    let telemetry = TelemetrySink::new(writer, config.log_stdout);

    if config.signing_secret.is_none() {
        tracing::warn!(
            "SIGNING_SECRET not set: running permissive, signature and replay checks disabled"
        );
    }
    if config.upstream_api_key.is_none() {
        tracing::warn!("UPSTREAM_API_KEY not set: generation requests will fail");
    }

    let nonce_ttl_secs = (config.timestamp_tolerance_ms / 1_000).max(1) as u64;
    let (nonces, counters): (Arc<dyn NonceLedger>, Arc<dyn CounterStore>) =
        match config.redis_url.as_deref() {
            Some(url) => match connect_redis(url).await {
                Ok(conn) => (
                    Arc::new(RedisNonceLedger::new(conn.clone(), nonce_ttl_secs)),
                    Arc::new(RedisCounters::new(conn)),
                ),
                Err(e) => {
                    tracing::warn!(error=%e, "Redis unavailable; falling back to in-memory stores");
                    (
                        Arc::new(MemoryNonceLedger::new()),
                        Arc::new(MemoryCounters::new()),
                    )
                }
            },
            None => (
                Arc::new(MemoryNonceLedger::new()),
                Arc::new(MemoryCounters::new()),
            ),
        };

    let limiter = Arc::new(RateLimiter::new(counters, config.rate.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker_threshold,
        config.breaker_reset_ms,
    ));
    let upstream = Arc::new(UpstreamClient::new(
        &config.upstream_url,
        config.upstream_timeout_ms,
    )?);

    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    Ok(AppState {
        config: Arc::new(config),
        breaker,
        nonces,
        limiter,
        upstream,
        telemetry,
        metrics: Arc::new(Metrics::default()),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    })
}

async fn connect_redis(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url)?;
    let conn = client.get_connection_manager().await?;
    Ok(conn)
}

/// Build state from environment variables. See `GatewayConfig::from_env`
/// for the variables consulted.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = GatewayConfig::from_env()?;
    build_state(config).await
}

/// Build the Axum router. `/generate-image` accepts any method so the
/// handler can answer CORS preflights and reject the rest itself.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;

    let router = Router::new()
        .route("/generate-image", any(generate_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

fn request_origin(headers: &HeaderMap) -> String {
    headers
        .get(header::ORIGIN)
        .or_else(|| headers.get(header::REFERER))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn api_key_matches(expected: &str, headers: &HeaderMap) -> bool {
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// One exit point for every denial: emits the security event, bumps the
/// outcome counter and composes the client response.
fn deny(
    state: &AppState,
    origin: &str,
    identity: Option<&ClientIdentity>,
    err: GatewayError,
    details: serde_json::Value,
) -> Response {
    state
        .telemetry
        .emit(err.severity(), err.event(), identity, details);
    state.metrics.record(&err);
    response::error(&state.config, origin, &err)
}

async fn generate_handler(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let identity = identity::resolve(&headers);
    let origin = request_origin(&headers);

    if method == Method::OPTIONS {
        return response::preflight(&state.config, &origin);
    }
    if method != Method::POST {
        return deny(
            &state,
            &origin,
            Some(&identity),
            GatewayError::MethodNotAllowed,
            serde_json::json!({ "method": method.as_str() }),
        );
    }
    if !state.config.origin_allowed(&origin) {
        return deny(
            &state,
            &origin,
            Some(&identity),
            GatewayError::OriginForbidden,
            serde_json::json!({ "origin": origin }),
        );
    }
    if let Some(expected) = state.config.frontend_api_key.as_deref() {
        if !api_key_matches(expected, &headers) {
            return deny(
                &state,
                &origin,
                Some(&identity),
                GatewayError::ApiKeyInvalid,
                serde_json::json!({}),
            );
        }
    }

    let now = now_ms();
    if let Err(err) = state.breaker.preflight(now) {
        return deny(
            &state,
            &origin,
            Some(&identity),
            err,
            serde_json::json!({ "state": state.breaker.state().as_str() }),
        );
    }

    let request: GenerateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            return deny(
                &state,
                &origin,
                Some(&identity),
                GatewayError::Validation("Invalid JSON in request body".into()),
                serde_json::json!({ "reason": "malformed_json" }),
            );
        }
    };

    let payload = match validate::validate(&request, &state.config) {
        Ok(payload) => payload,
        Err(err) => {
            let reason = err.to_string();
            return deny(
                &state,
                &origin,
                Some(&identity),
                err,
                serde_json::json!({ "reason": reason }),
            );
        }
    };

    if let Some(secret) = state.config.signing_secret.as_deref() {
        let material = match signing::extract_material(&request, &headers) {
            Some(material) => material,
            None => {
                return deny(
                    &state,
                    &origin,
                    Some(&identity),
                    GatewayError::SignatureInvalid,
                    serde_json::json!({ "code": "missing_material" }),
                );
            }
        };
        if let Err(failure) = signing::verify(
            secret,
            &request,
            &material,
            now,
            state.config.timestamp_tolerance_ms,
        ) {
            return deny(
                &state,
                &origin,
                Some(&identity),
                GatewayError::SignatureInvalid,
                serde_json::json!({ "code": failure.code() }),
            );
        }
        if !state.nonces.insert_if_absent(&material.nonce, now).await {
            return deny(
                &state,
                &origin,
                Some(&identity),
                GatewayError::ReplayDetected,
                serde_json::json!({ "nonce": material.nonce }),
            );
        }
    }

    if let Err(err) = state.limiter.check(&identity, now).await {
        let message = err.to_string();
        return deny(
            &state,
            &origin,
            Some(&identity),
            err,
            serde_json::json!({ "reason": message }),
        );
    }

    let Some(api_key) = state.config.upstream_api_key.as_deref() else {
        return deny(
            &state,
            &origin,
            Some(&identity),
            GatewayError::Configuration("UPSTREAM_API_KEY not set".into()),
            serde_json::json!({}),
        );
    };

    match state
        .upstream
        .generate(&payload, api_key, &state.breaker, now)
        .await
    {
        Ok(image) => {
            state.metrics.success_total.fetch_add(1, Ordering::Relaxed);
            state.telemetry.emit(
                Severity::Info,
                "image_generated",
                Some(&identity),
                serde_json::json!({
                    "model": payload.model,
                    "width": payload.width,
                    "height": payload.height,
                    "size": image.bytes.len(),
                    "responseTimeMs": started.elapsed().as_millis() as u64,
                }),
            );
            response::success(&state.config, &origin, &payload, &image)
        }
        Err(failure) => {
            if let Some(failures) = failure.breaker_opened {
                state.telemetry.emit(
                    Severity::Critical,
                    "circuit_breaker_opened",
                    None,
                    serde_json::json!({ "consecutiveFailures": failures }),
                );
            }
            let detail = failure.error.log_detail().unwrap_or("").to_string();
            deny(
                &state,
                &origin,
                Some(&identity),
                failure.error,
                serde_json::json!({ "detail": detail }),
            )
        }
    }
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "breaker": state.breaker.state().as_str(),
        "permissiveMode": state.config.signing_secret.is_none(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    use std::fmt::Write as _;
    let mut buf = String::new();
    let m = &state.metrics;
    let counters: [(&str, &str, u64); 9] = [
        (
            "bloomgate_requests_total",
            "Total generation requests received",
            m.requests_total.load(Ordering::Relaxed),
        ),
        (
            "bloomgate_success_total",
            "Requests that returned a generated image",
            m.success_total.load(Ordering::Relaxed),
        ),
        (
            "bloomgate_denied_origin_total",
            "Requests denied for a disallowed origin",
            m.denied_origin_total.load(Ordering::Relaxed),
        ),
        (
            "bloomgate_denied_method_total",
            "Requests denied for a non-POST method",
            m.denied_method_total.load(Ordering::Relaxed),
        ),
        (
            "bloomgate_denied_auth_total",
            "Requests denied for key, signature or replay",
            m.denied_auth_total.load(Ordering::Relaxed),
        ),
        (
            "bloomgate_denied_validation_total",
            "Requests denied by input validation",
            m.denied_validation_total.load(Ordering::Relaxed),
        ),
        (
            "bloomgate_denied_rate_limit_total",
            "Requests denied by rate limiting",
            m.denied_rate_limit_total.load(Ordering::Relaxed),
        ),
        (
            "bloomgate_denied_breaker_total",
            "Requests short-circuited by the open breaker",
            m.denied_breaker_total.load(Ordering::Relaxed),
        ),
        (
            "bloomgate_upstream_errors_total",
            "Upstream, configuration and internal failures",
            m.upstream_errors_total.load(Ordering::Relaxed),
        ),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} counter", name).ok();
        writeln!(&mut buf, "{} {}", name, value).ok();
    }
    let breaker_gauge = match state.breaker.state() {
        BreakerState::Closed => 0,
        BreakerState::Open => 1,
        BreakerState::HalfOpen => 2,
    };
    writeln!(
        &mut buf,
        "# HELP bloomgate_breaker_state Circuit breaker state (0 closed, 1 open, 2 half-open)\n# TYPE bloomgate_breaker_state gauge"
    )
    .ok();
    writeln!(&mut buf, "bloomgate_breaker_state {}", breaker_gauge).ok();
    writeln!(
        &mut buf,
        "# HELP bloomgate_telemetry_lines_total Security event JSON lines written\n# TYPE bloomgate_telemetry_lines_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "bloomgate_telemetry_lines_total {}",
        state.telemetry.lines_total()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP bloomgate_telemetry_write_errors_total Security event line write failures\n# TYPE bloomgate_telemetry_write_errors_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "bloomgate_telemetry_write_errors_total {}",
        state.telemetry.write_errors_total()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP bloomgate_build_info Build information\n# TYPE bloomgate_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "bloomgate_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP bloomgate_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE bloomgate_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "bloomgate_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP bloomgate_process_uptime_seconds Process uptime seconds\n# TYPE bloomgate_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "bloomgate_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
