use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use bloomgate::{app, build_state, GatewayConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Tracks environment variable mutations and restores originals on drop.
#[allow(dead_code)]
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Bookkeeping for the mock generation service.
#[derive(Default)]
pub struct MockUpstream {
    pub hits: AtomicUsize,
    /// Number of leading requests answered with 500 before succeeding.
    pub fail_first: AtomicUsize,
    pub last_query: std::sync::Mutex<Option<String>>,
}

const FAKE_PNG: &[u8] = &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

async fn serve_image(
    State(mock): State<Arc<MockUpstream>>,
    Path(_prompt): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    mock.hits.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut guard) = mock.last_query.lock() {
        *guard = Some(format!(
            "model={} width={} height={}",
            params.get("model").cloned().unwrap_or_default(),
            params.get("width").cloned().unwrap_or_default(),
            params.get("height").cloned().unwrap_or_default(),
        ));
    }
    let remaining = mock.fail_first.load(Ordering::SeqCst);
    if remaining > 0 {
        mock.fail_first.fetch_sub(1, Ordering::SeqCst);
        return (StatusCode::INTERNAL_SERVER_ERROR, "generation failed").into_response();
    }
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "image/png")],
        FAKE_PNG.to_vec(),
    )
        .into_response()
}

/// Start a mock generation endpoint mirroring the upstream URL shape:
/// GET /{prompt}?key=..&model=..&width=..&height=..
#[allow(dead_code)]
pub async fn spawn_mock_upstream() -> (String, Arc<MockUpstream>, JoinHandle<()>) {
    let mock = Arc::new(MockUpstream::default());
    let router = Router::new()
        .route("/:prompt", get(serve_image))
        .with_state(mock.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), mock, handle)
}

/// Launch the gateway with the given configuration and return its base URL.
#[allow(dead_code)]
pub async fn spawn_gateway(config: GatewayConfig) -> (String, JoinHandle<()>) {
    let state = build_state(config).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

/// Baseline test configuration: one allowed origin, mock upstream, no
/// signing secret, delay floor disabled so sequential requests pass.
#[allow(dead_code)]
pub fn test_config(upstream_url: &str) -> GatewayConfig {
    let mut config = GatewayConfig {
        allowed_origins: vec!["https://shop.example".into()],
        upstream_url: format!("{}/", upstream_url),
        upstream_api_key: Some("upstream-key".into()),
        log_stdout: false,
        ..GatewayConfig::default()
    };
    config.rate.min_delay_ms = 0;
    config
}
