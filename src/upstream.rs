//! The bounded-timeout call to the external image generation service.
//!
//! The invoker classifies every outcome for the circuit breaker and never
//! retries; a failed call is terminal for the request that made it.

use std::time::Duration;

use url::Url;

use crate::breaker::CircuitBreaker;
use crate::error::GatewayError;
use crate::validate::GenerationPayload;

const ERROR_BODY_TRUNCATION: usize = 200;

pub struct UpstreamImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

pub struct UpstreamFailure {
    pub error: GatewayError,
    /// Set when this failure transitioned the breaker to open, carrying the
    /// consecutive failure count for the transition event.
    pub breaker_opened: Option<u32>,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("upstream URL '{}' cannot carry a path", base_url);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// Issues the generation call and records the outcome on the breaker.
    /// The per-request timeout cancels the call at the boundary regardless
    /// of whether the upstream is still sending data.
    pub async fn generate(
        &self,
        payload: &GenerationPayload,
        api_key: &str,
        breaker: &CircuitBreaker,
        now_ms: i64,
    ) -> Result<UpstreamImage, UpstreamFailure> {
        let url = match self.build_url(payload, api_key) {
            Ok(url) => url,
            Err(error) => {
                return Err(UpstreamFailure {
                    error,
                    breaker_opened: None,
                })
            }
        };

        let response = match self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "image/*")
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let detail = if err.is_timeout() {
                    "upstream request timed out".to_string()
                } else {
                    "upstream connection failed".to_string()
                };
                tracing::warn!(error=%err, "upstream transport failure");
                return Err(self.failure(breaker, now_ms, 502, detail));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(ERROR_BODY_TRUNCATION).collect();
            return Err(self.failure(breaker, now_ms, status.as_u16(), detail));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => {
                tracing::warn!(error=%err, "upstream body read failure");
                return Err(self.failure(
                    breaker,
                    now_ms,
                    502,
                    "upstream response truncated".to_string(),
                ));
            }
        };

        breaker.record_success();
        Ok(UpstreamImage {
            bytes,
            content_type,
        })
    }

    fn failure(
        &self,
        breaker: &CircuitBreaker,
        now_ms: i64,
        status: u16,
        detail: String,
    ) -> UpstreamFailure {
        UpstreamFailure {
            error: GatewayError::Upstream { status, detail },
            breaker_opened: breaker.record_failure(now_ms),
        }
    }

    fn build_url(
        &self,
        payload: &GenerationPayload,
        api_key: &str,
    ) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Internal("upstream URL cannot carry a path".into()))?
            .pop_if_empty()
            .push(&payload.prompt);
        url.query_pairs_mut()
            .append_pair("key", api_key)
            .append_pair("model", &payload.model)
            .append_pair("width", &payload.width.to_string())
            .append_pair("height", &payload.height.to_string());
        Ok(url)
    }
}
