use std::env;

use anyhow::{anyhow, Result};

use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

/// Gateway configuration, environment-provided. Nothing here is hard-coded
/// at call sites; tests construct this struct directly.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HMAC signing secret. Absent means permissive mode: signature and
    /// replay checks are skipped entirely. Insecure default for staged
    /// rollout, warned about at startup.
    pub signing_secret: Option<String>,
    /// Static shared key the web client presents via `X-API-Key`. Absent
    /// means the check is skipped.
    pub frontend_api_key: Option<String>,
    /// Key for the upstream generation service. Absent is a per-request
    /// configuration error, not a startup failure.
    pub upstream_api_key: Option<String>,
    pub upstream_url: String,
    pub upstream_timeout_ms: u64,
    pub allowed_origins: Vec<String>,
    pub allowed_models: Vec<String>,
    pub default_model: String,
    pub default_width: i64,
    pub default_height: i64,
    pub min_dimension: i64,
    pub max_dimension: i64,
    pub min_prompt_len: usize,
    pub max_prompt_len: usize,
    pub rate: RateLimitConfig,
    pub timestamp_tolerance_ms: i64,
    pub nonce_sweep_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_reset_ms: i64,
    /// Shared counter/nonce store. Absent means instance-local best-effort
    /// enforcement.
    pub redis_url: Option<String>,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub max_request_bytes: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            frontend_api_key: None,
            upstream_api_key: None,
            upstream_url: "https://gen.pollinations.ai/image".to_string(),
            upstream_timeout_ms: 30_000,
            allowed_origins: vec![
                "https://bexyflowers.shop".to_string(),
                "https://www.bexyflowers.shop".to_string(),
                "http://localhost:5173".to_string(),
                "http://localhost:5174".to_string(),
            ],
            allowed_models: vec![
                "flux".to_string(),
                "flux-realism".to_string(),
                "flux-anime".to_string(),
                "flux-3d".to_string(),
                "turbo".to_string(),
            ],
            default_model: "flux".to_string(),
            default_width: 1024,
            default_height: 1024,
            min_dimension: 256,
            max_dimension: 2048,
            min_prompt_len: 10,
            max_prompt_len: 1_000,
            rate: RateLimitConfig {
                per_minute: 10,
                per_hour: 100,
                per_day: 500,
                global_per_day: 10_000,
                min_delay_ms: 2_000,
            },
            timestamp_tolerance_ms: 300_000,
            nonce_sweep_ms: 600_000,
            breaker_threshold: 5,
            breaker_reset_ms: 60_000,
            redis_url: None,
            log_file: None,
            rotation: RotationConfig {
                max_bytes: None,
                keep: 1,
                compress: false,
            },
            log_stdout: false,
            max_request_bytes: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let rate = RateLimitConfig {
            per_minute: parse_optional_u64("BLOOMGATE_RATE_PER_MINUTE")?
                .unwrap_or(defaults.rate.per_minute),
            per_hour: parse_optional_u64("BLOOMGATE_RATE_PER_HOUR")?
                .unwrap_or(defaults.rate.per_hour),
            per_day: parse_optional_u64("BLOOMGATE_RATE_PER_DAY")?
                .unwrap_or(defaults.rate.per_day),
            global_per_day: parse_optional_u64("BLOOMGATE_RATE_GLOBAL_PER_DAY")?
                .unwrap_or(defaults.rate.global_per_day),
            min_delay_ms: parse_optional_u64("BLOOMGATE_MIN_DELAY_MS")?
                .map(|v| v as i64)
                .unwrap_or(defaults.rate.min_delay_ms),
        };
        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            signing_secret: non_empty_var("BLOOMGATE_SIGNING_SECRET"),
            frontend_api_key: non_empty_var("BLOOMGATE_API_KEY"),
            upstream_api_key: non_empty_var("UPSTREAM_API_KEY"),
            upstream_url: non_empty_var("BLOOMGATE_UPSTREAM_URL")
                .unwrap_or(defaults.upstream_url),
            upstream_timeout_ms: parse_optional_u64("BLOOMGATE_UPSTREAM_TIMEOUT_MS")?
                .unwrap_or(defaults.upstream_timeout_ms),
            allowed_origins: parse_list("BLOOMGATE_ALLOWED_ORIGINS")
                .unwrap_or(defaults.allowed_origins),
            allowed_models: parse_list("BLOOMGATE_ALLOWED_MODELS")
                .unwrap_or(defaults.allowed_models),
            default_model: non_empty_var("BLOOMGATE_DEFAULT_MODEL")
                .unwrap_or(defaults.default_model),
            default_width: parse_optional_u64("BLOOMGATE_DEFAULT_WIDTH")?
                .map(|v| v as i64)
                .unwrap_or(defaults.default_width),
            default_height: parse_optional_u64("BLOOMGATE_DEFAULT_HEIGHT")?
                .map(|v| v as i64)
                .unwrap_or(defaults.default_height),
            min_dimension: parse_optional_u64("BLOOMGATE_DIM_MIN")?
                .map(|v| v as i64)
                .unwrap_or(defaults.min_dimension),
            max_dimension: parse_optional_u64("BLOOMGATE_DIM_MAX")?
                .map(|v| v as i64)
                .unwrap_or(defaults.max_dimension),
            min_prompt_len: parse_optional_u64("BLOOMGATE_PROMPT_MIN")?
                .map(|v| v as usize)
                .unwrap_or(defaults.min_prompt_len),
            max_prompt_len: parse_optional_u64("BLOOMGATE_PROMPT_MAX")?
                .map(|v| v as usize)
                .unwrap_or(defaults.max_prompt_len),
            rate,
            timestamp_tolerance_ms: parse_optional_u64("BLOOMGATE_TIMESTAMP_TOLERANCE_MS")?
                .map(|v| v as i64)
                .unwrap_or(defaults.timestamp_tolerance_ms),
            nonce_sweep_ms: parse_optional_u64("BLOOMGATE_NONCE_SWEEP_MS")?
                .unwrap_or(defaults.nonce_sweep_ms),
            breaker_threshold: parse_optional_u64("BLOOMGATE_BREAKER_THRESHOLD")?
                .map(|v| v as u32)
                .unwrap_or(defaults.breaker_threshold),
            breaker_reset_ms: parse_optional_u64("BLOOMGATE_BREAKER_RESET_MS")?
                .map(|v| v as i64)
                .unwrap_or(defaults.breaker_reset_ms),
            redis_url: non_empty_var("REDIS_URL"),
            log_file: non_empty_var("LOG_FILE"),
            rotation,
            log_stdout: parse_bool_env("BLOOMGATE_LOG_STDOUT")?.unwrap_or(false),
            max_request_bytes: parse_optional_u64("BLOOMGATE_MAX_REQUEST_BYTES")?
                .map(|v| v as usize),
        })
    }

    /// Prefix match against the origin allow-list, per the storefront's
    /// deployment layout (apex plus www plus local dev servers).
    pub fn origin_allowed(&self, origin: &str) -> bool {
        !origin.is_empty() && self.allowed_origins.iter().any(|a| origin.starts_with(a))
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_list(var: &str) -> Option<Vec<String>> {
    non_empty_var(var).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
