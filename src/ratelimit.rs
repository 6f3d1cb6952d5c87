//! Multi-window rate limiting over an injected counter store.
//!
//! Four counters per identity: per-minute, per-hour, per-day and one global
//! per-day counter shared by everyone. Counters are incremented first and
//! checked against their ceilings in ascending window order, so the
//! tightest-scoped limit produces the most specific retry-after. A minimum
//! inter-request delay applies on top of the counts. Store failures log a
//! warning and allow the request.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::identity::ClientIdentity;
use crate::store::CounterStore;

const MINUTE_SECS: u64 = 60;
const HOUR_SECS: u64 = 3_600;
const DAY_SECS: u64 = 86_400;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
    pub global_per_day: u64,
    pub min_delay_ms: i64,
}

struct Window {
    kind: &'static str,
    secs: u64,
    ceiling: u64,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Allow or deny one request for `identity` at `now_ms`. On acceptance
    /// the identity's last-seen marker is updated; denials leave it alone so
    /// the delay floor measures accepted requests only.
    pub async fn check(
        &self,
        identity: &ClientIdentity,
        now_ms: i64,
    ) -> Result<(), GatewayError> {
        let id = identity.rate_key();
        let windows = [
            Window {
                kind: "minute",
                secs: MINUTE_SECS,
                ceiling: self.config.per_minute,
            },
            Window {
                kind: "hour",
                secs: HOUR_SECS,
                ceiling: self.config.per_hour,
            },
            Window {
                kind: "day",
                secs: DAY_SECS,
                ceiling: self.config.per_day,
            },
        ];

        for window in &windows {
            let bucket = now_ms as u64 / (window.secs * 1_000);
            let key = format!("rate:{}:{}:{}", id, window.kind, bucket);
            let count = match self.store.incr(&key, window.secs).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(error=%err, window = window.kind, "counter store unavailable, allowing request");
                    return Ok(());
                }
            };
            if count > window.ceiling {
                let reset_ms = ((bucket + 1) * window.secs * 1_000) as i64;
                return Err(GatewayError::RateLimited {
                    message: format!(
                        "Rate limit exceeded: {} requests per {}",
                        window.ceiling, window.kind
                    ),
                    retry_after: Some(secs_until(reset_ms, now_ms)),
                });
            }
        }

        // Global daily ceiling across all identities.
        let day_bucket = now_ms as u64 / (DAY_SECS * 1_000);
        let global_key = format!("rate:global:day:{}", day_bucket);
        match self.store.incr(&global_key, DAY_SECS).await {
            Ok(count) if count > self.config.global_per_day => {
                let reset_ms = ((day_bucket + 1) * DAY_SECS * 1_000) as i64;
                return Err(GatewayError::RateLimited {
                    message: "Daily request limit reached. Please try again tomorrow.".into(),
                    retry_after: Some(secs_until(reset_ms, now_ms)),
                });
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error=%err, "counter store unavailable for global ceiling, allowing request");
                return Ok(());
            }
        }

        let last_key = format!("rate:{}:last", id);
        if self.config.min_delay_ms > 0 {
            let last = self.store.last_seen(&last_key).await.unwrap_or(None);
            if let Some(last_ms) = last {
                let since = now_ms - last_ms;
                if since < self.config.min_delay_ms {
                    let wait_secs = div_ceil_ms(self.config.min_delay_ms - since);
                    return Err(GatewayError::RateLimited {
                        message: format!("Please wait {} seconds between requests", wait_secs),
                        retry_after: Some(wait_secs),
                    });
                }
            }
        }
        if let Err(err) = self.store.set_last_seen(&last_key, now_ms, HOUR_SECS).await {
            tracing::warn!(error=%err, "failed to record last-seen marker");
        }
        Ok(())
    }
}

fn secs_until(reset_ms: i64, now_ms: i64) -> u64 {
    div_ceil_ms((reset_ms - now_ms).max(0))
}

fn div_ceil_ms(ms: i64) -> u64 {
    (((ms.max(0)) + 999) / 1_000) as u64
}
