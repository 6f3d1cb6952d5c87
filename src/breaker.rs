//! Circuit breaker guarding the upstream generation service.
//!
//! One shared instance governs all upstream calls; there is no per-identity
//! breaker. Closed counts consecutive failures, open short-circuits until
//! the reset timeout has elapsed, half-open admits a single probe.

use std::sync::Mutex;

use crate::error::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_ms: i64,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout_ms: i64,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout_ms: i64) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_ms: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called before each upstream attempt. While open, rejects until the
    /// reset timeout has elapsed; the request arriving after that moves the
    /// breaker to half-open (counter cleared) and is allowed through as the
    /// probe.
    pub fn preflight(&self, now_ms: i64) -> Result<(), GatewayError> {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            if now_ms - inner.last_failure_ms >= self.reset_timeout_ms {
                inner.state = BreakerState::HalfOpen;
                inner.consecutive_failures = 0;
            } else {
                return Err(GatewayError::CircuitOpen);
            }
        }
        Ok(())
    }

    /// Records a failed upstream call. Returns the failure count when this
    /// call transitioned the breaker to open, so the caller can emit the
    /// critical transition event exactly once.
    pub fn record_failure(&self, now_ms: i64) -> Option<u32> {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure_ms = now_ms;
        let should_open = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if should_open && inner.state != BreakerState::Open {
            inner.state = BreakerState::Open;
            return Some(inner.consecutive_failures);
        }
        None
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
        } else {
            inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }
}
