//! External I/O clients (cloud speech-to-text, cloud structuring) wrapped
//! with shared retry-with-jitter and per-target circuit breaker logic.

pub mod structuring;
pub mod transcription;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

use crate::config::SessionEngineConfig;
use crate::telemetry::events::{record_breaker_state, record_retry_attempt};

pub use structuring::{HttpStructuringClient, StructuringClient};
pub use transcription::{HttpTranscriptionClient, TranscriptionClient};

#[derive(Debug, Error)]
pub enum ExternalCallError {
    #[error("request to {target} timed out after {elapsed:?}")]
    Timeout { target: String, elapsed: Duration },
    #[error("circuit breaker open for {target}")]
    BreakerOpen { target: String },
    #[error("{target} request failed: {message}")]
    Upstream { target: String, message: String },
}

impl ExternalCallError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExternalCallError::Timeout { .. } | ExternalCallError::BreakerOpen { .. }
        )
    }
}

/// Hand-rolled circuit breaker over atomics, in the shape of the teacher's
/// `CloudCircuit`: closed by default, opens after a run of consecutive
/// failures within a window, and allows a single probe attempt once the
/// half-open cooldown has elapsed.
pub(crate) struct CircuitBreaker {
    name: &'static str,
    open: AtomicBool,
    consecutive_failures: AtomicU32,
    window_start_ms: AtomicU64,
    reopen_at_ms: AtomicU64,
    fail_threshold: u32,
    fail_window: Duration,
    half_open_after: Duration,
}

impl CircuitBreaker {
    pub(crate) fn new(name: &'static str, config: &SessionEngineConfig) -> Self {
        Self {
            name,
            open: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(0),
            reopen_at_ms: AtomicU64::new(0),
            fail_threshold: config.breaker_fail_threshold,
            fail_window: config.breaker_fail_window,
            half_open_after: config.breaker_half_open_after,
        }
    }

    fn now_ms(started_at: Instant) -> u64 {
        started_at.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    /// Returns `true` if a call may proceed. A single probe call is let
    /// through once the half-open cooldown elapses; the breaker stays
    /// reported as open to callers until that probe succeeds.
    pub(crate) fn allow(&self, started_at: Instant) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return true;
        }

        let now = Self::now_ms(started_at);
        now >= self.reopen_at_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            record_breaker_state(self.name, "closed");
        }
    }

    pub(crate) fn record_failure(&self, started_at: Instant) {
        let now = Self::now_ms(started_at);
        let window_start = self.window_start_ms.load(Ordering::SeqCst);
        if now.saturating_sub(window_start) > self.fail_window.as_millis() as u64 {
            self.window_start_ms.store(now, Ordering::SeqCst);
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.fail_threshold {
            let was_open = self.open.swap(true, Ordering::SeqCst);
            self.reopen_at_ms.store(
                now.saturating_add(self.half_open_after.as_millis() as u64),
                Ordering::SeqCst,
            );
            if !was_open {
                record_breaker_state(self.name, "open");
            }
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Runs `attempt` with exponential backoff and jitter, stopping early once
/// the breaker trips or the attempt budget is exhausted.
pub(crate) async fn retry_with_breaker<F, Fut, O>(
    client_name: &'static str,
    config: &SessionEngineConfig,
    breaker: &CircuitBreaker,
    started_at: Instant,
    mut attempt: F,
) -> Result<O, ExternalCallError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<O, String>>,
{
    if !breaker.allow(started_at) {
        return Err(ExternalCallError::BreakerOpen {
            target: client_name.to_string(),
        });
    }

    let mut backoff = config.retry_base;
    let mut last_error = String::new();

    for attempt_no in 1..=config.retry_max_attempts {
        match attempt().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(message) => {
                last_error = message;
                breaker.record_failure(started_at);

                if attempt_no == config.retry_max_attempts || breaker.is_open() {
                    break;
                }

                let jitter_span = backoff.as_secs_f64() * (config.retry_jitter_pct / 100.0);
                let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
                let sleep_for =
                    Duration::from_secs_f64((backoff.as_secs_f64() + jitter).max(0.0))
                        .min(config.retry_cap);

                record_retry_attempt(client_name, attempt_no, config.retry_max_attempts, sleep_for);
                tokio::time::sleep(sleep_for).await;

                backoff = Duration::from_secs_f64(backoff.as_secs_f64() * config.retry_factor)
                    .min(config.retry_cap);
            }
        }
    }

    Err(ExternalCallError::Upstream {
        target: client_name.to_string(),
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::Arc;

    fn test_config() -> SessionEngineConfig {
        let mut config = SessionEngineConfig::default();
        config.retry_max_attempts = 3;
        config.retry_base = Duration::from_millis(1);
        config.retry_cap = Duration::from_millis(5);
        config.breaker_fail_threshold = 2;
        config
    }

    #[tokio::test]
    async fn retries_until_success() {
        let config = test_config();
        let breaker = CircuitBreaker::new("test", &config);
        let started_at = Instant::now();
        let attempts = Arc::new(StdAtomicU32::new(0));

        let result = retry_with_breaker("test", &config, &breaker, started_at, || {
            let attempts = attempts.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_blocks_further_calls() {
        let config = test_config();
        let breaker = CircuitBreaker::new("test", &config);
        let started_at = Instant::now();

        let result: Result<(), ExternalCallError> =
            retry_with_breaker("test", &config, &breaker, started_at, || async {
                Err::<(), _>("boom".to_string())
            })
            .await;

        assert!(result.is_err());
        assert!(breaker.is_open());

        let blocked: Result<(), ExternalCallError> =
            retry_with_breaker("test", &config, &breaker, started_at, || async {
                Ok::<(), String>(())
            })
            .await;
        assert!(matches!(blocked, Err(ExternalCallError::BreakerOpen { .. })));
    }
}
