//! Bounded retry loop around a single upstream call.
//!
//! Each attempt reports an [`AttemptError`] that says whether trying again can
//! help. Terminal failures return at once; rate limits, server errors, network
//! errors, and malformed payloads are retried with linear backoff until the
//! attempt budget is spent.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use coalesce_core::constants::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS};
use coalesce_core::error::{CoalesceError, Result, TerminalReason};

/// Why a single attempt failed.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AttemptError {
    /// Auth failure, not found, or any other refusal. Never retried.
    #[error("{reason}: {message}")]
    Terminal {
        /// Why the upstream refused.
        reason: TerminalReason,
        /// Upstream detail.
        message: String,
    },

    /// HTTP 429 or an equivalent quota status.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// 5xx or a network-level failure.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// A successful response that lacks the expected fields.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AttemptError {
    /// Creates a terminal error.
    pub fn terminal(reason: TerminalReason, message: impl Into<String>) -> Self {
        Self::Terminal {
            reason,
            message: message.into(),
        }
    }

    /// Creates a terminal not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::terminal(TerminalReason::NotFound, message)
    }

    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Terminal { .. })
    }
}

/// Retry configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call, including the first
    pub max_attempts: u32,
    /// Linear backoff unit in milliseconds
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

impl RetryConfig {
    /// Creates a config with the given budget and backoff unit.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
        }
    }

    /// Delay slept before the attempt with 0-based index `attempt`.
    ///
    /// The first attempt starts immediately; attempt `i` waits `i * base_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    /// Rejects a zero attempt budget.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CoalesceError::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// One failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchAttempt {
    /// 0-based attempt index
    pub index: u32,
    /// Delay slept before this attempt
    pub delay: Duration,
    /// How it failed
    pub error: AttemptError,
}

/// Result of a fetch together with the attempts that failed on the way.
#[derive(Debug)]
pub struct FetchReport<T> {
    /// Final outcome
    pub result: Result<T>,
    /// Failed attempts, in order
    pub attempts: Vec<FetchAttempt>,
}

impl<T> FetchReport<T> {
    /// Total attempts made, successful one included.
    pub fn attempt_count(&self) -> u32 {
        let failed = self.attempts.len() as u32;
        if self.result.is_ok() {
            failed + 1
        } else {
            failed
        }
    }
}

/// Runs one upstream call under a [`RetryConfig`].
#[derive(Clone, Debug, Default)]
pub struct RetryableFetcher {
    config: RetryConfig,
}

impl RetryableFetcher {
    /// Creates a fetcher with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Calls `attempt` until it succeeds, fails terminally, or the budget runs out.
    ///
    /// `attempt` receives the 0-based attempt index. `operation` names the call
    /// in logs and errors.
    pub async fn fetch<T, F, Fut>(&self, operation: &str, attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        self.fetch_recorded(operation, attempt).await.result
    }

    /// Like [`fetch`](Self::fetch), also returning the failed attempts.
    pub async fn fetch_recorded<T, F, Fut>(&self, operation: &str, mut attempt: F) -> FetchReport<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts: Vec<FetchAttempt> = Vec::new();

        for index in 0..max_attempts {
            let delay = self.config.delay_before(index);
            if !delay.is_zero() {
                debug!(operation, attempt = index + 1, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }

            match attempt(index).await {
                Ok(value) => {
                    if index > 0 {
                        info!(operation, attempts = index + 1, "Fetch succeeded after retry");
                    }
                    return FetchReport {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(AttemptError::Terminal { reason, message }) => {
                    debug!(operation, %reason, %message, "Terminal upstream error, not retrying");
                    attempts.push(FetchAttempt {
                        index,
                        delay,
                        error: AttemptError::terminal(reason, message.clone()),
                    });
                    return FetchReport {
                        result: Err(CoalesceError::TerminalUpstream { reason, message }),
                        attempts,
                    };
                }
                Err(error) => {
                    warn!(
                        operation,
                        attempt = index + 1,
                        max_attempts,
                        error = %error,
                        "Retryable upstream error"
                    );
                    attempts.push(FetchAttempt { index, delay, error });
                }
            }
        }

        let result = Err(exhausted(operation, max_attempts, attempts.last()));
        FetchReport { result, attempts }
    }
}

/// Classifies a spent retry budget by its last failure.
fn exhausted(operation: &str, attempts: u32, last: Option<&FetchAttempt>) -> CoalesceError {
    match last.map(|a| &a.error) {
        Some(AttemptError::RateLimited(_)) => CoalesceError::RateLimited {
            operation: operation.to_string(),
            attempts,
        },
        Some(error) => CoalesceError::UpstreamService {
            operation: operation.to_string(),
            attempts,
            reason: error.to_string(),
        },
        None => CoalesceError::Internal(format!("'{}' made no attempts", operation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fetcher() -> RetryableFetcher {
        RetryableFetcher::new(RetryConfig::default())
    }

    #[test]
    fn test_linear_backoff_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_before(0), Duration::ZERO);
        assert_eq!(config.delay_before(1), Duration::from_millis(1000));
        assert_eq!(config.delay_before(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::new(0, Duration::from_millis(10)).validate().is_err());
    }

    #[test]
    fn test_attempt_error_retryability() {
        assert!(AttemptError::RateLimited("429".into()).is_retryable());
        assert!(AttemptError::Upstream("502".into()).is_retryable());
        assert!(AttemptError::Malformed("no results".into()).is_retryable());
        assert!(!AttemptError::not_found("404").is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let report = fetcher()
            .fetch_recorded("weather", move |index| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if index < 2 {
                        Err(AttemptError::RateLimited("HTTP 429".into()))
                    } else {
                        Ok("sunny")
                    }
                }
            })
            .await;

        assert_eq!(report.result, Ok("sunny"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.attempt_count(), 3);
        assert_eq!(report.attempts[0].delay, Duration::ZERO);
        assert_eq!(report.attempts[1].delay, Duration::from_millis(1000));
        // 0 + 1s + 2s of backoff
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3100), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_returns_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let result: Result<()> = fetcher()
            .fetch("geocode", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptError::terminal(TerminalReason::Unauthorized, "HTTP 401")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(
            result,
            Err(CoalesceError::TerminalUpstream {
                reason: TerminalReason::Unauthorized,
                message: "HTTP 401".into(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rate_limit_is_classified() {
        let result: Result<()> = fetcher()
            .fetch("weather", |_| async { Err(AttemptError::RateLimited("HTTP 429".into())) })
            .await;

        assert_eq!(
            result,
            Err(CoalesceError::RateLimited {
                operation: "weather".into(),
                attempts: 3,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_malformed_is_upstream_error() {
        let report = fetcher()
            .fetch_recorded("geocode", |_| async {
                Err::<(), _>(AttemptError::Malformed("missing geometry".into()))
            })
            .await;

        assert_eq!(report.attempts.len(), 3);
        match report.result {
            Err(CoalesceError::UpstreamService { attempts, reason, .. }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("missing geometry"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_decides_exhaustion_class() {
        let result: Result<()> = fetcher()
            .fetch("weather", |index| async move {
                if index == 2 {
                    Err(AttemptError::Upstream("HTTP 503".into()))
                } else {
                    Err(AttemptError::RateLimited("HTTP 429".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(CoalesceError::UpstreamService { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let fetcher = RetryableFetcher::new(RetryConfig::new(1, Duration::from_secs(5)));

        let result: Result<()> = fetcher
            .fetch("once", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptError::Upstream("connection reset".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_recoverable());
    }
}
