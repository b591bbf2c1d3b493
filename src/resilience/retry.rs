//! Retry with exponential backoff and jitter.

use crate::error::{Error, ErrorKind};
use crate::manifest::RetryPolicyConfig;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

/// Jitter applied to the computed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterStrategy {
    /// Use the backoff as computed
    None,
    /// uniform(0, backoff)
    #[default]
    Full,
    /// backoff/2 + uniform(0, backoff/2)
    Equal,
}

impl JitterStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(JitterStrategy::None),
            "full" => Some(JitterStrategy::Full),
            "equal" => Some(JitterStrategy::Equal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry attempts after the initial one; 0 disables retries
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter: JitterStrategy,
    pub exponential_base: f64,
    /// HTTP statuses that qualify for retry
    pub retry_on_status: HashSet<u16>,
    /// Error kinds that qualify for retry
    pub retry_on_kinds: HashSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60000),
            jitter: JitterStrategy::Full,
            exponential_base: 2.0,
            retry_on_status: [429, 500, 502, 503, 504].into_iter().collect(),
            retry_on_kinds: [
                ErrorKind::TransportConnect,
                ErrorKind::TransportTimeout,
                ErrorKind::RateLimited,
                ErrorKind::ServerError,
                ErrorKind::Overloaded,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Build from a manifest's retry_policy section; absent fields keep
    /// the defaults.
    pub fn from_manifest(policy: Option<&RetryPolicyConfig>) -> Self {
        let mut config = Self::default();
        let Some(policy) = policy else {
            return config;
        };
        if let Some(max) = policy.max_retries {
            config.max_retries = max;
        }
        if let Some(min) = policy.min_delay_ms {
            config.min_delay = Duration::from_millis(min);
        }
        if let Some(max) = policy.max_delay_ms {
            config.max_delay = Duration::from_millis(max);
        }
        if let Some(jitter) = policy.jitter.as_deref().and_then(JitterStrategy::parse) {
            config.jitter = jitter;
        }
        if let Some(statuses) = &policy.retry_on_http_status {
            config.retry_on_status = statuses.iter().copied().collect();
        }
        config
    }
}

/// Outcome of a retried execution, for stats reporting.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: crate::Result<T>,
    /// Total attempts made (≥ 1)
    pub attempts: u32,
    /// Cumulative sleep between attempts
    pub total_delay: Duration,
}

pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff for a 0-based attempt index. An explicit server hint
    /// overrides the computation.
    pub fn calculate_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            if hint > Duration::ZERO {
                return hint;
            }
        }

        let base_ms = self.config.min_delay.as_millis() as f64
            * self.config.exponential_base.powi(attempt as i32);
        let base_ms = base_ms.min(self.config.max_delay.as_millis() as f64);

        let jittered_ms = match self.config.jitter {
            JitterStrategy::None => base_ms,
            JitterStrategy::Full => rand_uniform(0.0, base_ms),
            JitterStrategy::Equal => base_ms / 2.0 + rand_uniform(0.0, base_ms / 2.0),
        };

        Duration::from_secs_f64((jittered_ms / 1000.0).max(0.0))
    }

    /// Retry decision: attempts remain, the kind is retryable per the
    /// taxonomy, and the kind or HTTP status is in the configured sets.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        if attempt >= self.config.max_retries {
            return false;
        }
        if !error.is_retryable() {
            return false;
        }
        if self.config.retry_on_kinds.contains(&error.kind) {
            return true;
        }
        error
            .status_code()
            .map(|status| self.config.retry_on_status.contains(&status))
            .unwrap_or(false)
    }

    /// Run an operation with retries, reporting attempts and accumulated
    /// delay alongside the result.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                        total_delay,
                    }
                }
                Err(error) => {
                    if !self.should_retry(&error, attempt) {
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt + 1,
                            total_delay,
                        };
                    }

                    let delay = self.calculate_delay(attempt, error.retry_after());
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        kind = error.kind.label(),
                        "retrying after failure"
                    );
                    total_delay += delay;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn rand_uniform(low: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    use rand::Rng;
    rand::thread_rng().gen_range(low..high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32, min_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            min_delay: Duration::from_millis(min_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter: JitterStrategy::None,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn delay_is_monotonic_without_jitter() {
        let policy = no_jitter(10, 100, 60_000);
        let mut previous = Duration::ZERO;
        for attempt in 0..8 {
            let delay = policy.calculate_delay(attempt, None);
            assert!(delay >= previous, "delay({}) regressed", attempt);
            previous = delay;
        }
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = no_jitter(10, 1000, 4000);
        assert_eq!(policy.calculate_delay(0, None), Duration::from_millis(1000));
        assert_eq!(policy.calculate_delay(1, None), Duration::from_millis(2000));
        assert_eq!(policy.calculate_delay(2, None), Duration::from_millis(4000));
        assert_eq!(policy.calculate_delay(9, None), Duration::from_millis(4000));
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let policy = no_jitter(3, 1000, 60_000);
        let delay = policy.calculate_delay(0, Some(Duration::from_millis(100)));
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn jitter_bounds() {
        let full = RetryPolicy::new(RetryConfig {
            jitter: JitterStrategy::Full,
            min_delay: Duration::from_millis(1000),
            ..RetryConfig::default()
        });
        let equal = RetryPolicy::new(RetryConfig {
            jitter: JitterStrategy::Equal,
            min_delay: Duration::from_millis(1000),
            ..RetryConfig::default()
        });
        for _ in 0..64 {
            let f = full.calculate_delay(0, None);
            assert!(f <= Duration::from_millis(1000));
            let e = equal.calculate_delay(0, None);
            assert!(e >= Duration::from_millis(500));
            assert!(e <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn non_retryable_kinds_never_retry() {
        let policy = no_jitter(5, 1, 10);
        let err = Error::new(ErrorKind::BadRequest, "schema error");
        assert!(!policy.should_retry(&err, 0));
        let err = Error::new(ErrorKind::Authentication, "bad key");
        assert!(!policy.should_retry(&err, 0));
    }

    #[test]
    fn attempts_exhaust() {
        let policy = no_jitter(2, 1, 10);
        let err = Error::new(ErrorKind::ServerError, "HTTP 500");
        assert!(policy.should_retry(&err, 0));
        assert!(policy.should_retry(&err, 1));
        assert!(!policy.should_retry(&err, 2));
    }

    #[tokio::test]
    async fn retries_until_success_with_retry_after() {
        // Two RateLimited failures carrying a 100ms hint, then success.
        let policy = no_jitter(3, 10, 60_000);
        let calls = AtomicU32::new(0);

        let started = std::time::Instant::now();
        let outcome = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::new(ErrorKind::RateLimited, "HTTP 429").with_context(
                            crate::ErrorContext::new()
                                .with_status_code(429)
                                .with_retry_after_ms(100),
                        ))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "ok");
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.total_delay >= Duration::from_millis(200));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn manifest_policy_applies() {
        let policy = RetryPolicyConfig {
            max_retries: Some(5),
            min_delay_ms: Some(50),
            max_delay_ms: Some(500),
            jitter: Some("none".into()),
            retry_on_http_status: Some(vec![429, 503]),
        };
        let config = RetryConfig::from_manifest(Some(&policy));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.min_delay, Duration::from_millis(50));
        assert_eq!(config.jitter, JitterStrategy::None);
        assert!(config.retry_on_status.contains(&503));
        assert!(!config.retry_on_status.contains(&500));
    }
}
