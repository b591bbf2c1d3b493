//! The resilient executor: backpressure → rate limit → circuit breaker →
//! retry, composed around any async operation.
//!
//! One rate-limit token is charged per `execute` call, never per retry
//! attempt; the backpressure permit is likewise held across all attempts
//! of a single execution — retries reuse the slot they already occupy.

use crate::resilience::backpressure::{Backpressure, BackpressureConfig};
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
use crate::resilience::retry::{RetryConfig, RetryPolicy};
use crate::Result;
use std::future::Future;
use std::time::Duration;

/// Combined configuration; a `None` mechanism is the identity.
#[derive(Debug, Clone, Default)]
pub struct ResilientConfig {
    pub retry: Option<RetryConfig>,
    pub rate_limit: Option<RateLimiterConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub backpressure: Option<BackpressureConfig>,
}

impl ResilientConfig {
    /// Every mechanism enabled with library defaults.
    pub fn standard() -> Self {
        Self {
            retry: Some(RetryConfig::default()),
            rate_limit: RateLimiterConfig::from_rps(10.0),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            backpressure: Some(BackpressureConfig::default()),
        }
    }

    /// Basic retry only.
    pub fn minimal() -> Self {
        Self {
            retry: Some(RetryConfig {
                max_retries: 2,
                ..RetryConfig::default()
            }),
            ..Self::default()
        }
    }

    /// Production-leaning defaults: tighter delays, bounded concurrency.
    pub fn production() -> Self {
        Self {
            retry: Some(RetryConfig {
                max_retries: 3,
                min_delay: Duration::from_millis(1000),
                max_delay: Duration::from_millis(30000),
                ..RetryConfig::default()
            }),
            rate_limit: RateLimiterConfig::from_rps(10.0),
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 5,
                cooldown: Duration::from_secs(30),
                ..CircuitBreakerConfig::default()
            }),
            backpressure: Some(BackpressureConfig {
                max_concurrent: 10,
                queue_timeout: Some(Duration::from_secs(30)),
            }),
        }
    }
}

/// Per-execution report.
#[derive(Debug, Clone)]
pub struct ExecutionStats {
    pub success: bool,
    /// Attempts made, including the first (≥ 1)
    pub attempts: u32,
    /// Cumulative sleep spent between retry attempts
    pub total_retry_delay: Duration,
    /// Time spent waiting for a rate-limit token
    pub rate_limit_wait: Duration,
    /// Breaker state observed at the start of the execution
    pub circuit_state: CircuitState,
    /// In-flight operations when this execution started
    pub inflight_at_start: usize,
}

/// Facts-only snapshot of the executor's live state.
#[derive(Debug, Clone, Default)]
pub struct SignalsSnapshot {
    pub inflight: Option<InflightSnapshot>,
    pub rate_limiter: Option<RateLimiterSnapshot>,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
}

#[derive(Debug, Clone)]
pub struct InflightSnapshot {
    pub max: usize,
    pub available: usize,
    pub in_use: usize,
    pub peak: usize,
}

/// Executor composing the four mechanisms. State lives for the lifetime
/// of its owner and is reset only by explicit `reset()`.
pub struct ResilientExecutor {
    name: String,
    retry: Option<RetryPolicy>,
    rate_limiter: Option<RateLimiter>,
    breaker: Option<CircuitBreaker>,
    backpressure: Option<Backpressure>,
}

impl ResilientExecutor {
    pub fn new(config: ResilientConfig) -> Self {
        Self::named("default", config)
    }

    pub fn named(name: impl Into<String>, config: ResilientConfig) -> Self {
        Self {
            name: name.into(),
            retry: config.retry.map(RetryPolicy::new),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            breaker: config.circuit_breaker.map(CircuitBreaker::new),
            backpressure: config.backpressure.map(Backpressure::new),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(|b| b.state())
    }

    pub fn current_inflight(&self) -> usize {
        self.backpressure
            .as_ref()
            .map(|bp| bp.current_inflight())
            .unwrap_or(0)
    }

    /// Execute an operation through every configured mechanism.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let (result, _stats) = self.execute_with_stats(operation).await;
        result
    }

    /// Execute and report statistics, even on failure.
    pub async fn execute_with_stats<T, F, Fut>(
        &self,
        operation: F,
    ) -> (Result<T>, ExecutionStats)
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let (result, stats) = self.execute_holding_permit(operation).await;
        (result.map(|(value, _permit)| value), stats)
    }

    /// Like [`execute_with_stats`](Self::execute_with_stats), but hands the
    /// backpressure permit to the caller. Streaming dispatch needs this:
    /// the slot stays occupied until the event stream is dropped, not just
    /// until the connection opens.
    pub async fn execute_holding_permit<T, F, Fut>(
        &self,
        operation: F,
    ) -> (Result<(T, Option<crate::resilience::InflightPermit>)>, ExecutionStats)
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut stats = ExecutionStats {
            success: false,
            attempts: 1,
            total_retry_delay: Duration::ZERO,
            rate_limit_wait: Duration::ZERO,
            circuit_state: self.circuit_state().unwrap_or(CircuitState::Closed),
            inflight_at_start: self.current_inflight(),
        };

        // 1. Backpressure: the permit spans all retry attempts.
        let permit = match &self.backpressure {
            Some(bp) => match bp.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => return (Err(e), stats),
            },
            None => None,
        };

        // 2. Rate limit: one token per execution, not per attempt.
        if let Some(limiter) = &self.rate_limiter {
            stats.rate_limit_wait = limiter.acquire(1.0).await;
        }

        // 3. Circuit breaker admission; 4. retry inside it. The breaker
        // records one outcome per execution (after retries settle).
        let result = match &self.breaker {
            Some(breaker) => {
                let admission = match breaker.admit().await {
                    Ok(admission) => admission,
                    Err(e) => return (Err(e), stats),
                };
                let result = self
                    .run_with_retry(&operation, &mut stats.attempts, &mut stats.total_retry_delay)
                    .await;
                drop(admission);
                match &result {
                    Ok(_) => breaker.on_success(),
                    Err(_) => breaker.on_failure(),
                }
                result
            }
            None => {
                self.run_with_retry(&operation, &mut stats.attempts, &mut stats.total_retry_delay)
                    .await
            }
        };

        stats.success = result.is_ok();
        (result.map(|value| (value, permit)), stats)
    }

    async fn run_with_retry<T, F, Fut>(
        &self,
        operation: &F,
        attempts: &mut u32,
        total_delay: &mut Duration,
    ) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        match &self.retry {
            Some(policy) => {
                let outcome = policy.execute(operation).await;
                *attempts = outcome.attempts;
                *total_delay = outcome.total_delay;
                outcome.result
            }
            None => operation().await,
        }
    }

    /// Observe current resilience state without mutating it.
    pub async fn signals(&self) -> SignalsSnapshot {
        let inflight = self.backpressure.as_ref().and_then(|bp| {
            bp.max_concurrent().map(|max| InflightSnapshot {
                max,
                available: bp.available_permits().unwrap_or(max),
                in_use: bp.current_inflight(),
                peak: bp.peak_inflight(),
            })
        });

        let rate_limiter = match &self.rate_limiter {
            Some(limiter) => Some(limiter.snapshot().await),
            None => None,
        };

        let circuit_breaker = self.breaker.as_ref().map(|b| b.snapshot());

        SignalsSnapshot {
            inflight,
            rate_limiter,
            circuit_breaker,
        }
    }

    /// Apply server-reported rate-limit headers to the adaptive limiter.
    pub async fn observe_rate_limit_headers(
        &self,
        headers: &reqwest::header::HeaderMap,
        mapping: &crate::manifest::RateLimitHeaders,
    ) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.update_from_headers(headers, mapping).await;
        }
    }

    /// Reset mutable resilience state (the breaker). Bucket levels and
    /// in-flight counters converge on their own.
    pub fn reset(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.reset();
        }
    }
}
