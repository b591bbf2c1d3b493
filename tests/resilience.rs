//! Resilience behavior: retry, circuit breaking, backpressure, fallback.

use anyllm::error::{Error, ErrorContext, ErrorKind};
use anyllm::resilience::{
    BackpressureConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, FallbackChain,
    FallbackConfig, JitterStrategy, ResilientConfig, ResilientExecutor, RetryConfig,
};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn rate_limited_with_hint(retry_after_ms: u64) -> Error {
    Error::new(ErrorKind::RateLimited, "HTTP 429").with_context(
        ErrorContext::new()
            .with_status_code(429)
            .with_retry_after_ms(retry_after_ms),
    )
}

#[tokio::test]
async fn retry_honors_retry_after_hints() {
    // Two 429s carrying a 100ms hint, then success: three attempts and at
    // least 200ms of accumulated delay.
    let executor = ResilientExecutor::new(ResilientConfig {
        retry: Some(RetryConfig {
            max_retries: 3,
            min_delay: Duration::from_millis(10),
            jitter: JitterStrategy::None,
            ..RetryConfig::default()
        }),
        ..ResilientConfig::default()
    });

    let calls = AtomicU32::new(0);
    let started = Instant::now();
    let (result, stats) = executor
        .execute_with_stats(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(rate_limited_with_hint(100))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(stats.attempts, 3);
    assert!(stats.total_retry_delay >= Duration::from_millis(200));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn circuit_breaker_trip_and_recovery() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 1,
        cooldown: Duration::from_millis(100),
        half_open_max_concurrent: 1,
    });

    for _ in 0..2 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(Error::new(ErrorKind::ServerError, "HTTP 500")) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Rejected immediately, operation never invoked
    let invoked = AtomicU32::new(0);
    let err = breaker
        .execute(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(()) }
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::CircuitOpen);
    assert!(err.time_until_retry().is_some());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let out = breaker.execute(|| async { Ok::<_, Error>("recovered") }).await;
    assert_eq!(out.unwrap(), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn fallback_chain_routes_to_secondary() {
    let chain = FallbackChain::new(FallbackConfig::default())
        .add_target("primary", 2.0, || async {
            Err::<&str, _>(Error::new(ErrorKind::ServerError, "HTTP 500"))
        })
        .add_target("secondary", 1.0, || async { Ok("ok") });

    let result = chain.execute().await;
    assert!(result.success);
    assert_eq!(result.target_used.as_deref(), Some("secondary"));
    assert_eq!(result.targets_tried, vec!["primary", "secondary"]);
    assert!(result.errors.contains_key("primary"));
}

#[tokio::test]
async fn fallback_totality_on_non_fallbackable_error() {
    // A BadRequest would fail identically on any provider: no alternate
    // may be attempted.
    let secondary_called = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&secondary_called);

    let chain = FallbackChain::new(FallbackConfig::default())
        .add_target("primary", 2.0, || async {
            Err::<&str, _>(Error::new(ErrorKind::BadRequest, "schema error"))
        })
        .add_target("secondary", 1.0, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("never")
            }
        });

    let result = chain.execute().await;
    assert!(!result.success);
    assert_eq!(result.targets_tried, vec!["primary"]);
    assert_eq!(secondary_called.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn backpressure_is_a_strict_bound() {
    let executor = Arc::new(ResilientExecutor::new(ResilientConfig {
        backpressure: Some(BackpressureConfig {
            max_concurrent: 4,
            queue_timeout: Some(Duration::from_secs(10)),
        }),
        ..ResilientConfig::default()
    }));

    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let executor = Arc::clone(&executor);
        let live = Arc::clone(&live);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            executor
                .execute(move || {
                    let live = Arc::clone(&live);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Error>(())
                    }
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
}

#[test]
fn retry_delays_are_monotonic_without_jitter() {
    let policy = anyllm::resilience::RetryPolicy::new(RetryConfig {
        max_retries: 10,
        min_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(60),
        jitter: JitterStrategy::None,
        ..RetryConfig::default()
    });

    let mut previous = Duration::ZERO;
    for attempt in 0..10 {
        let delay = policy.calculate_delay(attempt, None);
        assert!(delay >= previous);
        previous = delay;
    }
}

#[tokio::test]
async fn token_bucket_admission_bound() {
    use anyllm::resilience::{RateLimiter, RateLimiterConfig};

    let limiter = RateLimiter::new(
        RateLimiterConfig::from_rps(100.0).unwrap().with_burst(10.0),
    );

    let started = Instant::now();
    let mut admitted = 0u32;
    while started.elapsed() < Duration::from_millis(150) {
        if limiter.try_acquire(1.0).await {
            admitted += 1;
        } else {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // rate × window + burst, with margin for the final refill
    let bound = 100.0 * started.elapsed().as_secs_f64() + 10.0 + 1.0;
    assert!(
        (admitted as f64) <= bound,
        "admitted {} exceeds {}",
        admitted,
        bound
    );
}

#[tokio::test]
async fn circuit_transition_observed_at_threshold() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        ..CircuitBreakerConfig::default()
    });

    breaker.on_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);
    breaker.on_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);
    breaker.on_failure();
    // The very next observation sees Open
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn executor_rejects_fast_when_circuit_open() {
    let executor = ResilientExecutor::new(ResilientConfig {
        circuit_breaker: Some(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            cooldown: Duration::from_secs(60),
            half_open_max_concurrent: 1,
        }),
        ..ResilientConfig::default()
    });

    let (result, _) = executor
        .execute_with_stats(|| async {
            Err::<(), _>(Error::new(ErrorKind::ServerError, "HTTP 500"))
        })
        .await;
    assert!(result.is_err());

    let started = Instant::now();
    let (result, stats) = executor
        .execute_with_stats(|| async { Ok::<_, Error>(()) })
        .await;
    assert_eq!(result.unwrap_err().kind, ErrorKind::CircuitOpen);
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(!stats.success);
}
