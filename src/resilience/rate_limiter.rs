//! Token-bucket rate limiter, static and adaptive.
//!
//! Tokens refill continuously at `rate` per second up to `max_tokens`;
//! each admitted call consumes one (or `n`). Refills are driven purely by
//! monotonic time. Server-reported rate-limit headers adjust the bucket:
//! a remaining count is applied as a snapshot of the bucket (not as a
//! refill event), and limit+reset recompute the rate and capacity.

use crate::manifest::RateLimitHeaders;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Tokens per second; zero means unlimited.
    pub rate_per_s: f64,
    /// Bucket capacity (burst size).
    pub max_tokens: f64,
}

impl RateLimiterConfig {
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self {
            rate_per_s: rps,
            // one second of burst, at least a single token
            max_tokens: rps.max(1.0),
        })
    }

    pub fn from_rpm(rpm: f64) -> Option<Self> {
        Self::from_rps(rpm / 60.0)
    }

    pub fn unlimited() -> Self {
        Self {
            rate_per_s: 0.0,
            max_tokens: 1.0,
        }
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.max_tokens = burst.max(1.0);
        self
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        if self.rate <= 0.0 {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
            self.last_refill = now;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub rate_per_s: f64,
    pub max_tokens: f64,
    pub tokens: f64,
    /// Estimated wait for one token, if the bucket is currently empty.
    pub estimated_wait: Option<Duration>,
}

/// Token-bucket rate limiter.
pub struct RateLimiter {
    state: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            state: Mutex::new(Bucket {
                tokens: config.max_tokens,
                max_tokens: config.max_tokens,
                rate: config.rate_per_s,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire `n` tokens, sleeping when the bucket is short. Returns the
    /// time spent waiting.
    pub async fn acquire(&self, n: f64) -> Duration {
        let wait = {
            let mut bucket = self.state.lock().await;
            if bucket.rate <= 0.0 {
                return Duration::ZERO;
            }
            bucket.refill(Instant::now());
            if bucket.tokens >= n {
                bucket.tokens -= n;
                return Duration::ZERO;
            }
            Duration::from_secs_f64((n - bucket.tokens) / bucket.rate)
        };

        // Sleep outside the lock; suspension points never hold it.
        tokio::time::sleep(wait).await;

        let mut bucket = self.state.lock().await;
        bucket.refill(Instant::now());
        bucket.tokens = (bucket.tokens - n).max(0.0);
        wait
    }

    /// Acquire without waiting; true when tokens were available.
    pub async fn try_acquire(&self, n: f64) -> bool {
        let mut bucket = self.state.lock().await;
        if bucket.rate <= 0.0 {
            return true;
        }
        bucket.refill(Instant::now());
        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Apply server-reported rate-limit headers, per the manifest's header
    /// name mapping. Unparseable values are ignored.
    pub async fn update_from_headers(
        &self,
        headers: &reqwest::header::HeaderMap,
        mapping: &RateLimitHeaders,
    ) {
        let get = |name: &Option<String>| -> Option<f64> {
            let name = name.as_deref()?;
            let raw = headers.get(name)?.to_str().ok()?.trim();
            raw.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
        };

        let remaining = get(&mapping.requests_remaining);
        let limit = get(&mapping.requests_limit);
        let reset = get(&mapping.requests_reset);

        if remaining.is_none() && (limit.is_none() || reset.is_none()) {
            return;
        }

        let mut bucket = self.state.lock().await;
        let now = Instant::now();

        if let (Some(limit), Some(reset)) = (limit, reset) {
            if reset > 0.0 && limit > 0.0 {
                bucket.rate = limit / reset;
                bucket.max_tokens = limit;
            }
        }

        if let Some(remaining) = remaining {
            // Snapshot, not a refill: the clock restarts from now so the
            // server count is not double-credited by the next refill.
            bucket.tokens = remaining;
            bucket.last_refill = now;
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut bucket = self.state.lock().await;
        bucket.refill(Instant::now());
        let estimated_wait = if bucket.rate > 0.0 && bucket.tokens < 1.0 {
            Some(Duration::from_secs_f64(
                (1.0 - bucket.tokens) / bucket.rate,
            ))
        } else {
            None
        };
        RateLimiterSnapshot {
            rate_per_s: bucket.rate,
            max_tokens: bucket.max_tokens,
            tokens: bucket.tokens,
            estimated_wait,
        }
    }

    pub async fn available_tokens(&self) -> f64 {
        self.snapshot().await.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_rps() {
        let cfg = RateLimiterConfig::from_rps(10.0).unwrap();
        assert_eq!(cfg.rate_per_s, 10.0);
        assert_eq!(cfg.max_tokens, 10.0);

        let low = RateLimiterConfig::from_rps(0.5).unwrap();
        assert_eq!(low.max_tokens, 1.0);

        assert!(RateLimiterConfig::from_rps(-1.0).is_none());
        assert!(RateLimiterConfig::from_rps(f64::NAN).is_none());
    }

    #[tokio::test]
    async fn burst_admitted_without_wait() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rps(100.0).unwrap());
        for _ in 0..100 {
            assert_eq!(limiter.acquire(1.0).await, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        for _ in 0..1000 {
            assert!(limiter.try_acquire(1.0).await);
        }
    }

    #[tokio::test]
    async fn empty_bucket_waits_and_refills() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::from_rps(100.0).unwrap().with_burst(2.0),
        );
        assert!(limiter.try_acquire(2.0).await);
        assert!(!limiter.try_acquire(1.0).await);

        // 100 tokens/s: one token is ~10ms away
        let wait = limiter.acquire(1.0).await;
        assert!(wait > Duration::ZERO);
        assert!(wait < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn admission_bound_over_window() {
        // rate 200/s, burst 5: over 100ms at most rate*W + burst ≈ 25 calls
        let limiter = RateLimiter::new(
            RateLimiterConfig::from_rps(200.0).unwrap().with_burst(5.0),
        );
        let start = Instant::now();
        let window = Duration::from_millis(100);
        let mut admitted = 0u32;
        while start.elapsed() < window {
            if limiter.try_acquire(1.0).await {
                admitted += 1;
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        let bound = (200.0 * start.elapsed().as_secs_f64()) + 5.0;
        assert!(
            (admitted as f64) <= bound + 1.0,
            "admitted {} exceeds bound {}",
            admitted,
            bound
        );
    }

    #[tokio::test]
    async fn headers_snapshot_remaining() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rps(10.0).unwrap());
        let mapping = RateLimitHeaders {
            requests_limit: Some("x-ratelimit-limit-requests".into()),
            requests_remaining: Some("x-ratelimit-remaining-requests".into()),
            requests_reset: Some("x-ratelimit-reset-requests".into()),
            retry_after: None,
        };

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-ratelimit-remaining-requests", "3".parse().unwrap());
        limiter.update_from_headers(&headers, &mapping).await;
        let snap = limiter.snapshot().await;
        assert!(snap.tokens <= 3.1, "tokens snapped to server value");

        // limit + reset recompute rate and capacity
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-ratelimit-limit-requests", "60".parse().unwrap());
        headers.insert("x-ratelimit-reset-requests", "30".parse().unwrap());
        limiter.update_from_headers(&headers, &mapping).await;
        let snap = limiter.snapshot().await;
        assert_eq!(snap.max_tokens, 60.0);
        assert!((snap.rate_per_s - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unparseable_headers_ignored() {
        let limiter = RateLimiter::new(RateLimiterConfig::from_rps(10.0).unwrap());
        let mapping = RateLimitHeaders {
            requests_limit: None,
            requests_remaining: Some("x-remaining".into()),
            requests_reset: None,
            retry_after: None,
        };
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-remaining", "soon".parse().unwrap());
        limiter.update_from_headers(&headers, &mapping).await;
        let snap = limiter.snapshot().await;
        assert_eq!(snap.tokens, 10.0);
    }
}
