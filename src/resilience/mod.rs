//! Resilience layer: backpressure, token-bucket rate limiting, circuit
//! breaking, retry with backoff, and the fallback chain.
//!
//! The [`ResilientExecutor`] composes the first four in a fixed order:
//! backpressure → rate limit → circuit breaker → retry. Any mechanism may
//! be absent (identity). The fallback chain sits *above* the executor and
//! is not a stage: each fallback target usually wraps its own executor.

pub mod backpressure;
pub mod circuit_breaker;
pub mod executor;
pub mod fallback;
pub mod rate_limiter;
pub mod retry;

pub use backpressure::{Backpressure, BackpressureConfig, InflightPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use executor::{ExecutionStats, ResilientConfig, ResilientExecutor, SignalsSnapshot};
pub use fallback::{FallbackChain, FallbackConfig, FallbackResult};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{JitterStrategy, RetryConfig, RetryOutcome, RetryPolicy};
