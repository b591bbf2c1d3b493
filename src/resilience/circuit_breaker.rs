//! Three-state circuit breaker.
//!
//! Closed → Open when `failure_count` reaches the threshold; Open →
//! HalfOpen after the cooldown, checked lazily on the next call; HalfOpen
//! → Closed after `success_threshold` probe successes, or straight back
//! to Open on any probe failure. Probes in HalfOpen are gated by a
//! bounded semaphore. The state mutex guards decisions and outcome
//! recording only; the operation itself runs outside the lock.

use crate::error::Error;
use crate::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive-failure budget before the circuit opens
    pub failure_threshold: u32,
    /// Probe successes needed in HalfOpen to close
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub cooldown: Duration,
    /// Concurrent probes allowed in HalfOpen
    pub half_open_max_concurrent: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
            half_open_max_concurrent: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    /// Remaining open time, when currently open
    pub time_until_retry: Option<Duration>,
}

/// Admission token: holds the half-open probe slot while the gated call
/// is in flight.
pub struct Admission {
    _probe: Option<tokio::sync::OwnedSemaphorePermit>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    half_open_gate: Arc<Semaphore>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let probes = config.half_open_max_concurrent.max(1);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
            half_open_gate: Arc::new(Semaphore::new(probes)),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock");
        Self::check_transition(&self.config, &mut inner, Instant::now());
        inner.state
    }

    /// Gate a call: Ok to proceed, or the CircuitOpen error. Also reports
    /// whether the call is a half-open probe (which must go through the
    /// probe gate).
    fn check_admit(&self) -> Result<bool> {
        let mut inner = self.inner.lock().expect("breaker lock");
        let now = Instant::now();
        Self::check_transition(&self.config, &mut inner, now);

        match inner.state {
            CircuitState::Open => {
                let remaining = inner
                    .opened_at
                    .map(|at| self.config.cooldown.saturating_sub(now.duration_since(at)))
                    .unwrap_or(self.config.cooldown);
                Err(Error::circuit_open(remaining))
            }
            CircuitState::HalfOpen => Ok(true),
            CircuitState::Closed => Ok(false),
        }
    }

    /// Admit one call. Fails fast with `CircuitOpen` when the circuit is
    /// open; in HalfOpen, waits on the bounded probe gate. The returned
    /// guard holds the probe slot (if any) until dropped; the caller
    /// reports the outcome with [`on_success`](Self::on_success) /
    /// [`on_failure`](Self::on_failure) — the operation itself never runs
    /// under the state lock.
    pub async fn admit(&self) -> Result<Admission> {
        let half_open = self.check_admit()?;

        let probe = if half_open {
            Some(
                self.half_open_gate
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::circuit_open(self.config.cooldown))?,
            )
        } else {
            None
        };

        Ok(Admission { _probe: probe })
    }

    /// Execute an operation through the breaker: admission, the call, and
    /// outcome recording.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _admission = self.admit().await?;

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    Self::transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                // Soft reset: successes walk the failure count back down
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::HalfOpen => {
                Self::transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    Self::transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn check_transition(config: &CircuitBreakerConfig, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open {
            if let Some(at) = inner.opened_at {
                if now.duration_since(at) >= config.cooldown {
                    Self::transition(inner, CircuitState::HalfOpen);
                }
            }
        }
    }

    fn transition(inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.opened_at = None;
            }
        }
    }

    pub fn time_until_retry(&self) -> Option<Duration> {
        let inner = self.inner.lock().expect("breaker lock");
        if inner.state != CircuitState::Open {
            return None;
        }
        inner
            .opened_at
            .map(|at| self.config.cooldown.saturating_sub(at.elapsed()))
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock().expect("breaker lock");
        Self::check_transition(&self.config, &mut inner, Instant::now());
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            time_until_retry: match inner.state {
                CircuitState::Open => inner
                    .opened_at
                    .map(|at| self.config.cooldown.saturating_sub(at.elapsed())),
                _ => None,
            },
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        Self::transition(&mut inner, CircuitState::Closed);
        // transition() is a no-op when already closed; force the counters
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
    }
}
