//! Concurrency backpressure: a semaphore bounding in-flight operations.

use crate::error::{Error, ErrorContext, ErrorKind};
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Maximum concurrent in-flight operations. Zero or negative means
    /// unlimited.
    pub max_concurrent: i32,
    /// How long `acquire` may wait for a permit. None waits indefinitely.
    pub queue_timeout: Option<Duration>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl BackpressureConfig {
    pub fn unlimited() -> Self {
        Self {
            max_concurrent: 0,
            queue_timeout: None,
        }
    }
}

/// Scoped permit; releasing on all exit paths is what Drop is for.
#[derive(Debug)]
pub struct InflightPermit {
    _permit: Option<OwnedSemaphorePermit>,
    current: Arc<AtomicUsize>,
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded-concurrency gate with in-flight accounting.
pub struct Backpressure {
    config: BackpressureConfig,
    semaphore: Option<Arc<Semaphore>>,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Backpressure {
    pub fn new(config: BackpressureConfig) -> Self {
        let semaphore = if config.max_concurrent > 0 {
            Some(Arc::new(Semaphore::new(config.max_concurrent as usize)))
        } else {
            None
        };
        Self {
            config,
            semaphore,
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a permit, waiting up to `queue_timeout`.
    pub async fn acquire(&self) -> Result<InflightPermit> {
        let permit = match &self.semaphore {
            None => None,
            Some(sem) => {
                let fut = sem.clone().acquire_owned();
                let acquired = match self.config.queue_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                        Error::new(
                            ErrorKind::Overloaded,
                            format!(
                                "backpressure queue timeout after {:?} ({} in flight)",
                                timeout,
                                self.current_inflight()
                            ),
                        )
                        .with_context(ErrorContext::new().with_details("local queue, not provider"))
                    })?,
                    None => fut.await,
                };
                Some(acquired.map_err(|_| {
                    Error::new(ErrorKind::Overloaded, "backpressure semaphore closed")
                })?)
            }
        };

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(InflightPermit {
            _permit: permit,
            current: Arc::clone(&self.current),
        })
    }

    pub fn current_inflight(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak_inflight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.semaphore
            .as_ref()
            .map(|_| self.config.max_concurrent as usize)
    }

    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}
