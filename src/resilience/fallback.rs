//! Fallback chain: an ordered list of equivalent targets, tried in
//! descending weight upon fallbackable failure.
//!
//! The chain sits above the executor. A non-fallbackable error aborts the
//! chain immediately (it would fail on any target); everything else moves
//! on to the next enabled target.

use crate::error::Error;
use crate::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

type TargetOp<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

pub struct FallbackTarget<T> {
    pub name: String,
    pub weight: f64,
    pub enabled: bool,
    operation: TargetOp<T>,
}

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Attempts per target before moving on
    pub max_attempts_per_target: u32,
    /// Pause between targets
    pub delay_between_targets: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_target: 1,
            delay_between_targets: Duration::ZERO,
        }
    }
}

/// Outcome of a chain execution.
#[derive(Debug)]
pub struct FallbackResult<T> {
    pub success: bool,
    pub value: Option<T>,
    /// Name of the target that fulfilled the request
    pub target_used: Option<String>,
    /// Targets attempted, in order
    pub targets_tried: Vec<String>,
    /// Last error per failed target
    pub errors: HashMap<String, Error>,
}

impl<T> FallbackResult<T> {
    /// Unwrap into a plain Result, surfacing the last error.
    pub fn into_result(mut self) -> Result<T> {
        if let Some(value) = self.value.take() {
            return Ok(value);
        }
        let last = self
            .targets_tried
            .iter()
            .rev()
            .find_map(|name| self.errors.remove(name));
        Err(last.unwrap_or_else(|| {
            crate::Error::validation("fallback chain has no enabled targets")
        }))
    }
}

pub struct FallbackChain<T> {
    config: FallbackConfig,
    targets: Vec<FallbackTarget<T>>,
}

impl<T> FallbackChain<T> {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            targets: Vec::new(),
        }
    }

    /// Add a target. Higher weight is tried first.
    pub fn add_target<F, Fut>(mut self, name: impl Into<String>, weight: f64, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.targets.push(FallbackTarget {
            name: name.into(),
            weight,
            enabled: true,
            operation: Box::new(move || {
                Box::pin(operation()) as BoxFuture<'static, Result<T>>
            }),
        });
        self
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        for target in &mut self.targets {
            if target.name == name {
                target.enabled = enabled;
                return true;
            }
        }
        false
    }

    /// Enabled target names in try order (descending weight, stable).
    pub fn target_order(&self) -> Vec<&str> {
        let mut order: Vec<&FallbackTarget<T>> =
            self.targets.iter().filter(|t| t.enabled).collect();
        order.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.iter().map(|t| t.name.as_str()).collect()
    }

    /// Run the chain until a target succeeds, a non-fallbackable error
    /// aborts it, or every target has been tried.
    pub async fn execute(&self) -> FallbackResult<T> {
        let mut order: Vec<&FallbackTarget<T>> =
            self.targets.iter().filter(|t| t.enabled).collect();
        order.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut targets_tried = Vec::new();
        let mut errors: HashMap<String, Error> = HashMap::new();

        let total = order.len();
        for (position, target) in order.into_iter().enumerate() {
            targets_tried.push(target.name.clone());

            for attempt in 0..self.config.max_attempts_per_target.max(1) {
                match (target.operation)().await {
                    Ok(value) => {
                        return FallbackResult {
                            success: true,
                            value: Some(value),
                            target_used: Some(target.name.clone()),
                            targets_tried,
                            errors,
                        };
                    }
                    Err(error) => {
                        let abort = !error.is_fallbackable();
                        tracing::debug!(
                            chain_target = target.name.as_str(),
                            attempt,
                            kind = error.kind.label(),
                            abort,
                            "fallback target failed"
                        );
                        errors.insert(target.name.clone(), error);

                        if abort {
                            return FallbackResult {
                                success: false,
                                value: None,
                                target_used: None,
                                targets_tried,
                                errors,
                            };
                        }
                    }
                }
            }

            if position + 1 < total && !self.config.delay_between_targets.is_zero() {
                tokio::time::sleep(self.config.delay_between_targets).await;
            }
        }

        FallbackResult {
            success: false,
            value: None,
            target_used: None,
            targets_tried,
            errors,
        }
    }
}
