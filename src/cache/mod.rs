//! Optional response-cache contract.
//!
//! The core never caches on its own; callers inject a backend and key
//! requests with [`key::request_key`], which is deterministic over
//! (model, messages, parameters).

pub mod key;

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>);
}
