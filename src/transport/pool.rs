//! Optional connection pooling contract.
//!
//! The transport builds its own `reqwest::Client` by default; callers that
//! manage many providers can inject a pool so clients (and their
//! connection pools) are shared per provider+endpoint.

use std::collections::HashMap;
use std::sync::Mutex;

pub trait ClientPool: Send + Sync {
    /// Get (or create) the HTTP client for a provider endpoint.
    fn get_client(&self, provider_id: &str, base_url: &str) -> reqwest::Client;
}

/// Default pool: one lazily-built client per (provider, base_url).
#[derive(Default)]
pub struct SharedClientPool {
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl SharedClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClientPool for SharedClientPool {
    fn get_client(&self, provider_id: &str, base_url: &str) -> reqwest::Client {
        let key = format!("{}@{}", provider_id, base_url);
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(_) => return reqwest::Client::new(),
        };
        clients
            .entry(key)
            .or_insert_with(reqwest::Client::new)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_client_per_provider_endpoint() {
        let pool = SharedClientPool::new();
        let _a = pool.get_client("openai", "https://api.openai.com/v1");
        let _b = pool.get_client("openai", "https://api.openai.com/v1");
        let _c = pool.get_client("anthropic", "https://api.anthropic.com");
        assert_eq!(pool.len(), 2);
    }
}
