//! Deterministic cache keys for chat requests.

use crate::manifest::ChatRequest;
use sha2::{Digest, Sha256};

/// Derive a stable cache key from the request's semantic content. Two
/// requests that would produce the same provider payload share a key;
/// streaming mode is excluded on purpose.
pub fn request_key(provider_id: &str, request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update([0]);
    hasher.update(request.model.as_bytes());
    hasher.update([0]);

    if let Ok(messages) = serde_json::to_vec(&request.messages) {
        hasher.update(&messages);
    }
    hasher.update([0]);

    // Scalar parameters in a fixed order
    let params = serde_json::json!({
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "top_p": request.top_p,
        "stop": request.stop,
        "tool_choice": request.tool_choice,
    });
    if let Ok(bytes) = serde_json::to_vec(&params) {
        hasher.update(&bytes);
    }

    if let Some(tools) = &request.tools {
        if let Ok(bytes) = serde_json::to_vec(tools) {
            hasher.update(&bytes);
        }
    }

    // Extras sorted by key so map order cannot change the hash
    let mut extras: Vec<_> = request.extra_params.iter().collect();
    extras.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in extras {
        hasher.update(k.as_bytes());
        if let Ok(bytes) = serde_json::to_vec(v) {
            hasher.update(&bytes);
        }
    }

    format!("chat:{}:{:x}", provider_id, hasher.finalize())
}
