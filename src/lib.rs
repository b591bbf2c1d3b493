//! # anyllm
//!
//! Provider-agnostic client for LLM chat completion services.
//!
//! A single call site issues a chat request and receives either a complete
//! response or an incremental event stream. Wire-level differences between
//! providers (OpenAI-style, Anthropic-style, Gemini-style) are described by
//! declarative provider manifests; dispatch runs through a resilience layer
//! (backpressure, rate limiting, circuit breaking, retry, fallback) and
//! streaming responses are decoded into a uniform event model.

pub mod cache;
pub mod client;
pub mod manifest;
pub mod pipeline;
pub mod resilience;
pub mod tokens;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use client::CallStats;
pub use client::CancelHandle;
pub use client::{ChatResponse, LlmClient, LlmClientBuilder};
pub use manifest::{ManifestLoader, ProviderManifest};
pub use resilience::{ResilientConfig, ResilientExecutor};
pub use types::{
    events::StreamingEvent,
    message::{Message, MessageRole},
    tool::ToolCall,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, ErrorKind};
