//! Unified client surface.
//!
//! The public surface stays small: a builder, the client, a chat request
//! builder, and the cancellable event stream it returns. Implementation
//! details live in the submodules.

pub mod builder;
pub mod chat;
pub mod core;
pub mod types;
mod validation;

pub use builder::LlmClientBuilder;
pub use chat::ChatRequestBuilder;
pub use core::{ChatResponse, LlmClient};
pub use types::{cancel_pair, CallStats, CancelHandle, CancelReason, CancelToken, ControlledStream};
