//! Shared data model: messages, unified streaming events, tool calls.

pub mod events;
pub mod message;
pub mod tool;

pub use events::StreamingEvent;
pub use message::{ContentBlock, Message, MessageContent, MessageRole};
pub use tool::{FunctionDefinition, ToolCall, ToolDefinition};
