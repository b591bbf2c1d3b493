//! Unified streaming events.
//!
//! Every provider stream is reduced to this closed, nine-variant set. Events
//! are append-only per request and their order is meaningful: it mirrors
//! byte-arrival order on the wire.

use serde::{Deserialize, Serialize};

/// Unified streaming event enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StreamingEvent {
    /// Partial text content
    #[serde(rename = "ContentDelta")]
    ContentDelta {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sequence_id: Option<u64>,
    },

    /// Partial reasoning text
    #[serde(rename = "ThinkingDelta")]
    ThinkingDelta { thinking: String },

    /// A tool call was opened by the model
    #[serde(rename = "ToolCallStarted")]
    ToolCallStarted {
        tool_call_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
    },

    /// An arguments fragment for an open tool call
    #[serde(rename = "PartialToolCall")]
    PartialToolCall {
        tool_call_id: String,
        /// Partial JSON string
        arguments: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        /// True iff everything accumulated so far parses as JSON
        #[serde(skip_serializing_if = "Option::is_none")]
        is_complete: Option<bool>,
    },

    /// A tool call was closed by the provider
    #[serde(rename = "ToolCallEnded")]
    ToolCallEnded {
        tool_call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
    },

    /// Usage and finish/stop reason metadata
    #[serde(rename = "Metadata")]
    Metadata {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },

    /// Per-candidate completion (multi-candidate responses)
    #[serde(rename = "FinalCandidate")]
    FinalCandidate {
        candidate_index: u32,
        finish_reason: String,
    },

    /// End of stream
    #[serde(rename = "StreamEnd")]
    StreamEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },

    /// Provider-signalled error frame; terminates the stream gracefully
    #[serde(rename = "StreamError")]
    StreamError {
        error: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
}

impl StreamingEvent {
    pub fn content_delta(content: impl Into<String>) -> Self {
        StreamingEvent::ContentDelta {
            content: content.into(),
            sequence_id: None,
        }
    }

    pub fn stream_end() -> Self {
        StreamingEvent::StreamEnd {
            finish_reason: None,
        }
    }

    /// The text payload if this is a content delta.
    pub fn as_content_delta(&self) -> Option<&str> {
        match self {
            StreamingEvent::ContentDelta { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamingEvent::StreamEnd { .. } | StreamingEvent::StreamError { .. }
        )
    }
}
