//! Cross-event tool-call finalization.
//!
//! Consumes the unified event stream's tool-call signals (started, partial,
//! ended) and reconstructs complete [`ToolCall`] records. Fragment order is
//! the insertion order of the first `ToolCallStarted` per id. Intentionally
//! tolerant: a buffer that does not parse as a JSON object is retained raw.

use crate::types::events::StreamingEvent;
use crate::types::tool::ToolCall;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct Fragment {
    name: String,
    arguments_buffer: String,
    index: Option<u32>,
    ended: bool,
}

/// Assembles tool calls from streaming fragments. One instance per
/// streaming request.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    fragments: HashMap<String, Fragment>,
    // Insertion order of first ToolCallStarted per id
    order: Vec<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one unified event. Non-tool-call events are ignored.
    pub fn observe(&mut self, event: &StreamingEvent) {
        match event {
            StreamingEvent::ToolCallStarted {
                tool_call_id,
                tool_name,
                index,
            } => self.on_started(tool_call_id, tool_name, *index),
            StreamingEvent::PartialToolCall {
                tool_call_id,
                arguments,
                index,
                ..
            } => self.on_partial(tool_call_id, arguments, *index),
            StreamingEvent::ToolCallEnded { tool_call_id, .. } => self.on_ended(tool_call_id),
            _ => {}
        }
    }

    pub fn on_started(&mut self, tool_call_id: &str, tool_name: &str, index: Option<u32>) {
        if let Some(existing) = self.fragments.get_mut(tool_call_id) {
            // Merge: keep the first non-empty name, latest index
            if existing.name.is_empty() && !tool_name.is_empty() {
                existing.name = tool_name.to_string();
            }
            if index.is_some() {
                existing.index = index;
            }
            return;
        }
        self.fragments.insert(
            tool_call_id.to_string(),
            Fragment {
                name: tool_name.to_string(),
                index,
                ..Fragment::default()
            },
        );
        self.order.push(tool_call_id.to_string());
    }

    pub fn on_partial(&mut self, tool_call_id: &str, fragment: &str, index: Option<u32>) {
        if !self.fragments.contains_key(tool_call_id) {
            self.on_started(tool_call_id, "", index);
        }
        if let Some(entry) = self.fragments.get_mut(tool_call_id) {
            entry.arguments_buffer.push_str(fragment);
        }
    }

    pub fn on_ended(&mut self, tool_call_id: &str) {
        if let Some(entry) = self.fragments.get_mut(tool_call_id) {
            entry.ended = true;
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Finalize every fragment into a [`ToolCall`].
    ///
    /// Idempotent: finalizing twice returns equal lists, because the buffers
    /// are not consumed.
    pub fn finalize(&self) -> Vec<ToolCall> {
        self.order
            .iter()
            .filter_map(|id| {
                let fragment = self.fragments.get(id)?;
                let raw = fragment.arguments_buffer.trim();

                let (arguments, arguments_raw) = if raw.is_empty() {
                    (serde_json::json!({}), None)
                } else {
                    match serde_json::from_str::<serde_json::Value>(raw) {
                        Ok(v) if v.is_object() => (v, None),
                        // Valid JSON but not an object, or invalid JSON:
                        // keep the raw buffer
                        _ => (serde_json::json!({}), Some(raw.to_string())),
                    }
                };

                Some(ToolCall {
                    id: id.clone(),
                    function_name: fragment.name.clone(),
                    arguments,
                    arguments_raw,
                })
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.fragments.clear();
        self.order.clear();
    }
}
