//! Stateful tool-call argument accumulation, per frame.
//!
//! Providers split function-call arguments across stream frames. This
//! transform joins the fragments as frames pass through and annotates each
//! tool-call frame in place with the assembly state so far, under
//! `_assembled_tool_call`. Non-tool-call frames pass through untouched.
//!
//! Entries are keyed by the tool-call id when one has been seen; the
//! numeric `index` is only a tiebreaker for fragments that omit the id
//! (OpenAI continuation deltas carry index-only fragments).

use crate::pipeline::Transform;
use crate::{BoxStream, Result};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
struct Entry {
    id: Option<String>,
    name: Option<String>,
    arguments_buffer: String,
    index: u32,
}

#[derive(Debug, Default)]
struct AccumulatorState {
    // key: tool-call id, or "#<index>" until an id is observed
    entries: HashMap<String, Entry>,
    index_to_key: HashMap<u32, String>,
}

/// One extracted fragment, shape-normalized.
#[derive(Debug, Default)]
struct Fragment {
    index: Option<u32>,
    id: Option<String>,
    name: Option<String>,
    arguments: Option<String>,
}

/// Joins tool-call argument fragments.
///
/// The `Transform` impl allocates fresh state per stream, so a shared
/// pipeline never leaks assembly state across requests. The inherent
/// `annotate`/`reset` methods operate on this instance's own state, for
/// callers that drive one accumulator per request by hand.
pub struct ToolCallAccumulator {
    state: Arc<Mutex<AccumulatorState>>,
}

impl Default for ToolCallAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AccumulatorState::default())),
        }
    }

    /// Clear the entire assembly map.
    pub fn reset(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.entries.clear();
            st.index_to_key.clear();
        }
    }

    /// Feed one frame through this instance's state, annotating it in
    /// place when it carries tool-call fragments.
    pub fn annotate(&self, frame: &mut Value) {
        let fragments = Self::extract_fragments(frame);
        if fragments.is_empty() {
            return;
        }
        let mut st = match self.state.lock() {
            Ok(st) => st,
            Err(_) => return,
        };
        let mut annotation = None;
        for fragment in fragments {
            annotation = Some(Self::apply(&mut st, fragment));
        }
        drop(st);
        if let (Some(ann), Some(obj)) = (annotation, frame.as_object_mut()) {
            obj.insert("_assembled_tool_call".to_string(), ann);
        }
    }

    /// Extract tool-call fragments from a frame. Tries the OpenAI shape
    /// first, then the Anthropic content-block shapes, in that order.
    fn extract_fragments(frame: &Value) -> Vec<Fragment> {
        let mut fragments = Vec::new();

        // OpenAI: choices[*].delta.tool_calls[*]
        if let Some(choices) = frame.get("choices").and_then(|c| c.as_array()) {
            for choice in choices {
                let Some(tool_calls) = choice
                    .get("delta")
                    .and_then(|d| d.get("tool_calls"))
                    .and_then(|t| t.as_array())
                else {
                    continue;
                };
                for (pos, tc) in tool_calls.iter().enumerate() {
                    fragments.push(Fragment {
                        index: tc
                            .get("index")
                            .and_then(|v| v.as_u64())
                            .map(|v| v as u32)
                            .or(Some(pos as u32)),
                        id: tc.get("id").and_then(|v| v.as_str()).map(String::from),
                        name: tc
                            .get("function")
                            .and_then(|f| f.get("name"))
                            .and_then(|v| v.as_str())
                            .map(String::from),
                        arguments: tc
                            .get("function")
                            .and_then(|f| f.get("arguments"))
                            .and_then(|v| v.as_str())
                            .map(String::from),
                    });
                }
            }
        }
        if !fragments.is_empty() {
            return fragments;
        }

        // Anthropic: content_block_start with a tool_use block
        if frame.get("type").and_then(|v| v.as_str()) == Some("content_block_start") {
            if let Some(block) = frame.get("content_block") {
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    fragments.push(Fragment {
                        index: frame.get("index").and_then(|v| v.as_u64()).map(|v| v as u32),
                        id: block.get("id").and_then(|v| v.as_str()).map(String::from),
                        name: block.get("name").and_then(|v| v.as_str()).map(String::from),
                        arguments: None,
                    });
                }
            }
        }

        // Anthropic: content_block_delta carrying input_json_delta
        if frame.get("type").and_then(|v| v.as_str()) == Some("content_block_delta") {
            if let Some(delta) = frame.get("delta") {
                if delta.get("type").and_then(|v| v.as_str()) == Some("input_json_delta") {
                    fragments.push(Fragment {
                        index: frame.get("index").and_then(|v| v.as_u64()).map(|v| v as u32),
                        id: None,
                        name: None,
                        arguments: delta
                            .get("partial_json")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                    });
                }
            }
        }

        fragments
    }

    /// Apply one fragment to the state; returns the annotation for the frame.
    fn apply(st: &mut AccumulatorState, fragment: Fragment) -> Value {
        let index = fragment.index.unwrap_or(0);

        // Resolve the entry key: prefer the fragment id, fall back to
        // whichever key this index was bound to, else a fresh index key.
        let bound = st.index_to_key.get(&index).cloned();
        let key = match (&fragment.id, bound) {
            (Some(id), Some(existing)) if existing != *id => {
                // The id arrived after index-only fragments: migrate the
                // buffered entry onto the id key.
                let prior = st.entries.remove(&existing).unwrap_or_default();
                st.entries.insert(id.clone(), prior);
                id.clone()
            }
            (Some(id), _) => id.clone(),
            (None, Some(existing)) => existing,
            (None, None) => format!("#{}", index),
        };
        st.index_to_key.insert(index, key.clone());

        let entry = st.entries.entry(key).or_insert_with(|| Entry {
            index,
            ..Entry::default()
        });
        entry.index = index;
        if let Some(id) = fragment.id {
            entry.id = Some(id);
        }
        if let Some(name) = fragment.name {
            entry.name = Some(name);
        }
        if let Some(args) = fragment.arguments {
            entry.arguments_buffer.push_str(&args);
        }

        let is_complete = !entry.arguments_buffer.is_empty()
            && serde_json::from_str::<Value>(&entry.arguments_buffer).is_ok();

        json!({
            "index": entry.index,
            "id": entry.id,
            "name": entry.name,
            "arguments": entry.arguments_buffer,
            "is_complete": is_complete,
        })
    }
}

#[async_trait::async_trait]
impl Transform for ToolCallAccumulator {
    async fn transform(
        &self,
        input: BoxStream<'static, Value>,
    ) -> Result<BoxStream<'static, Value>> {
        // Fresh state per stream: assembly never crosses request boundaries.
        let state = Arc::new(Mutex::new(AccumulatorState::default()));

        let stream = input.map(move |result| {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => return Err(e),
            };

            let fragments = Self::extract_fragments(&frame);
            if fragments.is_empty() {
                return Ok(frame);
            }

            let mut frame = frame;
            let mut st = match state.lock() {
                Ok(st) => st,
                Err(_) => return Ok(frame),
            };
            let mut annotation = None;
            for fragment in fragments {
                annotation = Some(Self::apply(&mut st, fragment));
            }
            drop(st);

            if let (Some(ann), Some(obj)) = (annotation, frame.as_object_mut()) {
                obj.insert("_assembled_tool_call".to_string(), ann);
            }
            Ok(frame)
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn run(acc: &ToolCallAccumulator, frames: Vec<Value>) -> Vec<Value> {
        let input = futures::stream::iter(frames.into_iter().map(Ok));
        let out = acc.transform(Box::pin(input)).await.unwrap();
        out.map(|r| r.unwrap()).collect().await
    }

    #[test]
    fn extracts_openai_shape_first() {
        let frame = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"name": "f", "arguments": "{"}}
        ]}}]});
        let frags = ToolCallAccumulator::extract_fragments(&frame);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].id.as_deref(), Some("call_1"));
        assert_eq!(frags[0].arguments.as_deref(), Some("{"));
    }

    #[test]
    fn extracts_anthropic_shapes() {
        let start = json!({"type": "content_block_start", "index": 1,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search"}});
        let frags = ToolCallAccumulator::extract_fragments(&start);
        assert_eq!(frags[0].id.as_deref(), Some("toolu_1"));
        assert_eq!(frags[0].name.as_deref(), Some("search"));

        let delta = json!({"type": "content_block_delta", "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}});
        let frags = ToolCallAccumulator::extract_fragments(&delta);
        assert_eq!(frags[0].arguments.as_deref(), Some("{\"q\":"));
    }

    #[tokio::test]
    async fn joins_fragments_and_annotates() {
        let acc = ToolCallAccumulator::new();
        let frames = vec![
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "get_weather"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"city\":"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": " \"NYC\"}"}}
            ]}}]}),
        ];

        let out = run(&acc, frames).await;
        assert_eq!(out.len(), 3);

        let first = &out[0]["_assembled_tool_call"];
        assert_eq!(first["id"], "call_1");
        assert_eq!(first["name"], "get_weather");
        assert_eq!(first["is_complete"], false);

        let last = &out[2]["_assembled_tool_call"];
        assert_eq!(last["arguments"], "{\"city\": \"NYC\"}");
        assert_eq!(last["is_complete"], true);
    }

    #[tokio::test]
    async fn non_tool_frames_pass_untouched() {
        let acc = ToolCallAccumulator::new();
        let frame = json!({"choices": [{"delta": {"content": "plain text"}}]});
        let out = run(&acc, vec![frame.clone()]).await;
        assert_eq!(out[0], frame);
    }

    #[tokio::test]
    async fn id_arriving_late_migrates_index_entry() {
        let acc = ToolCallAccumulator::new();
        let frames = vec![
            // Anthropic-style delta before any id was seen for that index
            json!({"type": "content_block_delta", "index": 0,
                "delta": {"type": "input_json_delta", "partial_json": "{\"a\""}}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_real", "function": {"arguments": ": 1}"}}
            ]}}]}),
        ];
        let out = run(&acc, frames).await;
        let ann = &out[1]["_assembled_tool_call"];
        assert_eq!(ann["id"], "call_real");
        assert_eq!(ann["arguments"], "{\"a\": 1}");
        assert_eq!(ann["is_complete"], true);
    }

    #[test]
    fn reset_clears_state() {
        let acc = ToolCallAccumulator::new();
        let mut frame = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"arguments": "{\"x\": 1"}}
        ]}}]});
        acc.annotate(&mut frame);
        assert_eq!(frame["_assembled_tool_call"]["arguments"], "{\"x\": 1");

        acc.reset();
        let mut frame = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{}"}}
        ]}}]});
        acc.annotate(&mut frame);
        // After reset, the earlier buffer is gone
        assert_eq!(frame["_assembled_tool_call"]["arguments"], "{}");
    }

    #[tokio::test]
    async fn transform_state_is_per_stream() {
        let acc = ToolCallAccumulator::new();
        let fragment = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "function": {"arguments": "{\"x\": 1"}}
        ]}}]});
        let _ = run(&acc, vec![fragment]).await;

        // A second stream through the same (shared) transform starts clean.
        let out = run(
            &acc,
            vec![json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_2", "function": {"arguments": "{}"}}
            ]}}]})],
        )
        .await;
        assert_eq!(out[0]["_assembled_tool_call"]["arguments"], "{}");
    }
}
