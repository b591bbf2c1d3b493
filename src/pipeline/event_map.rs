//! Event mapping (JSON frames → unified [`StreamingEvent`]s).
//!
//! Three variants, chosen at pipeline build time:
//! - rule-driven, from the manifest's ordered `event_map` rules;
//! - the OpenAI-compatible default, driven by configured or default paths;
//! - the Anthropic event-stream mapper, dispatching on the preserved
//!   `event:` annotation.
//!
//! Mapping is best-effort per frame: a rule that matches but cannot build
//! its event emits nothing, and frames no rule matches are skipped. The
//! decoder upstream is already tolerant, so a silent skip here never loses
//! an otherwise-usable stream.

use crate::manifest::{EventMapRule, TerminationConfig, ToolUseMapping};
use crate::pipeline::Mapper;
use crate::types::events::StreamingEvent;
use crate::utils::json_path::JsonPath;
use crate::utils::Predicate;
use crate::{BoxStream, Result};
use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

const ASSEMBLED_KEY: &str = "_assembled_tool_call";
const EVENT_TYPE_KEY: &str = "_event_type";

#[derive(Clone)]
struct CompiledRule {
    matcher: Predicate,
    emit: String,
    fields: Vec<(String, JsonPath)>,
}

impl CompiledRule {
    fn extract(&self, frame: &Value) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for (name, path) in &self.fields {
            if let Some(v) = path.first(frame) {
                if !v.is_null() {
                    out.insert(name.clone(), v.clone());
                }
            }
        }
        out
    }
}

fn field_string(fields: &HashMap<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(|v| {
        if let Some(s) = v.as_str() {
            Some(s.to_string())
        } else {
            serde_json::to_string(v).ok()
        }
    })
}

fn field_u32(fields: &HashMap<String, Value>, name: &str) -> Option<u32> {
    fields.get(name).and_then(|v| v.as_u64()).map(|v| v as u32)
}

fn assembled(frame: &Value) -> Option<&Value> {
    frame.get(ASSEMBLED_KEY)
}

/// Manifest-rule-driven mapper. For each frame, the first rule whose match
/// predicate succeeds emits at most one event.
pub struct RuleBasedEventMapper {
    rules: Vec<CompiledRule>,
}

impl RuleBasedEventMapper {
    pub fn new(rules: &[EventMapRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let matcher = Predicate::parse(&rule.match_expr).map_err(|e| {
                crate::Error::validation(format!(
                    "event_map rule {:?}: {}",
                    rule.match_expr, e
                ))
            })?;
            let mut fields = Vec::new();
            if let Some(map) = &rule.fields {
                for (name, path) in map {
                    let compiled_path = JsonPath::parse(path).map_err(|e| {
                        crate::Error::validation(format!(
                            "event_map field {:?}: {}",
                            path, e
                        ))
                    })?;
                    fields.push((name.clone(), compiled_path));
                }
            }
            compiled.push(CompiledRule {
                matcher,
                emit: rule.emit.clone(),
                fields,
            });
        }
        Ok(Self { rules: compiled })
    }

    fn build_event(emit: &str, frame: &Value, fields: &HashMap<String, Value>) -> Option<StreamingEvent> {
        match emit {
            "ContentDelta" => {
                let content = field_string(fields, "content")?;
                if content.is_empty() {
                    return None;
                }
                Some(StreamingEvent::ContentDelta {
                    content,
                    sequence_id: fields.get("sequence_id").and_then(|v| v.as_u64()),
                })
            }
            "ThinkingDelta" => {
                let thinking = field_string(fields, "thinking")?;
                if thinking.is_empty() {
                    return None;
                }
                Some(StreamingEvent::ThinkingDelta { thinking })
            }
            "ToolCallStarted" => {
                let tool_call_id = field_string(fields, "tool_call_id")
                    .or_else(|| assembled(frame).and_then(|a| a.get("id")).and_then(|v| v.as_str()).map(String::from))?;
                let tool_name = field_string(fields, "tool_name")
                    .or_else(|| assembled(frame).and_then(|a| a.get("name")).and_then(|v| v.as_str()).map(String::from))
                    .unwrap_or_default();
                Some(StreamingEvent::ToolCallStarted {
                    tool_call_id,
                    tool_name,
                    index: field_u32(fields, "index"),
                })
            }
            "PartialToolCall" => {
                let ann = assembled(frame);
                let tool_call_id = field_string(fields, "tool_call_id")
                    .or_else(|| ann.and_then(|a| a.get("id")).and_then(|v| v.as_str()).map(String::from))?;
                let arguments = field_string(fields, "arguments").unwrap_or_default();
                Some(StreamingEvent::PartialToolCall {
                    tool_call_id,
                    arguments,
                    index: field_u32(fields, "index")
                        .or_else(|| ann.and_then(|a| a.get("index")).and_then(|v| v.as_u64()).map(|v| v as u32)),
                    is_complete: ann
                        .and_then(|a| a.get("is_complete"))
                        .and_then(|v| v.as_bool()),
                })
            }
            "ToolCallEnded" => {
                let tool_call_id = field_string(fields, "tool_call_id")
                    .or_else(|| assembled(frame).and_then(|a| a.get("id")).and_then(|v| v.as_str()).map(String::from))?;
                Some(StreamingEvent::ToolCallEnded {
                    tool_call_id,
                    index: field_u32(fields, "index"),
                })
            }
            "Metadata" => Some(StreamingEvent::Metadata {
                usage: fields.get("usage").cloned(),
                finish_reason: field_string(fields, "finish_reason"),
                stop_reason: field_string(fields, "stop_reason"),
            }),
            "FinalCandidate" => Some(StreamingEvent::FinalCandidate {
                candidate_index: field_u32(fields, "candidate_index").unwrap_or(0),
                finish_reason: field_string(fields, "finish_reason")
                    .unwrap_or_else(|| "stop".to_string()),
            }),
            "StreamEnd" => Some(StreamingEvent::StreamEnd {
                finish_reason: field_string(fields, "finish_reason"),
            }),
            "StreamError" => Some(StreamingEvent::StreamError {
                error: fields
                    .get("error")
                    .cloned()
                    .or_else(|| frame.get("error").cloned())
                    .unwrap_or_else(|| frame.clone()),
                event_id: field_string(fields, "event_id"),
            }),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl Mapper for RuleBasedEventMapper {
    async fn map(
        &self,
        input: BoxStream<'static, Value>,
    ) -> Result<BoxStream<'static, StreamingEvent>> {
        let rules = self.rules.clone();

        let mapped = stream::unfold((input, false), move |(mut input, mut ended)| {
            let rules = rules.clone();
            async move {
                if ended {
                    return None;
                }

                while let Some(item) = input.next().await {
                    match item {
                        Ok(frame) => {
                            for rule in &rules {
                                if !rule.matcher.matches(&frame) {
                                    continue;
                                }
                                let fields = rule.extract(&frame);
                                if let Some(ev) =
                                    RuleBasedEventMapper::build_event(&rule.emit, &frame, &fields)
                                {
                                    if ev.is_terminal() {
                                        ended = true;
                                    }
                                    return Some((Ok(ev), (input, ended)));
                                }
                                // Matched but unbuildable: best-effort, frame skipped
                                break;
                            }
                            continue;
                        }
                        Err(e) => return Some((Err(e), (input, ended))),
                    }
                }

                // EOF: close the stream exactly once
                ended = true;
                Some((Ok(StreamingEvent::stream_end()), (input, ended)))
            }
        });

        Ok(Box::pin(mapped))
    }
}

pub fn create_rule_mapper(rules: &[EventMapRule]) -> Result<Box<dyn Mapper>> {
    Ok(Box::new(RuleBasedEventMapper::new(rules)?))
}

/// OpenAI-compatible default mapper, driven by configured or default paths.
/// Tracks tool-call starts internally so `ToolCallStarted` is emitted
/// exactly once per index.
#[derive(Clone)]
pub struct PathEventMapper {
    content_path: JsonPath,
    tool_call_path: JsonPath,
    finish_reason_path: JsonPath,
    usage_path: JsonPath,
    tool_use: Option<CompiledToolUse>,
}

#[derive(Clone)]
struct CompiledToolUse {
    id_path: Option<JsonPath>,
    name_path: Option<JsonPath>,
    input_path: Option<JsonPath>,
}

#[derive(Default)]
struct PathMapperState {
    queue: VecDeque<StreamingEvent>,
    started: HashSet<u32>,
    index_to_id: HashMap<u32, String>,
    buffers: HashMap<u32, String>,
    ended: bool,
}

impl PathEventMapper {
    pub fn new(
        content_path: Option<String>,
        tool_call_path: Option<String>,
        usage_path: Option<String>,
        tool_use: Option<ToolUseMapping>,
    ) -> Self {
        let parse = |p: Option<String>, default: &str| {
            let raw = p.unwrap_or_else(|| default.to_string());
            JsonPath::parse(&raw)
                .unwrap_or_else(|_| JsonPath::parse(default).expect("default path parses"))
        };

        Self {
            content_path: parse(content_path, "$.choices[0].delta.content"),
            tool_call_path: parse(tool_call_path, "$.choices[0].delta.tool_calls"),
            finish_reason_path: parse(None, "$.choices[0].finish_reason"),
            usage_path: parse(usage_path, "$.usage"),
            tool_use: tool_use.map(|tu| CompiledToolUse {
                id_path: tu.id_path.as_deref().and_then(|p| JsonPath::parse(p).ok()),
                name_path: tu.name_path.as_deref().and_then(|p| JsonPath::parse(p).ok()),
                input_path: tu.input_path.as_deref().and_then(|p| JsonPath::parse(p).ok()),
            }),
        }
    }

    fn tool_call_parts(
        tc: &Value,
        tool_use: Option<&CompiledToolUse>,
    ) -> (Option<String>, Option<String>, Option<String>) {
        // Manifest tooling mapping wins; OpenAI wire shape is the fallback.
        let mut id = None;
        let mut name = None;
        let mut args = None;

        if let Some(tu) = tool_use {
            id = tu.id_path.as_ref().and_then(|p| p.first_string(tc));
            name = tu.name_path.as_ref().and_then(|p| p.first_string(tc));
            args = tu.input_path.as_ref().and_then(|p| p.first_string(tc));
        }

        if id.is_none() {
            id = tc.get("id").and_then(|v| v.as_str()).map(String::from);
        }
        if name.is_none() {
            name = tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        if args.is_none() {
            args = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
                .map(String::from);
        }

        (id, name, args)
    }

    fn process_frame(&self, frame: &Value, st: &mut PathMapperState) {
        // Provider-signalled error channel
        if let Some(error) = frame.get("error") {
            st.queue.push_back(StreamingEvent::StreamError {
                error: error.clone(),
                event_id: frame.get("id").and_then(|v| v.as_str()).map(String::from),
            });
            st.ended = true;
            return;
        }

        if let Some(content) = self.content_path.first_string(frame) {
            if !content.is_empty() {
                st.queue.push_back(StreamingEvent::ContentDelta {
                    content,
                    sequence_id: None,
                });
            }
        }

        if let Some(tool_calls) = self.tool_call_path.first(frame).and_then(|v| v.as_array()) {
            let annotation = assembled(frame);
            for (pos, tc) in tool_calls.iter().enumerate() {
                let index = tc
                    .get("index")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u32)
                    .unwrap_or(pos as u32);

                let (mut id, name, args) =
                    Self::tool_call_parts(tc, self.tool_use.as_ref());

                if let Some(real_id) = &id {
                    st.index_to_id.insert(index, real_id.clone());
                } else {
                    id = st.index_to_id.get(&index).cloned();
                }

                if let (Some(id), Some(name)) = (id.clone(), name.clone()) {
                    if !st.started.contains(&index) {
                        st.started.insert(index);
                        st.queue.push_back(StreamingEvent::ToolCallStarted {
                            tool_call_id: id,
                            tool_name: name,
                            index: Some(index),
                        });
                    }
                }

                if let (Some(id), Some(arguments)) = (id, args) {
                    // Prefer the accumulator's verdict when it ran; fall
                    // back to our own buffer.
                    let is_complete = annotation
                        .and_then(|a| a.get("is_complete"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or_else(|| {
                            let buffer = st.buffers.entry(index).or_default();
                            buffer.push_str(&arguments);
                            serde_json::from_str::<Value>(buffer).is_ok()
                        });

                    st.queue.push_back(StreamingEvent::PartialToolCall {
                        tool_call_id: id,
                        arguments,
                        index: Some(index),
                        is_complete: Some(is_complete),
                    });
                }
            }
        }

        if let Some(reason) = self.finish_reason_path.first_string(frame) {
            st.queue.push_back(StreamingEvent::Metadata {
                usage: None,
                finish_reason: Some(reason),
                stop_reason: None,
            });
        }

        if let Some(usage) = self.usage_path.first(frame) {
            if !usage.is_null() {
                st.queue.push_back(StreamingEvent::Metadata {
                    usage: Some(usage.clone()),
                    finish_reason: None,
                    stop_reason: None,
                });
            }
        }
    }
}

#[async_trait::async_trait]
impl Mapper for PathEventMapper {
    async fn map(
        &self,
        input: BoxStream<'static, Value>,
    ) -> Result<BoxStream<'static, StreamingEvent>> {
        let mapper = self.clone();

        let stream = stream::unfold(
            (input, PathMapperState::default(), false),
            move |(mut input, mut st, mut closed)| {
                let mapper = mapper.clone();
                async move {
                    loop {
                        if let Some(ev) = st.queue.pop_front() {
                            return Some((Ok(ev), (input, st, closed)));
                        }
                        if closed || st.ended {
                            return None;
                        }

                        match input.next().await {
                            Some(Ok(frame)) => {
                                mapper.process_frame(&frame, &mut st);
                                continue;
                            }
                            Some(Err(e)) => return Some((Err(e), (input, st, closed))),
                            None => {
                                closed = true;
                                return Some((
                                    Ok(StreamingEvent::stream_end()),
                                    (input, st, closed),
                                ));
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

/// Mapper for Anthropic event streams. Dispatches on the `event:`
/// annotation preserved by the decoder (falling back to the frame's own
/// `type` field) to handle `message_start`, `content_block_start`,
/// `content_block_delta`, `content_block_stop`, `message_delta` and
/// `message_stop`.
#[derive(Clone)]
pub struct AnthropicEventMapper {
    termination: Option<TerminationConfig>,
}

#[derive(Default)]
struct AnthropicState {
    queue: VecDeque<StreamingEvent>,
    // index → (tool_call_id, arguments buffer); text blocks are not tracked
    tool_blocks: HashMap<u32, (String, String)>,
    ended: bool,
}

impl AnthropicEventMapper {
    pub fn new(termination: Option<TerminationConfig>) -> Self {
        Self { termination }
    }

    fn map_reason(&self, raw: &str) -> String {
        self.termination
            .as_ref()
            .and_then(|t| t.mapping.as_ref())
            .and_then(|m| m.get(raw))
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }

    fn frame_event_type(frame: &Value) -> Option<&str> {
        frame
            .get(EVENT_TYPE_KEY)
            .and_then(|v| v.as_str())
            .or_else(|| frame.get("type").and_then(|v| v.as_str()))
    }

    fn frame_index(frame: &Value) -> u32 {
        frame.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32
    }

    fn process_frame(&self, frame: &Value, st: &mut AnthropicState) {
        let event_type = match Self::frame_event_type(frame) {
            Some(t) => t,
            None => return,
        };

        match event_type {
            "error" => {
                st.queue.push_back(StreamingEvent::StreamError {
                    error: frame.get("error").cloned().unwrap_or_else(|| frame.clone()),
                    event_id: None,
                });
                st.ended = true;
            }

            "content_block_start" => {
                let index = Self::frame_index(frame);
                let Some(block) = frame.get("content_block") else {
                    return;
                };
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let id = block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    st.tool_blocks.insert(index, (id.clone(), String::new()));
                    st.queue.push_back(StreamingEvent::ToolCallStarted {
                        tool_call_id: id,
                        tool_name: name,
                        index: Some(index),
                    });
                }
            }

            "content_block_delta" => {
                let index = Self::frame_index(frame);
                let Some(delta) = frame.get("delta") else {
                    return;
                };
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                st.queue.push_back(StreamingEvent::content_delta(text));
                            }
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(thinking) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if !thinking.is_empty() {
                                st.queue.push_back(StreamingEvent::ThinkingDelta {
                                    thinking: thinking.to_string(),
                                });
                            }
                        }
                    }
                    Some("input_json_delta") => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        if let Some((id, buffer)) = st.tool_blocks.get_mut(&index) {
                            buffer.push_str(partial);
                            let is_complete =
                                serde_json::from_str::<Value>(buffer).is_ok();
                            st.queue.push_back(StreamingEvent::PartialToolCall {
                                tool_call_id: id.clone(),
                                arguments: partial.to_string(),
                                index: Some(index),
                                is_complete: Some(is_complete),
                            });
                        }
                    }
                    _ => {}
                }
            }

            "content_block_stop" => {
                let index = Self::frame_index(frame);
                if let Some((id, _)) = st.tool_blocks.get(&index) {
                    st.queue.push_back(StreamingEvent::ToolCallEnded {
                        tool_call_id: id.clone(),
                        index: Some(index),
                    });
                }
            }

            "message_delta" => {
                let stop_reason = frame
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                    .map(|r| self.map_reason(r));
                let usage = frame.get("usage").filter(|u| !u.is_null()).cloned();
                if stop_reason.is_some() || usage.is_some() {
                    st.queue.push_back(StreamingEvent::Metadata {
                        usage,
                        finish_reason: stop_reason.clone(),
                        stop_reason,
                    });
                }
            }

            "message_stop" => {
                st.queue.push_back(StreamingEvent::stream_end());
                st.ended = true;
            }

            // message_start and pings carry nothing the unified model needs
            _ => {}
        }
    }
}

#[async_trait::async_trait]
impl Mapper for AnthropicEventMapper {
    async fn map(
        &self,
        input: BoxStream<'static, Value>,
    ) -> Result<BoxStream<'static, StreamingEvent>> {
        let mapper = self.clone();

        let stream = stream::unfold(
            (input, AnthropicState::default(), false),
            move |(mut input, mut st, mut closed)| {
                let mapper = mapper.clone();
                async move {
                    loop {
                        if let Some(ev) = st.queue.pop_front() {
                            return Some((Ok(ev), (input, st, closed)));
                        }
                        if closed || st.ended {
                            return None;
                        }

                        match input.next().await {
                            Some(Ok(frame)) => {
                                mapper.process_frame(&frame, &mut st);
                                continue;
                            }
                            Some(Err(e)) => return Some((Err(e), (input, st, closed))),
                            None => {
                                // Provider closed without message_stop
                                closed = true;
                                return Some((
                                    Ok(StreamingEvent::stream_end()),
                                    (input, st, closed),
                                ));
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
