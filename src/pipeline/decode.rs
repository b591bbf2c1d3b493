//! Streaming decoders (bytes → JSON frames).
//!
//! Decoders handle *formats*, never provider semantics. Each maintains an
//! incremental buffer across byte chunks and only emits a frame when its
//! terminator has been observed, so any chunking of the same bytes yields
//! the same frame sequence.

use crate::pipeline::Decoder;
use crate::manifest::DecoderConfig;
use crate::{BoxStream, Result};
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::debug;

/// Server-Sent-Events decoder.
///
/// - frames split on `delimiter` (default `\n\n`)
/// - `:` comment lines ignored
/// - each `data:` payload is one JSON frame
/// - `done_signal` (default `[DONE]`) on a data line terminates the stream
/// - malformed JSON frames are dropped (debug log), the stream continues
/// - invalid UTF-8 falls back to replacement characters
///
/// With `preserve_event_type`, the frame's `event:` annotation is kept on
/// the parsed object under `_event_type` so a downstream mapper can
/// dispatch on it (Anthropic event streams).
pub struct SseDecoder {
    delimiter: String,
    prefix: String,
    done_signal: String,
    preserve_event_type: bool,
}

impl SseDecoder {
    pub fn new(
        delimiter: Option<String>,
        prefix: Option<String>,
        done_signal: Option<String>,
        preserve_event_type: bool,
    ) -> Self {
        Self {
            delimiter: delimiter.unwrap_or_else(|| "\n\n".to_string()),
            prefix: prefix.unwrap_or_else(|| "data: ".to_string()),
            done_signal: done_signal.unwrap_or_else(|| "[DONE]".to_string()),
            preserve_event_type,
        }
    }

    pub fn openai_default() -> Self {
        Self::new(None, None, None, false)
    }

    pub fn from_config(cfg: &DecoderConfig, preserve_event_type: bool) -> Self {
        Self::new(
            cfg.delimiter.clone(),
            cfg.prefix.clone(),
            cfg.done_signal.clone(),
            preserve_event_type,
        )
    }

    /// Parse one delimiter-separated block into zero or more frames.
    /// Returns (frames, saw_done).
    fn parse_block(
        block: &str,
        prefix: &str,
        done_signal: &str,
        preserve_event_type: bool,
    ) -> (Vec<Value>, bool) {
        let mut frames = Vec::new();
        let mut event_type: Option<String> = None;

        for line in block.split('\n') {
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                event_type = Some(rest.trim().to_string());
                continue;
            }

            let payload = if let Some(rest) = line.strip_prefix(prefix) {
                rest
            } else if let Some(rest) = line.strip_prefix("data:") {
                rest.trim_start()
            } else {
                continue;
            };

            if payload == done_signal {
                return (frames, true);
            }
            if payload.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(payload) {
                Ok(mut frame) => {
                    if preserve_event_type {
                        if let (Some(ev), Some(obj)) = (&event_type, frame.as_object_mut()) {
                            obj.entry("_event_type")
                                .or_insert_with(|| Value::String(ev.clone()));
                        }
                    }
                    frames.push(frame);
                }
                Err(e) => {
                    debug!(error = %e, payload_len = payload.len(), "dropping malformed SSE frame");
                }
            }
        }

        (frames, false)
    }
}

struct SseState {
    input: BoxStream<'static, Bytes>,
    buf: String,
    pending: VecDeque<Value>,
    done: bool,
}

#[async_trait::async_trait]
impl Decoder for SseDecoder {
    async fn decode_stream(
        &self,
        input: BoxStream<'static, Bytes>,
    ) -> Result<BoxStream<'static, Value>> {
        let delimiter = self.delimiter.clone();
        let prefix = self.prefix.clone();
        let done_signal = self.done_signal.clone();
        let preserve = self.preserve_event_type;

        let state = SseState {
            input,
            buf: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let stream = stream::unfold(state, move |mut st| {
            let delimiter = delimiter.clone();
            let prefix = prefix.clone();
            let done_signal = done_signal.clone();
            async move {
                loop {
                    if let Some(frame) = st.pending.pop_front() {
                        return Some((Ok(frame), st));
                    }
                    if st.done {
                        return None;
                    }

                    // Drain complete blocks from the buffer
                    if let Some(idx) = st.buf.find(&delimiter) {
                        let block = st.buf[..idx].to_string();
                        st.buf.drain(..idx + delimiter.len());
                        let (frames, saw_done) =
                            SseDecoder::parse_block(&block, &prefix, &done_signal, preserve);
                        st.pending.extend(frames);
                        if saw_done {
                            st.done = true;
                        }
                        continue;
                    }

                    match st.input.next().await {
                        Some(Ok(bytes)) => {
                            st.buf.push_str(&String::from_utf8_lossy(&bytes));
                        }
                        Some(Err(e)) => return Some((Err(e), st)),
                        None => {
                            // EOF: the remaining buffer is the final block
                            st.done = true;
                            if !st.buf.trim().is_empty() {
                                let block = std::mem::take(&mut st.buf);
                                let (frames, _) = SseDecoder::parse_block(
                                    &block,
                                    &prefix,
                                    &done_signal,
                                    preserve,
                                );
                                st.pending.extend(frames);
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// JSON-lines / NDJSON decoder: every non-empty line is one JSON frame;
/// malformed lines are dropped.
pub struct JsonLinesDecoder;

#[async_trait::async_trait]
impl Decoder for JsonLinesDecoder {
    async fn decode_stream(
        &self,
        input: BoxStream<'static, Bytes>,
    ) -> Result<BoxStream<'static, Value>> {
        let stream = stream::unfold(
            (input, String::new(), false),
            move |(mut input, mut buf, mut eof)| async move {
                loop {
                    if let Some(idx) = buf.find('\n') {
                        let line = buf[..idx].trim().to_string();
                        buf.drain(..idx + 1);
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(v) => return Some((Ok(v), (input, buf, eof))),
                            Err(e) => {
                                debug!(error = %e, "dropping malformed NDJSON line");
                                continue;
                            }
                        }
                    }

                    if eof {
                        return None;
                    }

                    match input.next().await {
                        Some(Ok(bytes)) => {
                            buf.push_str(&String::from_utf8_lossy(&bytes));
                        }
                        Some(Err(e)) => return Some((Err(e), (input, buf, eof))),
                        None => {
                            eof = true;
                            let line = buf.trim().to_string();
                            buf.clear();
                            if line.is_empty() {
                                return None;
                            }
                            match serde_json::from_str::<Value>(&line) {
                                Ok(v) => return Some((Ok(v), (input, buf, eof))),
                                Err(e) => {
                                    debug!(error = %e, "dropping malformed trailing NDJSON line");
                                    return None;
                                }
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

/// Build a decoder from a manifest's decoder configuration.
pub fn create_decoder(cfg: &DecoderConfig) -> Result<Box<dyn Decoder>> {
    match cfg.format.as_str() {
        "sse" => Ok(Box::new(SseDecoder::from_config(cfg, false))),
        // Same framing as SSE, but the event: annotation is preserved for
        // the downstream mapper to dispatch on.
        "anthropic_sse" => Ok(Box::new(SseDecoder::from_config(cfg, true))),
        "json_lines" | "ndjson" | "jsonl" => Ok(Box::new(JsonLinesDecoder)),
        other => Err(crate::Error::validation(format!(
            "unsupported decoder format {:?} (supported: sse, anthropic_sse, json_lines)",
            other
        ))),
    }
}
