//! Chat request builder and streaming dispatch.
//!
//! Streaming semantics: retry and fallback may happen only before any
//! event has been emitted to the caller. Once the first event is out, the
//! stream is committed — an automatic restart would duplicate output.

use crate::client::core::{split_model_ref, ChatResponse, LlmClient};
use crate::client::types::{cancel_pair, CallStats, CancelHandle, CancelToken, ControlledStream};
use crate::manifest::ChatRequest;
use crate::types::events::StreamingEvent;
use crate::types::message::Message;
use crate::utils::ToolCallAssembler;
use crate::Result;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Builder for one chat request.
pub struct ChatRequestBuilder<'a> {
    client: &'a LlmClient,
    messages: Vec<Message>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    top_p: Option<f64>,
    stop: Option<Vec<String>>,
    stream: bool,
    tools: Option<Vec<crate::types::tool::ToolDefinition>>,
    tool_choice: Option<serde_json::Value>,
    extra_params: HashMap<String, serde_json::Value>,
    timeout: Option<Duration>,
}

impl<'a> ChatRequestBuilder<'a> {
    pub(crate) fn new(client: &'a LlmClient) -> Self {
        Self {
            client,
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
            stream: false,
            tools: None,
            tool_choice: None,
            extra_params: HashMap::new(),
            timeout: None,
        }
    }

    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn system(self, text: impl Into<String>) -> Self {
        self.message(Message::system(text))
    }

    pub fn user(self, text: impl Into<String>) -> Self {
        self.message(Message::user(text))
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn stop(mut self, sequences: Vec<String>) -> Self {
        self.stop = Some(sequences);
        self
    }

    pub fn stream(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn tools(mut self, tools: Vec<crate::types::tool::ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn tool_choice(mut self, tool_choice: serde_json::Value) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    /// Pass-through extra parameter; merged into the payload unchecked
    /// beyond JSON-serializability.
    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra_params.insert(key.into(), value);
        self
    }

    /// Overall deadline for this call. Streaming requests model it as a
    /// scheduled cancellation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn into_request(self) -> (ChatRequest, &'a LlmClient, Option<Duration>) {
        let client = self.client;
        let timeout = self.timeout;
        let request = ChatRequest {
            operation: "chat".to_string(),
            model: client.model_id().to_string(),
            messages: self.messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            stop: self.stop,
            stream: self.stream,
            tools: self.tools,
            tool_choice: self.tool_choice,
            extra_params: self.extra_params,
        };
        (request, client, timeout)
    }

    /// Execute and return the complete response. A streaming builder is
    /// drained into a complete response through the assembler.
    pub async fn execute(self) -> Result<ChatResponse> {
        Ok(self.execute_with_stats().await?.0)
    }

    /// Execute, also returning per-call stats.
    pub async fn execute_with_stats(self) -> Result<(ChatResponse, CallStats)> {
        if !self.stream {
            let (request, client, timeout) = self.into_request();
            let fut = client.execute_chat(request);
            return match timeout {
                Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| {
                    crate::Error::new(crate::ErrorKind::TransportTimeout, "request deadline exceeded")
                })?,
                None => fut.await,
            };
        }

        // Streaming: collect the event stream into a complete response.
        let (mut stream, _handle, mut stats) = self.execute_stream_with_cancel_and_stats().await?;

        let mut response = ChatResponse::default();
        let mut assembler = ToolCallAssembler::new();

        while let Some(event) = stream.next().await {
            let event = event?;
            assembler.observe(&event);
            match event {
                StreamingEvent::ContentDelta { content, .. } => {
                    response.content.push_str(&content);
                }
                StreamingEvent::Metadata {
                    usage,
                    finish_reason,
                    ..
                } => {
                    if usage.is_some() {
                        response.usage = usage;
                    }
                    if finish_reason.is_some() {
                        response.finish_reason = finish_reason;
                    }
                }
                StreamingEvent::StreamEnd { finish_reason } => {
                    if finish_reason.is_some() {
                        response.finish_reason = finish_reason;
                    }
                    break;
                }
                StreamingEvent::StreamError { error, .. } => {
                    tracing::warn!(error = %error, "provider signalled a stream error");
                    break;
                }
                _ => {}
            }
        }

        response.tool_calls = assembler.finalize();
        stats.usage = response.usage.clone();
        Ok((response, stats))
    }

    /// Execute as a stream of unified events.
    pub async fn execute_stream(self) -> Result<ControlledStream> {
        let (stream, _handle, _stats) = self.execute_stream_with_cancel_and_stats().await?;
        Ok(stream)
    }

    /// Execute as a stream with a cancel handle.
    pub async fn execute_stream_with_cancel(self) -> Result<(ControlledStream, CancelHandle)> {
        let (stream, handle, _stats) = self.execute_stream_with_cancel_and_stats().await?;
        Ok((stream, handle))
    }

    /// Execute as a stream with a cancel handle and per-call stats.
    pub async fn execute_stream_with_cancel_and_stats(
        mut self,
    ) -> Result<(ControlledStream, CancelHandle, CallStats)> {
        self.stream = true;
        let (request, client, timeout) = self.into_request();

        // Resolve fallback candidates before dispatch.
        let mut candidates: Vec<LlmClient> = Vec::with_capacity(1 + client.fallback_models.len());
        candidates.push(client.clone());
        for model in &client.fallback_models {
            match client.with_model(model).await {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    tracing::warn!(model = model.as_str(), error = %e, "skipping unloadable fallback model");
                }
            }
        }

        let (handle, token) = match timeout {
            Some(t) => {
                let token = CancelToken::with_timeout(t);
                (CancelHandle::from_token(token.clone()), token)
            }
            None => cancel_pair(),
        };

        let started = Instant::now();
        let total = candidates.len();
        let mut last_err: Option<crate::Error> = None;

        for (position, candidate) in candidates.iter().enumerate() {
            let has_next = position + 1 < total;

            let mut request = request.clone();
            request.model = candidate.model_id().to_string();

            match candidate.execute_stream_once(&request).await {
                Ok((mut events, permit, mut stats)) => {
                    // Peek the first item: an error before anything was
                    // emitted may still fall back; after that the stream
                    // is committed.
                    match events.next().await {
                        None => {
                            let stream = ControlledStream::new(
                                Box::pin(futures::stream::empty()),
                                Some(token.clone()),
                                permit,
                            );
                            return Ok((stream, handle, stats));
                        }
                        Some(Ok(first)) => {
                            stats.first_event_latency = Some(started.elapsed());
                            let chained =
                                futures::stream::once(async move { Ok(first) }).chain(events);
                            let stream = ControlledStream::new(
                                Box::pin(chained),
                                Some(token.clone()),
                                permit,
                            );
                            return Ok((stream, handle, stats));
                        }
                        Some(Err(e)) => {
                            tracing::info!(
                                provider = candidate.manifest().id.as_str(),
                                error = %e,
                                "stream failed before first event"
                            );
                            let fallback = e.is_fallbackable() && has_next;
                            last_err = Some(e);
                            if !fallback {
                                return Err(last_err.expect("error just stored"));
                            }
                        }
                    }
                }
                Err(e) => {
                    let fallback = e.is_fallbackable() && has_next;
                    last_err = Some(e);
                    if !fallback {
                        return Err(last_err.expect("error just stored"));
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            crate::Error::validation("no candidate could serve the streaming request")
        }))
    }
}

/// Resolve a `"provider/model"` reference into its parts; used by callers
/// composing fallback lists by hand.
pub fn model_ref_parts(model: &str) -> (&str, &str) {
    split_model_ref(model)
}
