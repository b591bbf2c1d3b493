//! Client orchestration: manifest resolution, payload compilation,
//! executor-gated dispatch, and response parsing.

use crate::client::types::CallStats;
use crate::client::validation;
use crate::manifest::{ChatRequest, ManifestLoader, ProviderManifest};
use crate::pipeline::Pipeline;
use crate::resilience::{
    FallbackChain, FallbackConfig, InflightPermit, ResilientConfig, ResilientExecutor,
    SignalsSnapshot,
};
use crate::transport::HttpTransport;
use crate::types::events::StreamingEvent;
use crate::types::tool::ToolCall;
use crate::{BoxStream, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A complete (non-streaming) chat result.
#[derive(Debug, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Value>,
    /// Model the provider reports having used
    pub model: Option<String>,
    /// Termination reason, mapped through the manifest's vocabulary
    pub finish_reason: Option<String>,
}

/// Provider-agnostic chat client. One client owns its manifest reference,
/// transport, executor and pipeline; resilience state lives as long as
/// the client.
#[derive(Clone)]
pub struct LlmClient {
    pub(crate) manifest: Arc<ProviderManifest>,
    pub(crate) transport: Arc<HttpTransport>,
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) executor: Arc<ResilientExecutor>,
    pub(crate) loader: Arc<ManifestLoader>,
    pub(crate) model_id: String,
    pub(crate) fallback_models: Vec<String>,
    pub(crate) resilience: ResilientConfig,
    pub(crate) base_url_override: Option<String>,
    pub(crate) credential_override: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl LlmClient {
    /// Create a client for `"provider/model"` with default options.
    pub async fn new(model: &str) -> Result<Self> {
        crate::client::builder::LlmClientBuilder::new().build(model).await
    }

    pub fn manifest(&self) -> &ProviderManifest {
        &self.manifest
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn executor(&self) -> Arc<ResilientExecutor> {
        Arc::clone(&self.executor)
    }

    /// Facts-only snapshot of this client's resilience state.
    pub async fn signals(&self) -> SignalsSnapshot {
        self.executor.signals().await
    }

    /// Start building a chat request.
    pub fn chat(&self) -> crate::client::chat::ChatRequestBuilder<'_> {
        crate::client::chat::ChatRequestBuilder::new(self)
    }

    /// Build a sibling client for another `"provider/model"`, sharing the
    /// loader and construction options but with its own executor state.
    pub(crate) async fn with_model(&self, model: &str) -> Result<LlmClient> {
        let (provider, model_id) = split_model_ref(model);
        let manifest = self.loader.load(provider).await?;

        let transport = Arc::new(HttpTransport::with_options(
            Arc::clone(&manifest),
            model_id,
            self.base_url_override.as_deref(),
            self.credential_override.clone(),
            self.timeout,
            None,
        )?);
        let pipeline = Arc::new(Pipeline::from_manifest(&manifest)?);
        let executor = Arc::new(ResilientExecutor::named(
            format!("{}/{}", provider, model_id),
            self.resilience.clone(),
        ));

        Ok(LlmClient {
            manifest,
            transport,
            pipeline,
            executor,
            loader: Arc::clone(&self.loader),
            model_id: model_id.to_string(),
            fallback_models: Vec::new(),
            resilience: self.resilience.clone(),
            base_url_override: self.base_url_override.clone(),
            credential_override: self.credential_override.clone(),
            timeout: self.timeout,
        })
    }

    fn without_fallbacks(&self) -> LlmClient {
        let mut clone = self.clone();
        clone.fallback_models = Vec::new();
        clone
    }

    /// Dispatch a non-streaming request through this client and its
    /// fallback models, if any.
    pub async fn execute_chat(&self, request: ChatRequest) -> Result<(ChatResponse, CallStats)> {
        if self.fallback_models.is_empty() {
            return self.execute_once(&request).await;
        }

        let mut candidates: Vec<LlmClient> = vec![self.without_fallbacks()];
        for model in &self.fallback_models {
            match self.with_model(model).await {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    tracing::warn!(model = model.as_str(), error = %e, "skipping unloadable fallback model");
                }
            }
        }

        let total = candidates.len();
        let mut chain = FallbackChain::new(FallbackConfig::default());
        for (position, candidate) in candidates.into_iter().enumerate() {
            let name = format!("{}/{}", candidate.manifest.id, candidate.model_id);
            let weight = (total - position) as f64;
            let candidate = Arc::new(candidate);
            let request = request.clone();
            chain = chain.add_target(name, weight, move || {
                let candidate = Arc::clone(&candidate);
                let mut request = request.clone();
                request.model = candidate.model_id.clone();
                async move { candidate.execute_once(&request).await }
            });
        }

        let outcome = chain.execute().await;
        if let Some(used) = &outcome.target_used {
            tracing::debug!(
                chain_target = used.as_str(),
                tried = outcome.targets_tried.len(),
                "fallback chain settled"
            );
        }
        outcome.into_result()
    }

    /// One non-streaming dispatch through this client's executor.
    pub(crate) async fn execute_once(
        &self,
        request: &ChatRequest,
    ) -> Result<(ChatResponse, CallStats)> {
        validation::validate_request(&self.manifest, request)?;

        let payload = self.manifest.compile_request(request)?;
        let path = self.manifest.chat_endpoint_path().to_string();
        let client_request_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let transport = Arc::clone(&self.transport);
        let (result, stats) = self
            .executor
            .execute_with_stats(|| {
                let transport = Arc::clone(&transport);
                let payload = payload.clone();
                let path = path.clone();
                async move { transport.post(&path, &payload).await }
            })
            .await;

        let http = result?;

        if let Some(mapping) = &self.manifest.rate_limit_headers {
            self.executor
                .observe_rate_limit_headers(&http.headers, mapping)
                .await;
        }

        let response = parse_response(&self.manifest, &http.body);
        let call_stats = CallStats {
            provider: self.manifest.id.clone(),
            model: request.model.clone(),
            endpoint: path,
            http_status: Some(http.status),
            attempts: stats.attempts,
            total_retry_delay: stats.total_retry_delay,
            rate_limit_wait: stats.rate_limit_wait,
            duration: started.elapsed(),
            first_event_latency: None,
            client_request_id,
            upstream_request_id: crate::transport::http::upstream_request_id(&http.headers),
            usage: response.usage.clone(),
        };

        Ok((response, call_stats))
    }

    /// One streaming dispatch: open the byte stream through the executor,
    /// thread it through the pipeline, and hand back the event stream
    /// together with the backpressure permit that must ride along with it.
    pub(crate) async fn execute_stream_once(
        &self,
        request: &ChatRequest,
    ) -> Result<(
        BoxStream<'static, StreamingEvent>,
        Option<InflightPermit>,
        CallStats,
    )> {
        validation::validate_request(&self.manifest, request)?;

        let payload = self.manifest.compile_request(request)?;
        let path = self.manifest.chat_endpoint_path().to_string();
        let client_request_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let transport = Arc::clone(&self.transport);
        let (result, stats) = self
            .executor
            .execute_holding_permit(|| {
                let transport = Arc::clone(&transport);
                let payload = payload.clone();
                let path = path.clone();
                async move { transport.open_stream(&path, &payload).await }
            })
            .await;

        let ((byte_stream, status, headers), permit) = result?;

        if let Some(mapping) = &self.manifest.rate_limit_headers {
            self.executor
                .observe_rate_limit_headers(&headers, mapping)
                .await;
        }

        let events = self
            .pipeline
            .clone()
            .process_stream_arc(byte_stream)
            .await?;

        let call_stats = CallStats {
            provider: self.manifest.id.clone(),
            model: request.model.clone(),
            endpoint: path,
            http_status: Some(status),
            attempts: stats.attempts,
            total_retry_delay: stats.total_retry_delay,
            rate_limit_wait: stats.rate_limit_wait,
            duration: started.elapsed(),
            first_event_latency: None,
            client_request_id,
            upstream_request_id: crate::transport::http::upstream_request_id(&headers),
            usage: None,
        };

        Ok((events, permit, call_stats))
    }
}

pub(crate) fn split_model_ref(model: &str) -> (&str, &str) {
    match model.split_once('/') {
        Some((provider, model_id)) if !model_id.is_empty() => (provider, model_id),
        _ => (model, model),
    }
}

/// Parse a complete response body. Two well-known shapes are tried in
/// order: OpenAI-style, then Anthropic-style; manifest response paths (if
/// declared) take precedence for content and usage.
pub(crate) fn parse_response(manifest: &ProviderManifest, body: &Value) -> ChatResponse {
    use crate::utils::PathMapper;

    let mut response = ChatResponse {
        usage: body.get("usage").filter(|u| !u.is_null()).cloned(),
        model: body.get("model").and_then(|v| v.as_str()).map(String::from),
        ..ChatResponse::default()
    };

    if let Some(paths) = &manifest.response_paths {
        if let Some(content_path) = paths.get("content") {
            if let Some(content) = PathMapper::get_string(body, content_path) {
                response.content = content;
            }
        }
        if let Some(usage_path) = paths.get("usage") {
            if let Some(usage) = PathMapper::get_path(body, usage_path) {
                response.usage = Some(usage.clone());
            }
        }
        if !response.content.is_empty() {
            return response;
        }
    }

    // OpenAI shape
    if let Some(message) = body.pointer("/choices/0/message") {
        if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
            response.content = content.to_string();
        }
        if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tool_calls {
                let id = tc
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = tc
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let raw = tc
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let (arguments, arguments_raw) =
                    match serde_json::from_str::<Value>(raw) {
                        Ok(v) if v.is_object() => (v, None),
                        _ if raw.trim().is_empty() => (serde_json::json!({}), None),
                        _ => (serde_json::json!({}), Some(raw.to_string())),
                    };
                response.tool_calls.push(ToolCall {
                    id,
                    function_name: name,
                    arguments,
                    arguments_raw,
                });
            }
        }
        if let Some(reason) = body
            .pointer("/choices/0/finish_reason")
            .and_then(|v| v.as_str())
        {
            response.finish_reason = Some(manifest.map_termination_reason(reason));
        }
        return response;
    }

    // Anthropic shape
    if let Some(blocks) = body.get("content").and_then(|v| v.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                        response.content.push_str(text);
                    }
                }
                Some("tool_use") => {
                    response.tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        function_name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or(serde_json::json!({})),
                        arguments_raw: None,
                    });
                }
                _ => {}
            }
        }
        if let Some(reason) = body.get("stop_reason").and_then(|v| v.as_str()) {
            response.finish_reason = Some(manifest.map_termination_reason(reason));
        }
    }

    response
}
