//! Streaming pipeline: the fixed stage order is
//! Decoder → Selector → Accumulator → EventMapper.
//!
//! Each stage consumes a lazy stream from the prior stage and produces a
//! lazy stream; back-pressure is natural because downstream pull drives
//! upstream. Stages are per-request: a new request gets a fresh pipeline
//! run with fresh state.

pub mod accumulate;
pub mod decode;
pub mod event_map;
pub mod fan_out;
pub mod select;

#[cfg(test)]
mod tests;

use crate::manifest::ProviderManifest;
use crate::types::events::StreamingEvent;
use crate::{BoxStream, Result};

/// A transform stage: JSON frames in, JSON frames out.
#[async_trait::async_trait]
pub trait Transform: Send + Sync {
    async fn transform(
        &self,
        input: BoxStream<'static, serde_json::Value>,
    ) -> Result<BoxStream<'static, serde_json::Value>>;
}

/// The final stage: JSON frames to unified events.
#[async_trait::async_trait]
pub trait Mapper: Send + Sync {
    async fn map(
        &self,
        input: BoxStream<'static, serde_json::Value>,
    ) -> Result<BoxStream<'static, StreamingEvent>>;
}

/// The first stage: raw bytes to JSON frames.
#[async_trait::async_trait]
pub trait Decoder: Send + Sync {
    async fn decode_stream(
        &self,
        input: BoxStream<'static, bytes::Bytes>,
    ) -> Result<BoxStream<'static, serde_json::Value>>;
}

/// Builder assembling the stage chain.
pub struct PipelineBuilder {
    decoder: Option<Box<dyn Decoder>>,
    transforms: Vec<Box<dyn Transform>>,
    mapper: Option<Box<dyn Mapper>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            transforms: Vec::new(),
            mapper: None,
        }
    }

    pub fn set_decoder(mut self, decoder: Box<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn add_transform(mut self, transform: Box<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn set_mapper(mut self, mapper: Box<dyn Mapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        Ok(Pipeline {
            decoder: self
                .decoder
                .ok_or_else(|| crate::Error::validation("pipeline requires a decoder"))?,
            transforms: self.transforms,
            mapper: self
                .mapper
                .ok_or_else(|| crate::Error::validation("pipeline requires an event mapper"))?,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A built pipeline, owned by one client and shared across its requests.
pub struct Pipeline {
    decoder: Box<dyn Decoder>,
    transforms: Vec<Box<dyn Transform>>,
    mapper: Box<dyn Mapper>,
}

impl Pipeline {
    /// Wire the stage chain from a manifest's streaming configuration.
    pub fn from_manifest(manifest: &ProviderManifest) -> Result<Self> {
        let mut builder = PipelineBuilder::new();

        let streaming = manifest.streaming.clone().unwrap_or_default();

        let decoder_config = streaming.decoder.clone();
        builder = match decoder_config.as_ref() {
            Some(cfg) => builder.set_decoder(decode::create_decoder(cfg)?),
            // OpenAI-compatible SSE is the ecosystem default
            None => builder.set_decoder(Box::new(decode::SseDecoder::openai_default())),
        };

        if let Some(expr) = streaming.frame_selector.as_deref() {
            builder = builder.add_transform(select::create_selector(expr)?);
        }

        if let Some(acc) = streaming.accumulator.as_ref() {
            if acc.stateful_tool_parsing {
                builder = builder.add_transform(Box::new(accumulate::ToolCallAccumulator::new()));
            }
        }

        if let Some(candidate) = streaming.candidate.as_ref() {
            if candidate.fan_out.unwrap_or(false) {
                builder = builder.add_transform(fan_out::create_fan_out(candidate)?);
            }
        }

        // Mapper selection: explicit rules win; the Anthropic event-stream
        // variant is keyed off the decoder strategy; otherwise the
        // OpenAI-compatible path mapper.
        if !streaming.event_map.is_empty() {
            builder = builder.set_mapper(event_map::create_rule_mapper(&streaming.event_map)?);
        } else if decoder_config
            .as_ref()
            .map(|d| {
                d.strategy.as_deref() == Some("anthropic_event_stream")
                    || d.format == "anthropic_sse"
            })
            .unwrap_or(false)
        {
            builder = builder.set_mapper(Box::new(event_map::AnthropicEventMapper::new(
                manifest.termination.clone(),
            )));
        } else {
            builder = builder.set_mapper(Box::new(event_map::PathEventMapper::new(
                streaming.content_path.clone(),
                streaming.tool_call_path.clone(),
                streaming.usage_path.clone(),
                manifest.tooling.as_ref().and_then(|t| t.tool_use.clone()),
            )));
        }

        builder.build()
    }

    /// Run a byte stream through the stage chain.
    pub async fn process_stream(
        &self,
        input: BoxStream<'static, bytes::Bytes>,
    ) -> Result<BoxStream<'static, StreamingEvent>> {
        let mut stream = self.decoder.decode_stream(input).await?;

        for transform in &self.transforms {
            stream = transform.transform(stream).await?;
        }

        self.mapper.map(stream).await
    }

    pub async fn process_stream_arc(
        self: std::sync::Arc<Self>,
        input: BoxStream<'static, bytes::Bytes>,
    ) -> Result<BoxStream<'static, StreamingEvent>> {
        self.process_stream(input).await
    }
}
