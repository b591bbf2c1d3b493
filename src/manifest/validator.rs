//! Manifest validation: JSON Schema shape checks, protocol version gate,
//! and the strict streaming coverage rules.

use crate::error::{Error, ErrorContext, ErrorKind};
use crate::manifest::{ProviderManifest, SUPPORTED_PROTOCOL_VERSIONS};
use crate::Result;
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use regex::Regex;

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{1,63}$").expect("id pattern is valid"));

/// Embedded Draft7 schema for the manifest file format. Shape-only; the
/// semantic rules live in [`ManifestValidator::validate`].
const MANIFEST_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "type": "object",
  "required": ["id", "protocol_version", "endpoint", "auth", "capabilities"],
  "properties": {
    "id": { "type": "string", "minLength": 2, "maxLength": 64 },
    "protocol_version": { "type": "string", "minLength": 1 },
    "endpoint": {
      "type": "object",
      "required": ["base_url"],
      "properties": {
        "base_url": { "type": "string", "minLength": 1 },
        "protocol": { "enum": ["https", "http", "wss", "ws"] },
        "timeout_ms": { "type": "integer", "minimum": 1 }
      }
    },
    "auth": {
      "type": "object",
      "properties": {
        "type": { "enum": ["bearer", "api_key"] },
        "token_env": { "type": "string" },
        "header_name": { "type": "string" }
      }
    },
    "capabilities": {
      "type": "object",
      "properties": {
        "streaming": { "type": "boolean" },
        "tools": { "type": "boolean" },
        "vision": { "type": "boolean" },
        "reasoning": { "type": "boolean" }
      }
    },
    "parameter_mappings": {
      "type": "object",
      "additionalProperties": { "type": "string" }
    },
    "streaming": { "type": "object" },
    "endpoints": { "type": "object" },
    "retry_policy": { "type": "object" },
    "rate_limit_headers": { "type": "object" },
    "error_classification": { "type": "object" }
  },
  "additionalProperties": true
}"#;

/// Validates parsed manifests before they are handed to the runtime.
pub struct ManifestValidator {
    schema: JSONSchema,
    strict: bool,
}

impl ManifestValidator {
    pub fn new() -> Result<Self> {
        let schema_value: serde_json::Value = serde_json::from_str(MANIFEST_SCHEMA)
            .map_err(|e| Error::new(ErrorKind::ManifestInvalid, format!("bad embedded schema: {}", e)))?;
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_value)
            .map_err(|e| {
                Error::new(
                    ErrorKind::ManifestInvalid,
                    format!("embedded schema failed to compile: {}", e),
                )
            })?;
        Ok(Self {
            schema,
            strict: false,
        })
    }

    /// Enable strict mode: streaming coverage rules become fail-fast.
    pub fn strict(mut self, enable: bool) -> Self {
        self.strict = enable;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Validate a manifest. Returns `ManifestInvalid` with the offending
    /// field path, or `ProtocolIncompatible` for an unsupported version.
    pub fn validate(&self, manifest: &ProviderManifest) -> Result<()> {
        let as_json = serde_json::to_value(manifest)
            .map_err(|e| Error::new(ErrorKind::ManifestInvalid, format!("serialize: {}", e)))?;

        if let Err(errors) = self.schema.validate(&as_json) {
            let rendered: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(Error::new(
                ErrorKind::ManifestInvalid,
                format!("schema violation: {}", rendered.join("; ")),
            )
            .with_context(ErrorContext::new().with_provider(manifest.id.clone())));
        }

        self.validate_version(manifest)?;
        self.validate_basic(manifest)?;
        if self.strict {
            self.validate_streaming_coverage(manifest)?;
        }
        Ok(())
    }

    fn validate_version(&self, manifest: &ProviderManifest) -> Result<()> {
        let version = manifest.protocol_version.trim();
        let mut parts = version.split('.');
        let major = parts.next().and_then(|p| p.parse::<u32>().ok());
        let minor = parts.next().and_then(|p| p.parse::<u32>().ok());

        if major.is_none() || minor.is_none() {
            return Err(Error::new(
                ErrorKind::ManifestInvalid,
                format!("protocol_version {:?} is not a version string", version),
            )
            .with_context(ErrorContext::new().with_field_path("protocol_version")));
        }

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return Err(Error::new(
                ErrorKind::ProtocolIncompatible,
                format!(
                    "unsupported protocol version {:?} (supported: {})",
                    version,
                    SUPPORTED_PROTOCOL_VERSIONS.join(", ")
                ),
            )
            .with_context(
                ErrorContext::new()
                    .with_provider(manifest.id.clone())
                    .with_field_path("protocol_version"),
            ));
        }

        Ok(())
    }

    fn validate_basic(&self, manifest: &ProviderManifest) -> Result<()> {
        if !ID_PATTERN.is_match(&manifest.id) {
            return Err(Error::new(
                ErrorKind::ManifestInvalid,
                format!(
                    "id {:?} must match [a-z0-9][a-z0-9_-]{{1,63}}",
                    manifest.id
                ),
            )
            .with_context(ErrorContext::new().with_field_path("id")));
        }

        url::Url::parse(&manifest.endpoint.base_url).map_err(|e| {
            Error::new(
                ErrorKind::ManifestInvalid,
                format!("endpoint.base_url {:?}: {}", manifest.endpoint.base_url, e),
            )
            .with_context(ErrorContext::new().with_field_path("endpoint.base_url"))
        })?;

        Ok(())
    }

    /// Strict streaming coverage gate: a manifest that claims streaming must
    /// declare enough configuration for the pipeline to be buildable.
    fn validate_streaming_coverage(&self, manifest: &ProviderManifest) -> Result<()> {
        if !manifest.capabilities.streaming {
            return Ok(());
        }

        let invalid = |field: &str, msg: &str| {
            Err(Error::new(ErrorKind::ManifestInvalid, msg.to_string())
                .with_context(
                    ErrorContext::new()
                        .with_provider(manifest.id.clone())
                        .with_field_path(field),
                ))
        };

        let streaming = match manifest.streaming.as_ref() {
            Some(s) => s,
            None => return invalid("streaming", "streaming capability declared without a streaming section"),
        };

        let decoder = match streaming.decoder.as_ref() {
            Some(d) if !d.format.trim().is_empty() => d,
            _ => {
                return invalid(
                    "streaming.decoder.format",
                    "streaming.decoder.format must be non-empty",
                )
            }
        };

        // A provider-specific mapper strategy carries its own extraction
        // logic; path/event-map coverage is only required for the generic
        // mappers.
        if decoder.strategy.as_deref() == Some("anthropic_event_stream")
            || decoder.format == "anthropic_sse"
        {
            return Ok(());
        }

        let has_event_map = !streaming.event_map.is_empty();
        let has_content_path = streaming
            .content_path
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);

        if !has_event_map && !has_content_path {
            return invalid(
                "streaming.content_path",
                "either streaming.event_map or streaming.content_path is required",
            );
        }

        if manifest.capabilities.tools && !has_event_map {
            let has_tool_path = streaming
                .tool_call_path
                .as_deref()
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false);
            if !has_tool_path {
                return invalid(
                    "streaming.tool_call_path",
                    "tools capability requires streaming.tool_call_path (or event_map rules covering tool calls)",
                );
            }
        }

        Ok(())
    }
}
