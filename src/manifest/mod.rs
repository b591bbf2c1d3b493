//! Provider manifest layer.
//!
//! A manifest is the declarative, versioned description of one provider:
//! endpoints, auth, parameter mapping, streaming decode/map rules, retry
//! policy, rate-limit headers, and error classification. Everything the
//! runtime does at the wire level is driven by this data; there is no
//! per-provider code.

pub mod loader;
pub mod validator;

pub use loader::{ManifestLoader, ManifestRegistry};
pub use validator::ManifestValidator;

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol versions this runtime accepts.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1.0", "1.1", "1.5", "2.0"];

/// A unified chat request, before provider-specific compilation.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Endpoint intent, e.g. "chat"
    pub operation: String,
    /// Provider model id (e.g. "gpt-4o-mini")
    pub model: String,
    pub messages: Vec<crate::types::message::Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub stream: bool,
    pub tools: Option<Vec<crate::types::tool::ToolDefinition>>,
    /// OpenAI-style tool choice: "auto" | "none" | {"type":"function",...}
    pub tool_choice: Option<serde_json::Value>,
    /// Pass-through extras; merged into the payload without interpretation
    pub extra_params: HashMap<String, serde_json::Value>,
}

/// Parsed provider manifest. Immutable once loaded; share via `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManifest {
    pub id: String,
    pub protocol_version: String,
    pub endpoint: EndpointDefinition,
    pub auth: AuthConfig,
    pub capabilities: Capabilities,

    #[serde(default)]
    pub parameter_mappings: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamingConfig>,

    /// Named endpoints; "chat" is the one the client uses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<HashMap<String, EndpointConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_paths: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tooling: Option<ToolingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicyConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_classification: Option<ErrorClassification>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_headers: Option<RateLimitHeaders>,
}

/// Endpoint definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDefinition {
    pub base_url: String,
    /// "https" | "http" | "wss" | "ws"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Default request timeout; overridable per request and by env
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// "bearer" | "api_key"
    #[serde(rename = "type", default = "default_auth_type")]
    pub auth_type: String,
    /// Environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    /// Custom header to carry the credential instead of Authorization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
}

fn default_auth_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub tools: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub reasoning: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointConfig {
    pub path: String,
    pub method: String,
}

impl<'de> Deserialize<'de> for EndpointConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Input {
            // Shorthand: chat: "/v1/chat/completions"
            Path(String),
            Obj {
                path: String,
                #[serde(default = "default_method")]
                method: String,
            },
        }

        match Input::deserialize(deserializer)? {
            Input::Path(path) => Ok(EndpointConfig {
                path,
                method: default_method(),
            }),
            Input::Obj { path, method } => Ok(EndpointConfig { path, method }),
        }
    }
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoder: Option<DecoderConfig>,
    /// Predicate expression filtering raw frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulator: Option<AccumulatorConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateConfig>,
    /// Ordered match → emit → fields rules
    #[serde(default)]
    pub event_map: Vec<EventMapRule>,
    /// Fallback paths for the default mapper
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// "sse" | "json_lines" | "ndjson" | "anthropic_sse"
    pub format: String,
    /// Mapper selection hint, e.g. "anthropic_event_stream"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_signal: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    #[serde(default)]
    pub stateful_tool_parsing: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMapRule {
    #[serde(rename = "match")]
    pub match_expr: String,
    /// Unified event kind to emit, e.g. "ContentDelta"
    pub emit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use: Option<ToolUseMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationConfig {
    pub source_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// "none" | "full" | "equal"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on_http_status: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_http_status: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_remaining: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_reset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
}

impl ProviderManifest {
    /// Check a capability flag by name.
    pub fn supports_capability(&self, capability: &str) -> bool {
        match capability {
            "streaming" => self.capabilities.streaming,
            "tools" => self.capabilities.tools,
            "vision" => self.capabilities.vision,
            "reasoning" => self.capabilities.reasoning,
            _ => false,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }

    /// Path of the chat endpoint. Falls back to the OpenAI-compatible
    /// default when the manifest omits it.
    pub fn chat_endpoint_path(&self) -> &str {
        self.endpoints
            .as_ref()
            .and_then(|eps| eps.get("chat"))
            .map(|ep| ep.path.as_str())
            .unwrap_or("/chat/completions")
    }

    /// Total parameter-name mapping: unmapped names map to themselves.
    pub fn parameter_name<'a>(&'a self, standard_name: &'a str) -> &'a str {
        self.parameter_mappings
            .get(standard_name)
            .map(|s| s.as_str())
            .unwrap_or(standard_name)
    }

    /// Error kind for an HTTP status, per the manifest's classification
    /// table. None when the table has no entry (callers fall back to the
    /// built-in taxonomy).
    pub fn error_kind_for_http_status(&self, status: u16) -> Option<ErrorKind> {
        self.error_classification
            .as_ref()
            .and_then(|ec| ec.by_http_status.as_ref())
            .and_then(|m| m.get(&status.to_string()))
            .and_then(|label| ErrorKind::from_label(label))
    }

    /// Map a provider termination reason onto the standard vocabulary.
    pub fn map_termination_reason(&self, raw: &str) -> String {
        self.termination
            .as_ref()
            .and_then(|t| t.mapping.as_ref())
            .and_then(|m| m.get(raw))
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }

    /// Compile a unified request into the provider's wire payload.
    ///
    /// String content stays a string; content-block lists dump each block;
    /// tools are dumped per the tooling sub-configuration; extras are merged
    /// last without interpretation.
    pub fn compile_request(&self, request: &ChatRequest) -> crate::Result<serde_json::Value> {
        use crate::utils::PathMapper;
        use serde_json::Value;

        let mut payload = serde_json::json!({});

        let set = |payload: &mut Value, name: &str, value: Value| -> crate::Result<()> {
            PathMapper::set_path(payload, name, value).map_err(|e| {
                crate::Error::validation(format!("cannot set parameter {}: {}", name, e))
            })
        };

        set(
            &mut payload,
            self.parameter_name("model"),
            Value::String(request.model.clone()),
        )?;

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;
        set(
            &mut payload,
            self.parameter_name("messages"),
            Value::Array(messages),
        )?;

        if let Some(temp) = request.temperature {
            let n = serde_json::Number::from_f64(temp)
                .ok_or_else(|| crate::Error::validation("temperature is not a finite number"))?;
            set(&mut payload, self.parameter_name("temperature"), Value::Number(n))?;
        }

        if let Some(max) = request.max_tokens {
            set(
                &mut payload,
                self.parameter_name("max_tokens"),
                Value::Number(max.into()),
            )?;
        }

        if let Some(top_p) = request.top_p {
            let n = serde_json::Number::from_f64(top_p)
                .ok_or_else(|| crate::Error::validation("top_p is not a finite number"))?;
            set(&mut payload, self.parameter_name("top_p"), Value::Number(n))?;
        }

        if let Some(stop) = &request.stop {
            let stops: Vec<Value> = stop.iter().map(|s| Value::String(s.clone())).collect();
            set(&mut payload, self.parameter_name("stop"), Value::Array(stops))?;
        }

        if request.stream {
            set(&mut payload, self.parameter_name("stream"), Value::Bool(true))?;
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                let tools: Vec<Value> = tools
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<_, _>>()?;
                set(&mut payload, self.parameter_name("tools"), Value::Array(tools))?;
            }
        }

        if let Some(tool_choice) = &request.tool_choice {
            set(
                &mut payload,
                self.parameter_name("tool_choice"),
                tool_choice.clone(),
            )?;
        }

        for (key, value) in &request.extra_params {
            set(&mut payload, self.parameter_name(key), value.clone())?;
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::Message;

    fn minimal_manifest() -> ProviderManifest {
        serde_yaml::from_str(
            r#"
id: testprov
protocol_version: "1.1"
endpoint:
  base_url: https://api.test.example/v1
auth:
  type: bearer
  token_env: TESTPROV_API_KEY
capabilities:
  streaming: true
  tools: true
  vision: false
  reasoning: false
parameter_mappings:
  max_tokens: max_tokens_to_sample
"#,
        )
        .unwrap()
    }

    #[test]
    fn parameter_name_is_total() {
        let m = minimal_manifest();
        assert_eq!(m.parameter_name("max_tokens"), "max_tokens_to_sample");
        // Unmapped names return themselves
        assert_eq!(m.parameter_name("temperature"), "temperature");
        assert_eq!(m.parameter_name("unheard_of"), "unheard_of");
    }

    #[test]
    fn chat_endpoint_default() {
        let m = minimal_manifest();
        assert_eq!(m.chat_endpoint_path(), "/chat/completions");
    }

    #[test]
    fn compile_request_applies_mapping() {
        let m = minimal_manifest();
        let req = ChatRequest {
            operation: "chat".into(),
            model: "test-model".into(),
            messages: vec![Message::user("Hi")],
            max_tokens: Some(128),
            stream: true,
            ..Default::default()
        };
        let payload = m.compile_request(&req).unwrap();
        assert_eq!(payload["model"], "test-model");
        assert_eq!(payload["max_tokens_to_sample"], 128);
        assert!(payload.get("max_tokens").is_none());
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"][0]["content"], "Hi");
    }

    #[test]
    fn compile_request_merges_extras() {
        let m = minimal_manifest();
        let mut req = ChatRequest {
            model: "test-model".into(),
            messages: vec![Message::user("Hi")],
            ..Default::default()
        };
        req.extra_params
            .insert("logit_bias".into(), serde_json::json!({"50256": -100}));
        let payload = m.compile_request(&req).unwrap();
        assert_eq!(payload["logit_bias"]["50256"], -100);
    }

    #[test]
    fn error_classification_lookup() {
        let m: ProviderManifest = serde_yaml::from_str(
            r#"
id: classprov
protocol_version: "1.1"
endpoint:
  base_url: https://api.test.example
auth:
  token_env: X
capabilities: {}
error_classification:
  by_http_status:
    "429": rate_limited
    "401": authentication
    "503": overloaded
"#,
        )
        .unwrap();
        assert_eq!(
            m.error_kind_for_http_status(429),
            Some(crate::ErrorKind::RateLimited)
        );
        assert_eq!(
            m.error_kind_for_http_status(503),
            Some(crate::ErrorKind::Overloaded)
        );
        assert_eq!(m.error_kind_for_http_status(500), None);
    }

    #[test]
    fn termination_mapping() {
        let m: ProviderManifest = serde_yaml::from_str(
            r#"
id: termprov
protocol_version: "1.1"
endpoint:
  base_url: https://api.test.example
auth:
  token_env: X
capabilities: {}
termination:
  source_field: stop_reason
  mapping:
    end_turn: stop
    max_tokens: length
"#,
        )
        .unwrap();
        assert_eq!(m.map_termination_reason("end_turn"), "stop");
        assert_eq!(m.map_termination_reason("tool_use"), "tool_use");
    }
}
