//! Manifest loading and validation from disk.

use anyllm::error::ErrorKind;
use anyllm::manifest::{ManifestLoader, ManifestRegistry};
use std::io::Write;

const OPENAI_YAML: &str = r#"
id: openai
protocol_version: "1.1"
endpoint:
  base_url: https://api.openai.com/v1
  timeout_ms: 30000
auth:
  type: bearer
  token_env: OPENAI_API_KEY
capabilities:
  streaming: true
  tools: true
  vision: true
parameter_mappings:
  max_tokens: max_completion_tokens
endpoints:
  chat: /chat/completions
streaming:
  decoder:
    format: sse
  content_path: "choices[0].delta.content"
  tool_call_path: "choices[0].delta.tool_calls"
retry_policy:
  max_retries: 3
  min_delay_ms: 500
  max_delay_ms: 30000
  jitter: full
  retry_on_http_status: [429, 500, 502, 503]
rate_limit_headers:
  requests_limit: x-ratelimit-limit-requests
  requests_remaining: x-ratelimit-remaining-requests
  requests_reset: x-ratelimit-reset-requests
  retry_after: retry-after
error_classification:
  by_http_status:
    "429": rate_limited
    "401": authentication
    "503": overloaded
"#;

fn write_manifest(dir: &std::path::Path, name: &str, content: &str) {
    let mut file = std::fs::File::create(dir.join(name)).unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

#[tokio::test]
async fn loads_yaml_manifest_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "openai.yaml", OPENAI_YAML);

    let loader = ManifestLoader::new().unwrap().with_base_path(dir.path());
    let manifest = loader.load("openai").await.unwrap();

    assert_eq!(manifest.id, "openai");
    assert_eq!(manifest.chat_endpoint_path(), "/chat/completions");
    assert_eq!(manifest.parameter_name("max_tokens"), "max_completion_tokens");
    assert_eq!(manifest.error_kind_for_http_status(429), Some(ErrorKind::RateLimited));
    assert_eq!(manifest.error_kind_for_http_status(503), Some(ErrorKind::Overloaded));
    assert_eq!(manifest.error_kind_for_http_status(500), None);
}

#[tokio::test]
async fn loads_json_manifest_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    let json = serde_json::json!({
        "id": "jsonprov",
        "protocol_version": "2.0",
        "endpoint": {"base_url": "https://api.jsonprov.example"},
        "auth": {"type": "bearer", "token_env": "JSONPROV_API_KEY"},
        "capabilities": {"streaming": false, "tools": false}
    });
    write_manifest(dir.path(), "jsonprov.json", &json.to_string());

    let loader = ManifestLoader::new().unwrap().with_base_path(dir.path());
    let manifest = loader.load("jsonprov").await.unwrap();
    assert_eq!(manifest.id, "jsonprov");
    assert_eq!(manifest.protocol_version, "2.0");
}

#[tokio::test]
async fn missing_provider_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let loader = ManifestLoader::new().unwrap().with_base_path(dir.path());
    let err = loader.load("nonexistent").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ManifestNotFound);
}

#[tokio::test]
async fn yaml_syntax_error_reports_parse_error_with_location() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "broken.yaml", "id: [unclosed\nprotocol_version: \"1.1\"");

    let loader = ManifestLoader::new().unwrap().with_base_path(dir.path());
    let err = loader.load("broken").await.unwrap_err();
    assert!(matches!(
        err.kind,
        ErrorKind::ManifestParseError | ErrorKind::ManifestInvalid
    ));
}

#[tokio::test]
async fn unsupported_version_is_protocol_incompatible() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "future.yaml",
        &OPENAI_YAML.replace("\"1.1\"", "\"9.0\"").replace("id: openai", "id: future"),
    );

    let loader = ManifestLoader::new().unwrap().with_base_path(dir.path());
    let err = loader.load("future").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProtocolIncompatible);
}

#[tokio::test]
async fn parameter_name_mapping_is_total() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "openai.yaml", OPENAI_YAML);
    let loader = ManifestLoader::new().unwrap().with_base_path(dir.path());
    let manifest = loader.load("openai").await.unwrap();

    // Mapped names translate; everything else maps to itself.
    assert_eq!(manifest.parameter_name("max_tokens"), "max_completion_tokens");
    for name in ["temperature", "top_p", "stop", "stream", "made_up_parameter"] {
        assert_eq!(manifest.parameter_name(name), name);
    }
}

#[tokio::test]
async fn strict_mode_enforces_streaming_coverage() {
    let dir = tempfile::tempdir().unwrap();

    // Streaming declared but no content_path and no event_map
    let incomplete = r#"
id: partialprov
protocol_version: "1.1"
endpoint:
  base_url: https://api.partial.example
auth:
  token_env: PARTIAL_KEY
capabilities:
  streaming: true
streaming:
  decoder:
    format: sse
"#;
    write_manifest(dir.path(), "partialprov.yaml", incomplete);

    // Lenient loader accepts it
    let lenient = ManifestLoader::new().unwrap().with_base_path(dir.path());
    assert!(lenient.load("partialprov").await.is_ok());

    // Strict loader rejects it
    let strict = ManifestLoader::new()
        .unwrap()
        .with_base_path(dir.path())
        .strict(true);
    let err = strict.load("partialprov").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ManifestInvalid);
}

#[tokio::test]
async fn registry_shares_loaded_manifests() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "openai.yaml", OPENAI_YAML);

    let loader = ManifestLoader::new().unwrap().with_base_path(dir.path());
    let registry = ManifestRegistry::new(loader);

    let first = registry.get("openai").await.unwrap();
    let second = registry.get("openai").await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}
