//! Client-level tests against a mock HTTP server.

use anyllm::error::ErrorKind;
use anyllm::resilience::ResilientConfig;
use anyllm::types::events::StreamingEvent;
use anyllm::{LlmClient, LlmClientBuilder};
use futures::StreamExt;
use std::io::Write;

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

const MANIFEST_TEMPLATE: &str = r#"
id: __ID__
protocol_version: "1.1"
endpoint:
  base_url: https://api.__ID__.example/v1
auth:
  type: bearer
  token_env: __ENV__
capabilities:
  streaming: true
  tools: true
endpoints:
  chat: __PATH__
streaming:
  decoder:
    format: sse
  content_path: "choices[0].delta.content"
  tool_call_path: "choices[0].delta.tool_calls"
error_classification:
  by_http_status:
    "429": rate_limited
    "401": authentication
"#;

fn write_manifest(dir: &std::path::Path, id: &str, chat_path: &str) {
    let yaml = MANIFEST_TEMPLATE
        .replace("__ID__", id)
        .replace("__ENV__", &format!("{}_API_KEY", id.to_uppercase()))
        .replace("__PATH__", chat_path);
    let mut file = std::fs::File::create(dir.join(format!("{}.yaml", id))).unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
}

async fn client_for(
    dir: &std::path::Path,
    server: &mockito::Server,
    model: &str,
) -> LlmClient {
    LlmClientBuilder::new()
        .manifest_dir(dir)
        .base_url_override(server.url())
        .credential("test-key")
        .resilience(ResilientConfig::default())
        .build(model)
        .await
        .unwrap()
}

#[tokio::test]
async fn non_streaming_chat_parses_openai_shape() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "mockprov", "/chat/completions");

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer test-key")
        .match_header("content-type", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("x-request-id", "req_abc")
        .with_body(
            serde_json::json!({
                "model": "mock-model",
                "choices": [{
                    "message": {"content": "Hello from the mock"},
                    "finish_reason": "stop"
                }],
                "usage": {"total_tokens": 12}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let client = client_for(dir.path(), &server, "mockprov/mock-model").await;
    let (response, stats) = client
        .chat()
        .user("Hi")
        .execute_with_stats()
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(response.content, "Hello from the mock");
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    assert_eq!(response.usage.unwrap()["total_tokens"], 12);
    assert_eq!(stats.http_status, Some(200));
    assert_eq!(stats.upstream_request_id.as_deref(), Some("req_abc"));
    assert_eq!(stats.attempts, 1);
}

#[tokio::test]
async fn streaming_chat_yields_unified_events() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "streamprov", "/chat/completions");

    let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\ndata: [DONE]\n\n";

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .match_header("accept", "text/event-stream")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body)
        .create_async()
        .await;

    let client = client_for(dir.path(), &server, "streamprov/mock-model").await;
    let stream = client
        .chat()
        .user("Hi")
        .stream()
        .execute_stream()
        .await
        .unwrap();

    let events: Vec<StreamingEvent> = stream.map(|e| e.unwrap()).collect().await;
    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| e.as_content_delta())
        .collect();
    assert_eq!(deltas, vec!["He", "llo"]);
    assert!(matches!(
        events.last(),
        Some(StreamingEvent::StreamEnd { .. })
    ));
}

#[tokio::test]
async fn streaming_collects_into_complete_response() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "collectprov", "/chat/completions");

    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"get_weather\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\": \\\"NYC\\\"}\"}}]}}]}\n\n",
        "data: [DONE]\n\n",
    );

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse_body)
        .create_async()
        .await;

    let client = client_for(dir.path(), &server, "collectprov/mock-model").await;
    let response = client.chat().user("weather?").stream().execute().await.unwrap();

    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].function_name, "get_weather");
    assert_eq!(
        response.tool_calls[0].arguments,
        serde_json::json!({"city": "NYC"})
    );
}

#[tokio::test]
async fn http_errors_classified_via_manifest_table() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "errprov", "/chat/completions");

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_header("retry-after", "2")
        .with_body(r#"{"error": {"message": "rate limit exceeded"}}"#)
        .create_async()
        .await;

    let client = client_for(dir.path(), &server, "errprov/mock-model").await;
    let err = client.chat().user("Hi").execute().await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::RateLimited);
    assert_eq!(err.status_code(), Some(429));
    assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(2)));
    assert!(err.is_retryable());
    assert!(err.is_fallbackable());
}

#[tokio::test]
async fn authentication_error_is_not_retryable() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "authprov", "/chat/completions");

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body(r#"{"error": {"message": "invalid api key"}}"#)
        .expect(1)
        .create_async()
        .await;

    // Retry enabled: a 401 must still fail on the first attempt.
    let client = LlmClientBuilder::new()
        .manifest_dir(dir.path())
        .base_url_override(server.url())
        .credential("bad-key")
        .resilience(ResilientConfig::minimal())
        .build("authprov/mock-model")
        .await
        .unwrap();

    let err = client.chat().user("Hi").execute().await.unwrap_err();
    mock.assert_async().await;
    assert_eq!(err.kind, ErrorKind::Authentication);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn fallback_models_rescue_server_errors() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "primary", "/primary/chat");
    write_manifest(dir.path(), "backup", "/backup/chat");

    let mut server = mockito::Server::new_async().await;
    let primary_mock = server
        .mock("POST", "/primary/chat")
        .with_status(500)
        .with_body(r#"{"error": {"message": "internal error"}}"#)
        .create_async()
        .await;
    let backup_mock = server
        .mock("POST", "/backup/chat")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "choices": [{"message": {"content": "saved by backup"}, "finish_reason": "stop"}]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let client = LlmClientBuilder::new()
        .manifest_dir(dir.path())
        .base_url_override(server.url())
        .credential("test-key")
        .resilience(ResilientConfig::default())
        .fallback_models(vec!["backup/backup-model".to_string()])
        .build("primary/primary-model")
        .await
        .unwrap();

    let response = client.chat().user("Hi").execute().await.unwrap();
    primary_mock.assert_async().await;
    backup_mock.assert_async().await;
    assert_eq!(response.content, "saved by backup");
}

#[tokio::test]
async fn capability_validation_rejects_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    // tools disabled
    let yaml = MANIFEST_TEMPLATE
        .replace("__ID__", "notools")
        .replace("__ENV__", "NOTOOLS_API_KEY")
        .replace("__PATH__", "/chat/completions")
        .replace("tools: true", "tools: false");
    std::fs::write(dir.path().join("notools.yaml"), yaml).unwrap();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .expect(0)
        .create_async()
        .await;

    let client = client_for(dir.path(), &server, "notools/mock-model").await;
    let err = client
        .chat()
        .user("Hi")
        .tools(vec![anyllm::types::tool::ToolDefinition::function(
            "f",
            "a function",
            serde_json::json!({"type": "object"}),
        )])
        .execute()
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert_eq!(err.kind, ErrorKind::ValidationError);
}

#[tokio::test]
async fn cancel_handle_stops_stream() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "cancelprov", "/chat/completions");

    // A long stream of deltas; we cancel after the first.
    let mut body = String::new();
    for i in 0..200 {
        body.push_str(&format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"chunk{}\"}}}}]}}\n\n",
            i
        ));
    }
    body.push_str("data: [DONE]\n\n");

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let client = client_for(dir.path(), &server, "cancelprov/mock-model").await;
    let (mut stream, handle) = client
        .chat()
        .user("Hi")
        .stream()
        .execute_stream_with_cancel()
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert!(first.as_content_delta().is_some());

    handle.cancel();
    assert!(stream.next().await.is_none());
}
