//! HTTP transport.
//!
//! Performs one request per call against the manifest's endpoint: header
//! composition, credential injection, timeout resolution, and HTTP-level
//! error classification. Streaming calls surface the raw byte stream for
//! the pipeline to decode.

use crate::error::{Error, ErrorContext, ErrorKind};
use crate::manifest::ProviderManifest;
use crate::transport::pool::ClientPool;
use crate::{BoxStream, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::HeaderMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request-id headers providers commonly reply with, tried in order.
const REQUEST_ID_HEADERS: &[&str] = &["x-request-id", "request-id", "x-amzn-requestid", "cf-ray"];

/// A complete (non-streaming) HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

pub struct HttpTransport {
    client: reqwest::Client,
    manifest: Arc<ProviderManifest>,
    base_url: String,
    model: String,
    credential: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(manifest: Arc<ProviderManifest>, model: &str) -> Result<Self> {
        Self::with_options(manifest, model, None, None, None, None)
    }

    /// Full constructor. `base_url_override` serves tests against mock
    /// servers; `credential_override` bypasses environment resolution;
    /// `timeout_override` is the explicit per-client timeout; `pool`
    /// shares connection pools across transports.
    pub fn with_options(
        manifest: Arc<ProviderManifest>,
        model: &str,
        base_url_override: Option<&str>,
        credential_override: Option<String>,
        timeout_override: Option<Duration>,
        pool: Option<&dyn ClientPool>,
    ) -> Result<Self> {
        let base_url = base_url_override
            .map(|s| s.to_string())
            .unwrap_or_else(|| manifest.base_url().trim_end_matches('/').to_string());

        let credential = credential_override.or_else(|| Self::resolve_credential(&manifest));
        if credential.is_none() {
            tracing::warn!(
                provider = manifest.id.as_str(),
                "no credential found; requests will go out unauthenticated"
            );
        }

        let timeout = Self::resolve_timeout(&manifest, timeout_override);

        let client = match pool {
            Some(pool) => pool.get_client(&manifest.id, &base_url),
            None => Self::build_client()?,
        };

        Ok(Self {
            client,
            manifest,
            base_url,
            model: model.to_string(),
            credential,
            timeout,
        })
    }

    fn build_client() -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);

        // Direct connection by default; the process proxy environment is
        // honored only when explicitly opted in.
        let trust_env = env::var("AI_HTTP_TRUST_ENV").ok().as_deref() == Some("1");
        if trust_env {
            if let Ok(proxy_url) = env::var("AI_PROXY_URL") {
                if let Ok(proxy) = reqwest::Proxy::all(&proxy_url) {
                    builder = builder.proxy(proxy);
                }
            }
        } else {
            builder = builder.no_proxy();
        }

        builder.build().map_err(|e| {
            Error::new(ErrorKind::TransportConnect, format!("http client: {}", e)).with_cause(e)
        })
    }

    /// Credential resolution: the declared environment variable first, the
    /// OS keyring second.
    fn resolve_credential(manifest: &ProviderManifest) -> Option<String> {
        if let Some(var) = manifest.auth.token_env.as_deref() {
            if let Ok(key) = env::var(var) {
                if !key.trim().is_empty() {
                    return Some(key);
                }
            }
        }

        if let Ok(entry) = keyring::Entry::new(env!("CARGO_PKG_NAME"), &manifest.id) {
            if let Ok(key) = entry.get_password() {
                tracing::debug!(provider = manifest.id.as_str(), "credential loaded from keyring");
                return Some(key);
            }
        }

        None
    }

    /// Timeout resolution: explicit > environment override > manifest
    /// default (10 s when the manifest is silent).
    fn resolve_timeout(manifest: &ProviderManifest, explicit: Option<Duration>) -> Duration {
        if let Some(t) = explicit {
            return t;
        }

        let env_secs = env::var("AI_HTTP_TIMEOUT_SECS")
            .ok()
            .or_else(|| env::var("AI_TIMEOUT_SECS").ok())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(secs) = env_secs {
            return Duration::from_secs(secs);
        }

        Duration::from_millis(manifest.endpoint.timeout_ms.unwrap_or(10_000) as u64)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        let interpolated = path.replace("{model}", &self.model);
        format!("{}{}", self.base_url, interpolated)
    }

    fn apply_headers(&self, req: reqwest::RequestBuilder, streaming: bool) -> reqwest::RequestBuilder {
        let mut req = req
            .header("content-type", "application/json")
            .header(
                "accept",
                if streaming {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            )
            .header("user-agent", USER_AGENT);

        if let Some(credential) = &self.credential {
            req = match self.manifest.auth.header_name.as_deref() {
                Some(header) => req.header(header, credential),
                None => req.bearer_auth(credential),
            };
        }

        req
    }

    /// POST a JSON body and return the parsed JSON response.
    pub async fn post(&self, path: &str, body: &serde_json::Value) -> Result<HttpResponse> {
        let url = self.url_for(path);

        let response = self
            .apply_headers(self.client.post(&url), false)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e, path))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if !response.status().is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(self.classify_http_failure(status, &headers, body_text, path));
        }

        let bytes = response.bytes().await.map_err(|e| {
            Error::new(ErrorKind::TransportConnect, format!("reading body: {}", e)).with_cause(e)
        })?;
        let body = serde_json::from_slice(&bytes).map_err(|e| {
            Error::new(
                ErrorKind::PipelineDecodeError,
                format!("response is not JSON: {}", e),
            )
            .with_context(self.context(path).with_status_code(status))
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    /// POST a JSON body and open the response as a raw byte stream. The
    /// returned stream must be driven (or dropped) on every exit path.
    pub async fn open_stream(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(BoxStream<'static, Bytes>, u16, HeaderMap)> {
        let url = self.url_for(path);

        let response = self
            .apply_headers(self.client.post(&url), true)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e, path))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        if !response.status().is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(self.classify_http_failure(status, &headers, body_text, path));
        }

        let byte_stream = response.bytes_stream().map_err(|e| {
            Error::new(ErrorKind::TransportConnect, format!("stream read: {}", e)).with_cause(e)
        });

        Ok((Box::pin(byte_stream), status, headers))
    }

    fn context(&self, path: &str) -> ErrorContext {
        ErrorContext::new()
            .with_provider(self.manifest.id.clone())
            .with_model(self.model.clone())
            .with_endpoint(path.to_string())
    }

    fn classify_send_error(&self, e: reqwest::Error, path: &str) -> Error {
        let kind = if e.is_timeout() {
            ErrorKind::TransportTimeout
        } else {
            ErrorKind::TransportConnect
        };
        Error::new(kind, format!("request failed: {}", e))
            .with_context(self.context(path))
            .with_cause(e)
    }

    /// Classify a non-2xx response: manifest table first, built-in
    /// taxonomy second. Retry-After and request-id headers are carried
    /// verbatim in the error context.
    fn classify_http_failure(
        &self,
        status: u16,
        headers: &HeaderMap,
        body: String,
        path: &str,
    ) -> Error {
        let kind = self
            .manifest
            .error_kind_for_http_status(status)
            .unwrap_or_else(|| ErrorKind::from_http_status(status));

        let message = extract_error_message(&body).unwrap_or_else(|| format!("HTTP {}", status));

        let mut context = self.context(path).with_status_code(status);
        if let Some(id) = header_first(headers, REQUEST_ID_HEADERS) {
            context = context.with_request_id(id);
        }
        if let Some(ms) = retry_after_ms(headers, &self.manifest) {
            context = context.with_retry_after_ms(ms);
        }

        tracing::info!(
            provider = self.manifest.id.as_str(),
            status,
            kind = kind.label(),
            endpoint = path,
            "request failed"
        );

        Error::new(kind, message).with_context(context)
    }
}

/// The provider's request id, from whichever well-known header it uses.
pub(crate) fn upstream_request_id(headers: &HeaderMap) -> Option<String> {
    header_first(headers, REQUEST_ID_HEADERS)
}

/// First non-empty value among the named headers.
fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(value) = headers.get(*name) {
            if let Ok(s) = value.to_str() {
                let s = s.trim();
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// Parse `Retry-After` (or the manifest's mapped equivalent), seconds form
/// only, into milliseconds.
fn retry_after_ms(headers: &HeaderMap, manifest: &ProviderManifest) -> Option<u64> {
    let mapped = manifest
        .rate_limit_headers
        .as_ref()
        .and_then(|rl| rl.retry_after.as_deref());

    let raw = mapped
        .and_then(|name| header_first(headers, &[name]))
        .or_else(|| header_first(headers, &["retry-after"]))?;

    let secs: f64 = raw.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some((secs * 1000.0) as u64)
}

/// Pull a human message out of the common provider error body shapes.
fn extract_error_message(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(String::from)
        .or_else(|| {
            json.get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .or_else(|| {
            if body.trim().is_empty() {
                None
            } else {
                Some(body.trim().to_string())
            }
        })
}
