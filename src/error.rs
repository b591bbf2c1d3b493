//! Unified error model: a closed set of error kinds plus structured context.
//!
//! Every failure in the library surfaces exactly one [`ErrorKind`]. The kind
//! drives the retry and fallback decisions made by the resilience layer; the
//! classification table in a provider manifest maps HTTP statuses onto the
//! same closed set, so policy is data rather than a type hierarchy.

use std::time::Duration;
use thiserror::Error;

/// Closed set of error kinds.
///
/// | Kind | Retryable | Fallbackable |
/// |------|-----------|--------------|
/// | `ManifestNotFound` .. `ValidationError` | no | no |
/// | `TransportConnect`, `TransportTimeout` | yes | yes |
/// | `Authentication`, `PermissionDenied`, `NotFound` | no | yes |
/// | `RateLimited`, `ServerError`, `Overloaded` | yes | yes |
/// | `BadRequest`, `PipelineDecodeError` | no | no |
/// | `CircuitOpen` | no | yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ManifestNotFound,
    ManifestParseError,
    ManifestInvalid,
    ProtocolIncompatible,
    ValidationError,
    TransportConnect,
    TransportTimeout,
    Authentication,
    PermissionDenied,
    NotFound,
    RateLimited,
    ServerError,
    Overloaded,
    BadRequest,
    PipelineDecodeError,
    CircuitOpen,
}

impl ErrorKind {
    /// Whether a failed attempt with this kind may be re-executed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransportConnect
                | ErrorKind::TransportTimeout
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::Overloaded
        )
    }

    /// Whether the next target in a fallback chain should be tried.
    pub fn is_fallbackable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransportConnect
                | ErrorKind::TransportTimeout
                | ErrorKind::Authentication
                | ErrorKind::PermissionDenied
                | ErrorKind::NotFound
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::Overloaded
                | ErrorKind::CircuitOpen
        )
    }

    /// Default classification for an HTTP status, used when the manifest's
    /// classification table has no entry for it.
    pub fn from_http_status(status: u16) -> ErrorKind {
        match status {
            401 => ErrorKind::Authentication,
            403 => ErrorKind::PermissionDenied,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::TransportTimeout,
            429 => ErrorKind::RateLimited,
            529 => ErrorKind::Overloaded,
            s if (500..600).contains(&s) => ErrorKind::ServerError,
            s if (400..500).contains(&s) => ErrorKind::BadRequest,
            _ => ErrorKind::ServerError,
        }
    }

    /// Parse a classification label as it appears in manifest
    /// `error_classification.by_http_status` tables.
    pub fn from_label(label: &str) -> Option<ErrorKind> {
        let kind = match label {
            "manifest_not_found" => ErrorKind::ManifestNotFound,
            "manifest_parse_error" => ErrorKind::ManifestParseError,
            "manifest_invalid" => ErrorKind::ManifestInvalid,
            "protocol_incompatible" => ErrorKind::ProtocolIncompatible,
            "validation" | "validation_error" => ErrorKind::ValidationError,
            "connect" | "transport_connect" => ErrorKind::TransportConnect,
            "timeout" | "transport_timeout" => ErrorKind::TransportTimeout,
            "authentication" => ErrorKind::Authentication,
            "permission_denied" => ErrorKind::PermissionDenied,
            "not_found" => ErrorKind::NotFound,
            "rate_limited" => ErrorKind::RateLimited,
            "server_error" => ErrorKind::ServerError,
            "overloaded" => ErrorKind::Overloaded,
            "bad_request" | "invalid_request" => ErrorKind::BadRequest,
            "decode_error" | "pipeline_decode_error" => ErrorKind::PipelineDecodeError,
            "circuit_open" => ErrorKind::CircuitOpen,
            _ => return None,
        };
        Some(kind)
    }

    /// Stable wire label for the kind.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::ManifestNotFound => "manifest_not_found",
            ErrorKind::ManifestParseError => "manifest_parse_error",
            ErrorKind::ManifestInvalid => "manifest_invalid",
            ErrorKind::ProtocolIncompatible => "protocol_incompatible",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::TransportConnect => "transport_connect",
            ErrorKind::TransportTimeout => "transport_timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::PipelineDecodeError => "pipeline_decode_error",
            ErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured error context carried alongside the kind and message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Provider id from the manifest (e.g. "openai")
    pub provider: Option<String>,
    /// Model id the request targeted
    pub model: Option<String>,
    /// Endpoint path the request hit
    pub endpoint: Option<String>,
    /// HTTP status code if applicable
    pub status_code: Option<u16>,
    /// Provider request id header, verbatim
    pub request_id: Option<String>,
    /// `Retry-After` hint in milliseconds, verbatim from the response
    pub retry_after_ms: Option<u64>,
    /// Field path for validation failures (e.g. "streaming.decoder.format")
    pub field_path: Option<String>,
    /// Free-form detail (expected vs actual, offending value, ...)
    pub details: Option<String>,
    /// Actionable hint for the caller
    pub hint: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// Helper function to format error context for display.
fn format_context(ctx: &ErrorContext) -> String {
    use std::fmt::Write;
    let mut buf = String::new();

    let mut first = true;
    macro_rules! append_field {
        ($label:expr, $val:expr) => {
            if let Some(ref v) = $val {
                if first {
                    buf.push_str(" [");
                } else {
                    buf.push_str(", ");
                }
                let _ = write!(buf, "{}: {}", $label, v);
                first = false;
            }
        };
    }

    append_field!("provider", ctx.provider);
    append_field!("model", ctx.model);
    append_field!("endpoint", ctx.endpoint);
    append_field!("status", ctx.status_code);
    append_field!("request_id", ctx.request_id);
    append_field!("retry_after_ms", ctx.retry_after_ms);
    append_field!("field", ctx.field_path);
    append_field!("details", ctx.details);

    if !first {
        buf.push(']');
    }

    if let Some(ref hint) = ctx.hint {
        let _ = write!(buf, "\nhint: {}", hint);
    }

    buf
}

/// Unified error for the library: one kind, a human message, structured
/// context, and an optional wrapped cause.
#[derive(Debug, Error)]
#[error("{kind}: {message}{}", format_context(.context))]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::new(),
            cause: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Create a validation error (bad input, capability mismatch).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    /// Create an error from an HTTP failure, consulting the manifest's
    /// classification table first and the built-in taxonomy second.
    pub fn from_http_status(
        status: u16,
        message: impl Into<String>,
        manifest_kind: Option<ErrorKind>,
    ) -> Self {
        let kind = manifest_kind.unwrap_or_else(|| ErrorKind::from_http_status(status));
        Self::new(kind, message).with_context(ErrorContext::new().with_status_code(status))
    }

    /// Breaker rejection, carrying the remaining cooldown.
    pub fn circuit_open(time_until_retry: Duration) -> Self {
        Self::new(ErrorKind::CircuitOpen, "circuit breaker is open").with_context(
            ErrorContext::new().with_retry_after_ms(time_until_retry.as_millis() as u64),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_fallbackable(&self) -> bool {
        self.kind.is_fallbackable()
    }

    /// Suggested retry delay when the provider sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        // CircuitOpen reuses the field for its cooldown; that is a rejection
        // hint for the caller, not a server-provided backoff.
        if self.kind == ErrorKind::CircuitOpen {
            return None;
        }
        self.context.retry_after_ms.map(Duration::from_millis)
    }

    /// Remaining cooldown of an open breaker.
    pub fn time_until_retry(&self) -> Option<Duration> {
        if self.kind == ErrorKind::CircuitOpen {
            self.context.retry_after_ms.map(Duration::from_millis)
        } else {
            None
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.context.status_code
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(
            ErrorKind::PipelineDecodeError,
            format!("JSON error: {}", e),
        )
        .with_cause(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::TransportConnect, format!("I/O error: {}", e)).with_cause(e)
    }
}
