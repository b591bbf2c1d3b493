//! Per-call statistics and stream cancellation plumbing.

use crate::resilience::InflightPermit;
use crate::types::events::StreamingEvent;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Per-call facts for observability and model selection.
#[derive(Debug, Clone, Default)]
pub struct CallStats {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub http_status: Option<u16>,
    /// Attempts made by the executor (≥ 1)
    pub attempts: u32,
    pub total_retry_delay: Duration,
    pub rate_limit_wait: Duration,
    pub duration: Duration,
    /// Latency to the first streamed event, when streaming
    pub first_event_latency: Option<Duration>,
    /// Correlation id generated client-side
    pub client_request_id: String,
    /// Provider request id header, when present
    pub upstream_request_id: Option<String>,
    pub usage: Option<serde_json::Value>,
}

/// Why a stream was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserRequest,
    Timeout,
    Error,
    Shutdown,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: bool,
    reason: Option<CancelReason>,
    at: Option<Instant>,
}

type CancelCallback = Box<dyn Fn(CancelReason) + Send + Sync>;

struct CancelShared {
    state: Mutex<CancelState>,
    callbacks: Mutex<Vec<CancelCallback>>,
}

/// Cooperative cancellation token. Consumers check it at suspension
/// points; [`ControlledStream`] checks on every poll.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<CancelShared>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CancelShared {
                state: Mutex::new(CancelState::default()),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token that cancels itself with [`CancelReason::Timeout`] after
    /// the given duration. Timeouts are just scheduled cancellations.
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        let weak = Arc::downgrade(&token.shared);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                Self { shared }.cancel(CancelReason::Timeout);
            }
        });
        token
    }

    /// Request cancellation. Returns true the first time; callbacks fire
    /// exactly once.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut state = match self.shared.state.lock() {
                Ok(state) => state,
                Err(_) => return false,
            };
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            state.reason = Some(reason);
            state.at = Some(Instant::now());
        }

        if let Ok(callbacks) = self.shared.callbacks.lock() {
            for callback in callbacks.iter() {
                callback(reason);
            }
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|s| s.cancelled)
            .unwrap_or(false)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.shared.state.lock().ok().and_then(|s| s.reason)
    }

    /// Register a callback. If the token is already cancelled, the
    /// callback fires immediately (still exactly once).
    pub fn on_cancel(&self, callback: impl Fn(CancelReason) + Send + Sync + 'static) {
        let already = {
            let state = self.shared.state.lock().ok();
            state.and_then(|s| if s.cancelled { s.reason } else { None })
        };
        if let Some(reason) = already {
            callback(reason);
            return;
        }
        if let Ok(mut callbacks) = self.shared.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-facing handle for cancelling a stream.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancelToken,
}

impl CancelHandle {
    pub(crate) fn from_token(token: CancelToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) -> bool {
        self.token.cancel(CancelReason::UserRequest)
    }

    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        self.token.cancel(reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.token.reason()
    }
}

/// Create a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let token = CancelToken::new();
    (
        CancelHandle {
            token: token.clone(),
        },
        token,
    )
}

/// Event stream wrapper tying three lifetimes together: the cancel token
/// (checked every poll), the backpressure permit (released when the
/// stream drops), and the upstream byte stream (closed when the inner
/// stream drops).
pub struct ControlledStream {
    inner: Pin<Box<dyn Stream<Item = crate::Result<StreamingEvent>> + Send>>,
    cancel: Option<CancelToken>,
    _permit: Option<InflightPermit>,
    finished: bool,
}

impl ControlledStream {
    pub fn new(
        inner: Pin<Box<dyn Stream<Item = crate::Result<StreamingEvent>> + Send>>,
        cancel: Option<CancelToken>,
        permit: Option<InflightPermit>,
    ) -> Self {
        Self {
            inner,
            cancel,
            _permit: permit,
            finished: false,
        }
    }
}

impl Stream for ControlledStream {
    type Item = crate::Result<StreamingEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                self.finished = true;
                return Poll::Ready(None);
            }
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn cancel_fires_callbacks_once() {
        let (handle, token) = cancel_pair();
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        token.on_cancel(move |reason| {
            assert_eq!(reason, CancelReason::UserRequest);
            fired_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(token.reason(), Some(CancelReason::UserRequest));
    }

    #[test]
    fn late_callback_fires_immediately() {
        let (handle, token) = cancel_pair();
        handle.cancel();
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        token.on_cancel(move |_| {
            fired_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn controlled_stream_stops_on_cancel() {
        let (handle, token) = cancel_pair();
        let events = futures::stream::iter(
            (0..100).map(|_| Ok(StreamingEvent::content_delta("x"))),
        );
        let mut stream = ControlledStream::new(Box::pin(events), Some(token), None);

        let first = stream.next().await;
        assert!(first.is_some());

        handle.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn timeout_token_cancels_itself() {
        let token = CancelToken::with_timeout(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
    }
}
