//! HTTP transport: one request per call, shaped entirely by the manifest.

pub mod http;
pub mod pool;

pub use http::{HttpResponse, HttpTransport};
pub use pool::{ClientPool, SharedClientPool};
