//! Client construction.
//!
//! The builder's `build` is where validation happens: the manifest loads
//! and validates, the pipeline wires up from it, and the executor is
//! configured — or a structured error comes back. No state lingers on
//! the builder afterwards.

use crate::client::core::{split_model_ref, LlmClient};
use crate::manifest::ManifestLoader;
use crate::pipeline::Pipeline;
use crate::resilience::{ResilientConfig, ResilientExecutor};
use crate::transport::{ClientPool, HttpTransport};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct LlmClientBuilder {
    manifest_dir: Option<PathBuf>,
    remote_manifest_source: Option<String>,
    strict_streaming: bool,
    fallback_models: Vec<String>,
    resilience: ResilientConfig,
    base_url_override: Option<String>,
    credential_override: Option<String>,
    timeout: Option<Duration>,
    pool: Option<Arc<dyn ClientPool>>,
}

impl LlmClientBuilder {
    pub fn new() -> Self {
        Self {
            manifest_dir: None,
            remote_manifest_source: None,
            strict_streaming: false,
            fallback_models: Vec::new(),
            resilience: ResilientConfig::minimal(),
            base_url_override: None,
            credential_override: None,
            timeout: None,
            pool: None,
        }
    }

    /// Directory containing `<provider>.yaml` manifests.
    pub fn manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = Some(dir.into());
        self
    }

    /// HTTPS root serving provider manifests, used after local search.
    pub fn remote_manifest_source(mut self, url: impl Into<String>) -> Self {
        self.remote_manifest_source = Some(url.into());
        self
    }

    /// Fail fast on manifests whose streaming section cannot drive a
    /// complete pipeline. Opt-in to stay compatible with partial
    /// manifests; `AI_LIB_STRICT_STREAMING=1` enables it globally.
    pub fn strict_streaming(mut self, enable: bool) -> Self {
        self.strict_streaming = enable;
        self
    }

    /// Models tried (in order) when this one fails with a fallbackable
    /// error. Each entry is a `"provider/model"` reference.
    pub fn fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    /// Resilience configuration for the client's executor.
    pub fn resilience(mut self, config: ResilientConfig) -> Self {
        self.resilience = config;
        self
    }

    /// Override the manifest's base URL (mock servers, gateways).
    pub fn base_url_override(mut self, base_url: impl Into<String>) -> Self {
        self.base_url_override = Some(base_url.into());
        self
    }

    /// Provide the credential directly instead of resolving it from the
    /// environment variable the manifest declares.
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential_override = Some(credential.into());
        self
    }

    /// Explicit request timeout; beats the environment override and the
    /// manifest default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Share HTTP clients across transports.
    pub fn client_pool(mut self, pool: Arc<dyn ClientPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Build a client for a `"provider/model"` reference.
    pub async fn build(self, model: &str) -> Result<LlmClient> {
        let strict = self.strict_streaming
            || std::env::var("AI_LIB_STRICT_STREAMING").ok().as_deref() == Some("1");

        let mut loader = ManifestLoader::new()?.strict(strict);
        if let Some(dir) = &self.manifest_dir {
            loader = loader.with_base_path(dir);
        }
        if let Some(url) = &self.remote_manifest_source {
            loader = loader.with_remote_source(url.clone());
        }
        let loader = Arc::new(loader);

        let (provider, model_id) = split_model_ref(model);
        let manifest = loader.load(provider).await?;

        let transport = Arc::new(HttpTransport::with_options(
            Arc::clone(&manifest),
            model_id,
            self.base_url_override.as_deref(),
            self.credential_override.clone(),
            self.timeout,
            self.pool.as_deref(),
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
            loader,
            model_id: model_id.to_string(),
            fallback_models: self.fallback_models,
            resilience: self.resilience,
            base_url_override: self.base_url_override,
            credential_override: self.credential_override,
            timeout: self.timeout,
        })
    }
}

impl Default for LlmClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
