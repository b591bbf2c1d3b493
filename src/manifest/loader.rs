//! Manifest loading: local search paths, environment-configured roots, and
//! an authoritative network source, with an LRU cache and a hot-swappable
//! shared registry.

use crate::error::{Error, ErrorContext, ErrorKind};
use crate::manifest::{ManifestValidator, ProviderManifest};
use crate::Result;
use arc_swap::ArcSwap;
use lru::LruCache;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Resolves provider identifiers to validated, immutable manifests.
///
/// Search order:
/// 1. explicit base path (`with_base_path`)
/// 2. `AI_PROTOCOL_DIR` / `AI_PROTOCOL_PATH` (local dir or HTTPS root)
/// 3. in-tree search paths (`manifests/providers`, `../manifests/providers`)
/// 4. the authoritative remote source (`with_remote_source`)
pub struct ManifestLoader {
    base_path: Option<PathBuf>,
    remote_source: Option<String>,
    validator: ManifestValidator,
    cache: Mutex<LruCache<String, Arc<ProviderManifest>>>,
}

impl ManifestLoader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            base_path: None,
            remote_source: None,
            validator: ManifestValidator::new()?,
            cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(64).expect("cache size is non-zero"),
            )),
        })
    }

    /// Set an explicit directory containing `<provider>.yaml` / `.json`.
    pub fn with_base_path(mut self, path: impl AsRef<Path>) -> Self {
        self.base_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set an HTTPS root serving `<provider>.yaml` files.
    pub fn with_remote_source(mut self, url: impl Into<String>) -> Self {
        self.remote_source = Some(url.into());
        self
    }

    /// Enable strict validation (fail-fast streaming coverage checks).
    pub fn strict(mut self, enable: bool) -> Self {
        self.validator = self.validator.strict(enable);
        self
    }

    /// Load and validate the manifest for a provider id.
    pub async fn load(&self, provider_id: &str) -> Result<Arc<ProviderManifest>> {
        {
            let mut cache = self.cache.lock().map_err(|_| {
                Error::new(ErrorKind::ManifestInvalid, "manifest cache lock poisoned")
            })?;
            if let Some(manifest) = cache.get(provider_id) {
                return Ok(Arc::clone(manifest));
            }
        }

        let manifest = Arc::new(self.load_uncached(provider_id).await?);

        {
            let mut cache = self.cache.lock().map_err(|_| {
                Error::new(ErrorKind::ManifestInvalid, "manifest cache lock poisoned")
            })?;
            cache.put(provider_id.to_string(), Arc::clone(&manifest));
        }

        Ok(manifest)
    }

    async fn load_uncached(&self, provider_id: &str) -> Result<ProviderManifest> {
        let mut search_dirs: Vec<PathBuf> = Vec::new();

        if let Some(base) = &self.base_path {
            search_dirs.push(base.clone());
        }

        let mut env_url_root: Option<String> = None;
        if let Ok(root) =
            std::env::var("AI_PROTOCOL_DIR").or_else(|_| std::env::var("AI_PROTOCOL_PATH"))
        {
            if root.starts_with("http://") || root.starts_with("https://") {
                env_url_root = Some(root);
            } else {
                search_dirs.push(PathBuf::from(root));
            }
        }

        // In-tree development locations
        search_dirs.push(PathBuf::from("manifests/providers"));
        search_dirs.push(PathBuf::from("../manifests/providers"));

        for dir in &search_dirs {
            for ext in ["yaml", "yml", "json"] {
                let candidate = dir.join(format!("{}.{}", provider_id, ext));
                if candidate.exists() {
                    return self.load_from_file(&candidate).await;
                }
            }
        }

        // Network sources last: env-configured URL root, then the configured
        // authoritative source.
        for root in env_url_root.iter().chain(self.remote_source.iter()) {
            let url = if root.ends_with('/') {
                format!("{}{}.yaml", root, provider_id)
            } else {
                format!("{}/{}.yaml", root, provider_id)
            };
            match self.load_from_url(&url).await {
                Ok(manifest) => return Ok(manifest),
                Err(e) => {
                    tracing::debug!(url = url.as_str(), error = %e, "remote manifest fetch failed");
                }
            }
        }

        Err(Error::new(
            ErrorKind::ManifestNotFound,
            format!("no manifest found for provider {:?}", provider_id),
        )
        .with_context(
            ErrorContext::new().with_provider(provider_id.to_string()).with_hint(
                "place <provider>.yaml in a search directory or set AI_PROTOCOL_DIR",
            ),
        ))
    }

    async fn load_from_file(&self, path: &Path) -> Result<ProviderManifest> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(
                ErrorKind::ManifestNotFound,
                format!("cannot read {}: {}", path.display(), e),
            )
            .with_cause(e)
        })?;

        let is_json = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let manifest = if is_json {
            Self::parse_json(&content, &path.display().to_string())?
        } else {
            Self::parse_yaml(&content, &path.display().to_string())?
        };

        self.validator.validate(&manifest)?;
        Ok(manifest)
    }

    async fn load_from_url(&self, url: &str) -> Result<ProviderManifest> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| {
                Error::new(ErrorKind::TransportConnect, format!("http client: {}", e))
            })?;

        let response = client.get(url).send().await.map_err(|e| {
            Error::new(
                ErrorKind::TransportConnect,
                format!("manifest fetch failed: {}", e),
            )
            .with_cause(e)
        })?;

        if !response.status().is_success() {
            return Err(Error::new(
                ErrorKind::ManifestNotFound,
                format!("manifest fetch: HTTP {} from {}", response.status(), url),
            ));
        }

        let content = response.text().await.map_err(|e| {
            Error::new(
                ErrorKind::TransportConnect,
                format!("manifest fetch body: {}", e),
            )
            .with_cause(e)
        })?;

        let manifest = Self::parse_yaml(&content, url)?;
        self.validator.validate(&manifest)?;
        Ok(manifest)
    }

    /// Parse YAML, classifying syntax errors (with source location) apart
    /// from structural mismatches.
    fn parse_yaml(content: &str, origin: &str) -> Result<ProviderManifest> {
        serde_yaml::from_str::<ProviderManifest>(content).map_err(|e| {
            let location = e
                .location()
                .map(|l| format!("{}:{}:{}", origin, l.line(), l.column()))
                .unwrap_or_else(|| origin.to_string());
            let msg = e.to_string();
            let structural = msg.contains("missing field")
                || msg.contains("unknown field")
                || msg.contains("invalid type")
                || msg.contains("invalid value");
            let kind = if structural {
                ErrorKind::ManifestInvalid
            } else {
                ErrorKind::ManifestParseError
            };
            Error::new(kind, format!("manifest parse: {}", msg))
                .with_context(ErrorContext::new().with_details(location))
        })
    }

    fn parse_json(content: &str, origin: &str) -> Result<ProviderManifest> {
        serde_json::from_str::<ProviderManifest>(content).map_err(|e| {
            let kind = if e.is_syntax() || e.is_eof() {
                ErrorKind::ManifestParseError
            } else {
                ErrorKind::ManifestInvalid
            };
            Error::new(kind, format!("manifest parse: {}", e)).with_context(
                ErrorContext::new().with_details(format!("{}:{}:{}", origin, e.line(), e.column())),
            )
        })
    }
}

/// Shared, hot-swappable manifest registry. Multiple manifest versions
/// coexist; lookups are lock-free reads.
pub struct ManifestRegistry {
    manifests: ArcSwap<std::collections::HashMap<String, Arc<ProviderManifest>>>,
    loader: ManifestLoader,
}

impl ManifestRegistry {
    pub fn new(loader: ManifestLoader) -> Self {
        Self {
            manifests: ArcSwap::from_pointee(std::collections::HashMap::new()),
            loader,
        }
    }

    /// Get a cached manifest or load it.
    pub async fn get(&self, provider_id: &str) -> Result<Arc<ProviderManifest>> {
        let current = self.manifests.load();
        if let Some(manifest) = current.get(provider_id) {
            return Ok(Arc::clone(manifest));
        }

        let manifest = self.loader.load(provider_id).await?;

        let mut updated: std::collections::HashMap<String, Arc<ProviderManifest>> =
            current.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        updated.insert(provider_id.to_string(), Arc::clone(&manifest));
        self.manifests.store(Arc::new(updated));

        Ok(manifest)
    }

    /// Replace a manifest atomically (e.g. after re-reading its file).
    pub fn insert(&self, manifest: ProviderManifest) {
        let current = self.manifests.load();
        let mut updated: std::collections::HashMap<String, Arc<ProviderManifest>> =
            current.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        updated.insert(manifest.id.clone(), Arc::new(manifest));
        self.manifests.store(Arc::new(updated));
    }
}

impl Default for ManifestLoader {
    fn default() -> Self {
        Self::new().expect("embedded manifest schema compiles")
    }
}
