//! Source acquisition.
//!
//! Resolves a request's source to raw bytes, either from a restricted local
//! root or over HTTP, and persists them in the input store under the source
//! fingerprint so every later request for the same source reuses them.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ProxyError, ProxyResult, SourceError};
use crate::fingerprint::Fingerprint;
use crate::flight::{Claim, FlightSet};
use crate::metrics::Metrics;
use crate::request::{SourceRef, TransformRequest};
use crate::store::ContentStore;

/// Maximum number of redirects followed for a remote source.
const MAX_REDIRECTS: usize = 5;

/// Transport for source bytes.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch a remote source, giving up after `timeout`.
    async fn fetch_remote(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, SourceError>;

    /// Read `relative` from under `root`.
    ///
    /// `relative` has already passed lexical traversal checks; implementations
    /// must still refuse anything whose resolved location leaves `root`.
    async fn read_local(&self, root: &Path, relative: &str) -> Result<Vec<u8>, SourceError>;
}

/// Default fetcher: `reqwest` for remote sources, `tokio::fs` for local ones.
#[derive(Debug, Clone)]
pub struct SystemFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl SystemFetcher {
    pub fn new(max_bytes: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("refract/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, max_bytes })
    }

    fn too_large(&self, size: u64) -> SourceError {
        SourceError::Rejected(format!(
            "source is {size} bytes, limit is {}",
            self.max_bytes
        ))
    }
}

fn classify_reqwest_error(url: &Url, err: &reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout(url.to_string())
    } else {
        SourceError::Upstream(format!("{url}: {err}"))
    }
}

#[async_trait]
impl SourceFetcher for SystemFetcher {
    async fn fetch_remote(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, SourceError> {
        let mut response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(url, &e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(SourceError::NotFound(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(SourceError::Upstream(format!("{url} returned {status}")));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(self.too_large(len));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_reqwest_error(url, &e))?
        {
            let size = (body.len() + chunk.len()) as u64;
            if size > self.max_bytes {
                return Err(self.too_large(size));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(%url, size = body.len(), "fetched remote source");
        Ok(body)
    }

    async fn read_local(&self, root: &Path, relative: &str) -> Result<Vec<u8>, SourceError> {
        let canonical_root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| SourceError::Upstream(format!("local root unavailable: {e}")))?;

        let path = canonical_root.join(relative);
        let resolved = match tokio::fs::canonicalize(&path).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(relative.to_string()));
            }
            Err(e) => return Err(SourceError::Upstream(format!("{relative}: {e}"))),
        };

        // Symlinks may point anywhere; the resolved target must stay under the root.
        if !resolved.starts_with(&canonical_root) {
            return Err(SourceError::Rejected(format!(
                "{relative} resolves outside the files directory"
            )));
        }

        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| SourceError::Upstream(format!("{relative}: {e}")))?;
        if !meta.is_file() {
            return Err(SourceError::NotFound(relative.to_string()));
        }
        if meta.len() > self.max_bytes {
            return Err(self.too_large(meta.len()));
        }

        let data = tokio::fs::read(&resolved)
            .await
            .map_err(|e| SourceError::Upstream(format!("{relative}: {e}")))?;
        debug!(path = %resolved.display(), size = data.len(), "read local source");
        Ok(data)
    }
}

/// Validate a local reference to prevent directory traversal attacks.
///
/// Uses component-by-component validation rather than substring matching
/// to prevent normalization bypass attacks.
fn validate_relative_path(path: &str) -> Result<(), SourceError> {
    let reject = |why: &str| Err(SourceError::Rejected(format!("{path:?}: {why}")));

    if path.is_empty() {
        return reject("empty path");
    }
    if path.contains('\0') {
        return reject("contains NUL byte");
    }
    // Reject absolute paths (Unix and Windows). Drive prefixes such as `C:`
    // surface as `Component::Prefix` on Windows and are refused below.
    if path.starts_with('/') || path.starts_with('\\') {
        return reject("absolute path");
    }
    for component in path.split(['/', '\\']) {
        if component == ".." {
            return reject("parent directory component");
        }
    }
    if Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return reject("non-relative component");
    }
    Ok(())
}

/// Resolves sources to bytes, caching them in the input store.
pub struct SourceAcquirer {
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn SourceFetcher>,
    /// Root for local references; `None` disables local sources.
    local_root: Option<PathBuf>,
    fetch_timeout: Duration,
    flights: FlightSet,
    metrics: Arc<Metrics>,
}

impl SourceAcquirer {
    pub fn new(
        store: Arc<dyn ContentStore>,
        fetcher: Arc<dyn SourceFetcher>,
        local_root: Option<PathBuf>,
        fetch_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            fetcher,
            local_root,
            fetch_timeout,
            flights: FlightSet::new(),
            metrics,
        }
    }

    /// Return the source bytes for `request`, fetching them at most once per
    /// source fingerprint even under concurrent callers.
    pub async fn acquire(&self, request: &TransformRequest) -> ProxyResult<Vec<u8>> {
        let fingerprint = request.source_fingerprint();
        let extension = request.input_extension();

        if let Some(bytes) = self.cached(&fingerprint, extension).await? {
            debug!(%fingerprint, "source cache hit");
            return Ok(bytes);
        }

        let mut retried = false;
        loop {
            match self.flights.claim(fingerprint.as_str()) {
                Claim::Producer(guard) => {
                    let result = self.fetch_and_store(request, &fingerprint, extension).await;
                    guard.finish(result.as_ref().map(|_| ()).map_err(Clone::clone));
                    return result;
                }
                Claim::Waiter(waiter) => match waiter.wait().await {
                    Ok(()) => {
                        return self.cached(&fingerprint, extension).await?.ok_or_else(|| {
                            ProxyError::Store("source entry missing after fetch".to_string())
                        });
                    }
                    Err(e) if e.is_transient() && !retried => {
                        debug!(%fingerprint, error = %e, "source producer failed, retrying");
                        retried = true;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    async fn cached(&self, fingerprint: &Fingerprint, extension: &str) -> ProxyResult<Option<Vec<u8>>> {
        self.store
            .read_all(fingerprint, extension)
            .await
            .map_err(|e| ProxyError::store(&e))
    }

    async fn fetch_and_store(
        &self,
        request: &TransformRequest,
        fingerprint: &Fingerprint,
        extension: &str,
    ) -> ProxyResult<Vec<u8>> {
        // Another producer may have finished between our miss and our claim.
        if let Some(bytes) = self.cached(fingerprint, extension).await? {
            return Ok(bytes);
        }

        let fetched = self.fetch(&request.source_ref).await;
        self.metrics.record_source_fetch(fetched.is_ok());
        let bytes = fetched.inspect_err(|e| {
            warn!(source = %request.source, error = %e, "source acquisition failed");
        })?;

        if bytes.is_empty() {
            return Err(SourceError::Upstream(format!("{} is empty", request.source)).into());
        }
        check_media(&bytes)?;

        self.store
            .write_atomic(fingerprint, extension, &bytes)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to cache source");
                ProxyError::store(&e)
            })?;

        info!(source = %request.source, %fingerprint, size = bytes.len(), "source acquired");
        Ok(bytes)
    }

    async fn fetch(&self, source: &SourceRef) -> Result<Vec<u8>, SourceError> {
        match source {
            SourceRef::Remote(url) => self.fetcher.fetch_remote(url, self.fetch_timeout).await,
            SourceRef::Local(relative) => {
                let Some(root) = &self.local_root else {
                    return Err(SourceError::Rejected(
                        "local sources are not enabled".to_string(),
                    ));
                };
                validate_relative_path(relative)?;
                self.fetcher.read_local(root, relative).await
            }
        }
    }
}

/// Refuse bodies that are recognizably not media, such as an HTML error page
/// served with a 200. Unrecognized content is left for the transformer to judge.
fn check_media(bytes: &[u8]) -> Result<(), SourceError> {
    match infer::get(bytes) {
        Some(kind)
            if !matches!(
                kind.matcher_type(),
                infer::MatcherType::Image | infer::MatcherType::Video
            ) =>
        {
            Err(SourceError::Upstream(format!(
                "source is {}, not media",
                kind.mime_type()
            )))
        }
        _ => Ok(()),
    }
}

impl std::fmt::Debug for SourceAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceAcquirer")
            .field("namespace", &self.store.namespace())
            .field("local_root", &self.local_root)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish()
    }
}
