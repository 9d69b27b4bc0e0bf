#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Counting fetch/transform doubles let tests assert exactly how many times
//! the pipeline touched the network and the transformer, while the content
//! store and coordinator under test are the real ones.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use refract_kernel::metrics::Metrics;
use refract_kernel::request::OutputSpec;
use refract_kernel::services::source::{SourceAcquirer, SourceFetcher};
use refract_kernel::services::transform::Transformer;
use refract_kernel::store::{Blob, CacheLayout, ContentStore, LocalContentStore, Namespace};
use refract_kernel::{
    AppState, Config, Fingerprint, ImageParams, SourceError, TransformCoordinator,
    TransformRequest,
};
use url::Url;

/// Bytes served by [`CountingFetcher`] unless told otherwise.
pub const SOURCE_BYTES: &[u8] = b"source-bytes";

/// Fetch double that counts calls and can be made slow or failing.
pub struct CountingFetcher {
    pub calls: AtomicUsize,
    delay: Duration,
    /// Number of upcoming calls that fail with `failure`.
    failures_left: AtomicUsize,
    failure: SourceError,
}

impl CountingFetcher {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::failing(delay, 0, SourceError::NotFound("test".into()))
    }

    pub fn failing(delay: Duration, failures: usize, failure: SourceError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            failures_left: AtomicUsize::new(failures),
            failure,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn serve(&self) -> Result<Vec<u8>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(self.failure.clone());
        }
        Ok(SOURCE_BYTES.to_vec())
    }
}

#[async_trait]
impl SourceFetcher for CountingFetcher {
    async fn fetch_remote(&self, _url: &Url, _timeout: Duration) -> Result<Vec<u8>, SourceError> {
        self.serve().await
    }

    async fn read_local(&self, _root: &Path, _relative: &str) -> Result<Vec<u8>, SourceError> {
        self.serve().await
    }
}

/// Transform double: deterministic output derived from its inputs.
pub struct CountingTransformer {
    pub calls: AtomicUsize,
    delay: Duration,
    failures_left: AtomicUsize,
    /// Transforms running right now, and the most ever seen at once.
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingTransformer {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::failing(delay, 0)
    }

    pub fn failing(delay: Duration, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            failures_left: AtomicUsize::new(failures),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Transformer for CountingTransformer {
    fn transform(&self, source: &[u8], spec: &OutputSpec) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            anyhow::bail!("simulated decode failure");
        }
        let mut out = format!("{}|{:?}|", spec.format, spec.size).into_bytes();
        out.extend_from_slice(source);
        Ok(out)
    }
}

/// Config rooted in a temp dir.
pub fn test_config(cache_dir: &Path, files_dir: Option<&Path>) -> Config {
    let cache = cache_dir.to_string_lossy().into_owned();
    let files = files_dir.map(|p| p.to_string_lossy().into_owned());
    Config::from_lookup(|key| match key {
        "CACHE_DIR" => Some(cache.clone()),
        "FILES_DIRECTORY" => files.clone(),
        "FETCH_TIMEOUT_SECS" => Some("2".to_string()),
        _ => None,
    })
    .unwrap()
}

/// App state with the given doubles, cache in `cache_dir`.
pub async fn test_state(
    cache_dir: &Path,
    fetcher: Arc<dyn SourceFetcher>,
    transformer: Arc<dyn Transformer>,
) -> AppState {
    test_state_limited(cache_dir, fetcher, transformer, 4).await
}

/// Like [`test_state`], with an explicit transform concurrency limit.
pub async fn test_state_limited(
    cache_dir: &Path,
    fetcher: Arc<dyn SourceFetcher>,
    transformer: Arc<dyn Transformer>,
    max_concurrent_transforms: usize,
) -> AppState {
    let files = cache_dir.join("files");
    std::fs::create_dir_all(&files).unwrap();
    let mut config = test_config(&cache_dir.join("cache"), Some(&files));
    config.max_concurrent_transforms = max_concurrent_transforms;
    AppState::with_components(&config, fetcher, transformer)
        .await
        .unwrap()
}

/// Output store whose first `failures` writes fail.
pub struct FlakyStore {
    inner: LocalContentStore,
    failures_left: AtomicUsize,
    pub write_attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn writes(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for FlakyStore {
    async fn exists(&self, fingerprint: &Fingerprint, extension: &str) -> anyhow::Result<bool> {
        self.inner.exists(fingerprint, extension).await
    }

    async fn open_for_read(
        &self,
        fingerprint: &Fingerprint,
        extension: &str,
    ) -> anyhow::Result<Option<Blob>> {
        self.inner.open_for_read(fingerprint, extension).await
    }

    async fn write_atomic(
        &self,
        fingerprint: &Fingerprint,
        extension: &str,
        data: &[u8],
    ) -> anyhow::Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            anyhow::bail!("simulated disk full");
        }
        self.inner.write_atomic(fingerprint, extension, data).await
    }

    fn namespace(&self) -> Namespace {
        self.inner.namespace()
    }
}

/// Coordinator over a real cache in `cache_dir` whose output store fails its
/// first `store_failures` writes.
pub async fn flaky_coordinator(
    cache_dir: &Path,
    fetcher: Arc<dyn SourceFetcher>,
    transformer: Arc<dyn Transformer>,
    store_failures: usize,
) -> (Arc<TransformCoordinator>, Arc<FlakyStore>) {
    let layout = CacheLayout::prepare(&cache_dir.join("cache"), false)
        .await
        .unwrap();
    let metrics = Arc::new(Metrics::new());
    let output = Arc::new(FlakyStore {
        inner: layout.store(Namespace::OUTPUT_IMAGES).await.unwrap(),
        failures_left: AtomicUsize::new(store_failures),
        write_attempts: AtomicUsize::new(0),
    });
    let sources = SourceAcquirer::new(
        Arc::new(layout.store(Namespace::INPUT_IMAGES).await.unwrap()),
        fetcher,
        None,
        Duration::from_secs(2),
        metrics.clone(),
    );
    let coordinator =
        TransformCoordinator::new(output.clone(), sources, transformer, 4, metrics);
    (Arc::new(coordinator), output)
}

/// The example request: a remote PNG to a 100x100 JPEG at quality 0.8.
pub fn jpeg_request(source: &str) -> TransformRequest {
    TransformRequest::from_params(&ImageParams {
        source: Some(source.to_string()),
        type_hint: Some("png".to_string()),
        type_token: Some("jpeg".to_string()),
        width: Some("100".to_string()),
        height: Some("100".to_string()),
        aspect_mode: Some("fit".to_string()),
        quality: Some("0.8".to_string()),
    })
    .unwrap()
}

/// Encode a small gradient PNG.
pub fn sample_png(w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_fn(w, h, |x, y| {
        image::Rgba([(x * 5 % 256) as u8, (y * 11 % 256) as u8, 200, 255])
    });
    let mut buf = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Count regular files in a directory.
pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().is_file())
                .count()
        })
        .unwrap_or(0)
}
