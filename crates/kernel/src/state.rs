//! Application state shared across all handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::services::coordinator::TransformCoordinator;
use crate::services::source::{SourceAcquirer, SourceFetcher, SystemFetcher};
use crate::services::transform::{ImageTransformer, Transformer};
use crate::store::{CacheLayout, Namespace};

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// On-disk cache layout.
    layout: CacheLayout,

    /// Image pipeline: output cache, source acquisition, transforms.
    images: TransformCoordinator,

    /// Prometheus metrics.
    metrics: Arc<Metrics>,
}

impl AppState {
    /// Create application state with the default fetcher and transformer.
    pub async fn new(config: &Config) -> Result<Self> {
        let fetcher = SystemFetcher::new(config.max_source_bytes)?;
        let max_input = usize::try_from(config.max_source_bytes).unwrap_or(usize::MAX);
        Self::with_components(
            config,
            Arc::new(fetcher),
            Arc::new(ImageTransformer::new(max_input)),
        )
        .await
    }

    /// Create application state around the given capabilities.
    pub async fn with_components(
        config: &Config,
        fetcher: Arc<dyn SourceFetcher>,
        transformer: Arc<dyn Transformer>,
    ) -> Result<Self> {
        let layout = CacheLayout::prepare(&config.cache_dir, config.clear_cache)
            .await
            .context("failed to prepare cache directory")?;
        info!(root = %layout.root().display(), "cache ready");

        let metrics = Arc::new(Metrics::new());

        let input = layout.store(Namespace::INPUT_IMAGES).await?;
        let output = layout.store(Namespace::OUTPUT_IMAGES).await?;

        if let Some(dir) = &config.files_dir {
            info!(files_dir = %dir.display(), "local sources enabled");
        }

        let sources = SourceAcquirer::new(
            Arc::new(input),
            fetcher,
            config.files_dir.clone(),
            config.fetch_timeout,
            metrics.clone(),
        );
        let images = TransformCoordinator::new(
            Arc::new(output),
            sources,
            transformer,
            config.max_concurrent_transforms,
            metrics.clone(),
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                layout,
                images,
                metrics,
            }),
        })
    }

    /// Get the image transform coordinator.
    pub fn images(&self) -> &TransformCoordinator {
        &self.inner.images
    }

    /// Get the cache layout.
    pub fn layout(&self) -> &CacheLayout {
        &self.inner.layout
    }

    /// Get the metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("layout", &self.inner.layout)
            .field("images", &self.inner.images)
            .finish()
    }
}
