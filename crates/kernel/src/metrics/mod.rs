//! Prometheus metrics collection.
//!
//! Provides cache and pipeline metrics in Prometheus format.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Application metrics.
pub struct Metrics {
    registry: Registry,

    /// Output cache hit counter.
    pub cache_hits: Counter,

    /// Output cache miss counter.
    pub cache_misses: Counter,

    /// Requests served by waiting on another request's production.
    pub coalesced_waits: Counter,

    /// Source acquisitions that went to the network or local root.
    pub source_fetches: Counter,

    /// Source acquisitions that failed.
    pub source_failures: Counter,

    /// Transform invocations.
    pub transforms: Counter,

    /// Transform invocations that failed.
    pub transform_failures: Counter,

    /// Transform duration histogram.
    pub transform_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let cache_hits = Counter::default();
        registry.register("cache_hits", "Output cache hit count", cache_hits.clone());

        let cache_misses = Counter::default();
        registry.register(
            "cache_misses",
            "Output cache miss count",
            cache_misses.clone(),
        );

        let coalesced_waits = Counter::default();
        registry.register(
            "coalesced_waits",
            "Requests that waited on an in-flight production",
            coalesced_waits.clone(),
        );

        let source_fetches = Counter::default();
        registry.register(
            "source_fetches",
            "Source fetches from remote or local origin",
            source_fetches.clone(),
        );

        let source_failures = Counter::default();
        registry.register(
            "source_failures",
            "Failed source fetches",
            source_failures.clone(),
        );

        let transforms = Counter::default();
        registry.register("transforms", "Transform invocations", transforms.clone());

        let transform_failures = Counter::default();
        registry.register(
            "transform_failures",
            "Failed transform invocations",
            transform_failures.clone(),
        );

        let transform_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        registry.register(
            "transform_duration_seconds",
            "Transform duration in seconds",
            transform_duration_seconds.clone(),
        );

        Self {
            registry,
            cache_hits,
            cache_misses,
            coalesced_waits,
            source_fetches,
            source_failures,
            transforms,
            transform_failures,
            transform_duration_seconds,
        }
    }

    /// Record an output cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    /// Record an output cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn record_coalesced_wait(&self) {
        self.coalesced_waits.inc();
    }

    /// Record a source fetch and whether it succeeded.
    pub fn record_source_fetch(&self, ok: bool) {
        self.source_fetches.inc();
        if !ok {
            self.source_failures.inc();
        }
    }

    /// Record a transform invocation.
    pub fn record_transform(&self, ok: bool, duration_secs: f64) {
        self.transforms.inc();
        if !ok {
            self.transform_failures.inc();
        }
        self.transform_duration_seconds.observe(duration_secs);
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// Counters are registered without a suffix; the encoder appends `_total`.
    ///
    /// # Panics
    ///
    /// Panics if Prometheus metric encoding to a `String` buffer fails.
    /// The `fmt::Write` impl for `String` is infallible and none of the
    /// registered metrics carry labels.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        // Prometheus encoding to String buffer is infallible
        #[allow(clippy::expect_used)]
        encode(&mut buffer, &self.registry).expect("encoding metrics");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}
