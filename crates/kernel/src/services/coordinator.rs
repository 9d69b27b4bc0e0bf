//! Request-coalescing transform coordinator.
//!
//! Per output fingerprint, an entry moves `Unseen → Pending → Done` (present
//! in the output store) or `Unseen → Pending → Failed` (absent from the store
//! and no longer in flight, so the next request starts over). `Pending` lives
//! only in the [`FlightSet`]; nothing about it is persisted.
//!
//! Waiters propagate the producer's error, except for transient failures
//! (producer cancelled, store failure) where they retry once, possibly as the
//! new producer.
//!
//! A producer cancelled before its transform starts publishes `Cancelled`.
//! After that point the transform and the write finish on their own, and
//! waiters (including a retrying client) receive that result.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::fingerprint::Fingerprint;
use crate::flight::{Claim, FlightGuard, FlightSet};
use crate::metrics::Metrics;
use crate::request::{OutputFormat, OutputSpec, TransformRequest};
use crate::services::source::SourceAcquirer;
use crate::services::transform::Transformer;
use crate::store::{Blob, ContentStore};

/// How a response was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Entry already existed.
    Hit,
    /// This request produced the entry.
    Produced,
    /// Another request produced the entry while this one waited.
    Coalesced,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Produced => "MISS",
            Self::Coalesced => "COALESCED",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved request: a readable output entry and how it was obtained.
#[derive(Debug)]
pub struct Resolved {
    pub blob: Blob,
    pub format: OutputFormat,
    pub fingerprint: Fingerprint,
    pub status: CacheStatus,
}

/// Orchestrates lookup, acquisition, transformation and publication.
pub struct TransformCoordinator {
    output: Arc<dyn ContentStore>,
    sources: SourceAcquirer,
    transformer: Arc<dyn Transformer>,
    flights: FlightSet,
    /// Limits concurrent CPU-bound transforms. Permits are held by the
    /// blocking work itself, not by the request waiting on it.
    transform_permits: Arc<Semaphore>,
    metrics: Arc<Metrics>,
}

impl TransformCoordinator {
    pub fn new(
        output: Arc<dyn ContentStore>,
        sources: SourceAcquirer,
        transformer: Arc<dyn Transformer>,
        max_concurrent_transforms: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            output,
            sources,
            transformer,
            flights: FlightSet::new(),
            transform_permits: Arc::new(Semaphore::new(max_concurrent_transforms.max(1))),
            metrics,
        }
    }

    /// Number of output fingerprints currently being produced.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Resolve a request to a readable output entry.
    pub async fn resolve(&self, request: &TransformRequest) -> ProxyResult<Resolved> {
        let fingerprint = request.fingerprint();
        let format = request.output.format;

        if let Some(blob) = self.open_output(&fingerprint, format).await? {
            self.metrics.record_cache_hit();
            debug!(%fingerprint, "output cache hit");
            return Ok(Resolved {
                blob,
                format,
                fingerprint,
                status: CacheStatus::Hit,
            });
        }
        self.metrics.record_cache_miss();

        let mut retried = false;
        loop {
            match self.flights.claim(fingerprint.as_str()) {
                Claim::Producer(guard) => {
                    let status = self.produce(request, &fingerprint, guard).await?;

                    let blob = self.open_output(&fingerprint, format).await?.ok_or_else(|| {
                        ProxyError::Store("output entry missing after write".to_string())
                    })?;
                    return Ok(Resolved {
                        blob,
                        format,
                        fingerprint,
                        status,
                    });
                }
                Claim::Waiter(waiter) => {
                    self.metrics.record_coalesced_wait();
                    debug!(%fingerprint, "waiting on in-flight production");
                    match waiter.wait().await {
                        Ok(()) => {
                            let blob =
                                self.open_output(&fingerprint, format).await?.ok_or_else(|| {
                                    ProxyError::Store(
                                        "output entry missing after production".to_string(),
                                    )
                                })?;
                            return Ok(Resolved {
                                blob,
                                format,
                                fingerprint,
                                status: CacheStatus::Coalesced,
                            });
                        }
                        Err(e) if e.is_transient() && !retried => {
                            debug!(%fingerprint, error = %e, "producer failed, retrying");
                            retried = true;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Producer path: acquire, transform, publish.
    ///
    /// Nothing is written to the output store unless every earlier step
    /// succeeded. Once a transform permit is granted, the transform and the
    /// write run on a detached task that owns the flight guard, so dropping
    /// this future leaves the fingerprint marked in flight until that work has
    /// really finished.
    async fn produce(
        &self,
        request: &TransformRequest,
        fingerprint: &Fingerprint,
        guard: FlightGuard,
    ) -> ProxyResult<CacheStatus> {
        let (source, permit) = match self.admit(request, fingerprint).await {
            Ok(Admission::Published) => {
                guard.finish(Ok(()));
                return Ok(CacheStatus::Hit);
            }
            Ok(Admission::Ready { source, permit }) => (source, permit),
            Err(e) => {
                guard.finish(Err(e.clone()));
                return Err(e);
            }
        };

        let job = PublishJob {
            output: Arc::clone(&self.output),
            transformer: Arc::clone(&self.transformer),
            metrics: Arc::clone(&self.metrics),
            spec: request.output.clone(),
            fingerprint: fingerprint.clone(),
            source_id: request.source.clone(),
        };
        let task = tokio::spawn(async move {
            let result = job.run(source, permit).await;
            guard.finish(result.clone());
            result
        });

        match task.await {
            Ok(result) => result.map(|()| CacheStatus::Produced),
            Err(e) => {
                warn!(%fingerprint, error = %e, "publish task failed");
                Err(ProxyError::Transform("publish task failed".to_string()))
            }
        }
    }

    /// Everything a producer does before it may start transforming.
    async fn admit(
        &self,
        request: &TransformRequest,
        fingerprint: &Fingerprint,
    ) -> ProxyResult<Admission> {
        // A previous producer may have published between our miss and our claim.
        if self.output_exists(fingerprint, request.output.format).await? {
            return Ok(Admission::Published);
        }

        let source = self.sources.acquire(request).await?;
        let permit = Arc::clone(&self.transform_permits)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Transform("transform pool closed".to_string()))?;
        Ok(Admission::Ready { source, permit })
    }

    async fn output_exists(&self, fingerprint: &Fingerprint, format: OutputFormat) -> ProxyResult<bool> {
        self.output
            .exists(fingerprint, format.extension())
            .await
            .map_err(|e| ProxyError::store(&e))
    }

    async fn open_output(
        &self,
        fingerprint: &Fingerprint,
        format: OutputFormat,
    ) -> ProxyResult<Option<Blob>> {
        self.output
            .open_for_read(fingerprint, format.extension())
            .await
            .map_err(|e| ProxyError::store(&e))
    }
}

enum Admission {
    /// The output appeared while we were claiming it.
    Published,
    Ready {
        source: Vec<u8>,
        permit: OwnedSemaphorePermit,
    },
}

/// Transform and publication for one fingerprint, detached from the request
/// that started it.
struct PublishJob {
    output: Arc<dyn ContentStore>,
    transformer: Arc<dyn Transformer>,
    metrics: Arc<Metrics>,
    spec: OutputSpec,
    fingerprint: Fingerprint,
    /// Source identifier, for logging.
    source_id: String,
}

impl PublishJob {
    async fn run(self, source: Vec<u8>, permit: OwnedSemaphorePermit) -> ProxyResult<()> {
        let fingerprint = &self.fingerprint;
        let format = self.spec.format;

        // CPU-bound decode/encode runs off the async workers. The permit is
        // released only when the blocking work ends.
        let transformer = Arc::clone(&self.transformer);
        let spec = self.spec.clone();
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            transformer.transform(&source, &spec)
        })
        .await;
        let elapsed = started.elapsed().as_secs_f64();

        let output = match result {
            Ok(Ok(bytes)) if !bytes.is_empty() => {
                self.metrics.record_transform(true, elapsed);
                bytes
            }
            Ok(Ok(_)) => {
                self.metrics.record_transform(false, elapsed);
                return Err(ProxyError::Transform("transform produced no output".to_string()));
            }
            Ok(Err(e)) => {
                self.metrics.record_transform(false, elapsed);
                warn!(%fingerprint, error = %e, "transform failed");
                return Err(ProxyError::transform(&e));
            }
            Err(e) => {
                self.metrics.record_transform(false, elapsed);
                warn!(%fingerprint, error = %e, "transform task panicked");
                return Err(ProxyError::Transform("transform task panicked".to_string()));
            }
        };

        self.output
            .write_atomic(fingerprint, format.extension(), &output)
            .await
            .map_err(|e| {
                warn!(%fingerprint, error = %e, "failed to publish output");
                ProxyError::store(&e)
            })?;

        info!(
            %fingerprint,
            source = %self.source_id,
            format = %format,
            size = output.len(),
            "output produced"
        );
        Ok(())
    }
}

impl fmt::Debug for TransformCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformCoordinator")
            .field("namespace", &self.output.namespace())
            .field("sources", &self.sources)
            .field("in_flight", &self.flights.len())
            .finish()
    }
}
