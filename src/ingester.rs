//! The ingester node: ingestion and query API wired to the chunk store,
//! the lifecycler, the flusher and the transfer engine.

use crate::chunk::{AppendOutcome, ChunkStore};
use crate::config::IngesterConfig;
use crate::error::{Error, Result};
use crate::flush::{ChunkSink, FlushHook, FlushReason, FlushStats, Flusher};
use crate::lifecycle::{FlushTransferer, Lifecycler};
use crate::limits::LimitsProvider;
use crate::metrics::IngesterMetrics;
use crate::ring::{KvStore, NodeState, RingClient};
use crate::transfer::{
    ChunkReceiver, ChunkTransferer, ClientFactory, TransferChunksResponse, TransferOutcome,
    TransferReceiver,
};
use crate::types::{Labels, Matcher, Sample, SampleStream, TimeRange, TimeSeries};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a single sample was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Not newer than the series' last sample.
    OutOfOrder,
    /// The tenant has reached its series limit.
    SeriesLimit,
}

impl RejectReason {
    fn from_error(e: &Error) -> Option<Self> {
        match e {
            Error::OutOfOrder { .. } => Some(RejectReason::OutOfOrder),
            Error::SeriesLimitExceeded { .. } => Some(RejectReason::SeriesLimit),
            _ => None,
        }
    }

    /// Label value used in the rejection counter.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::OutOfOrder => "out_of_order",
            RejectReason::SeriesLimit => "series_limit",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sample rejected by a push.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFailure {
    /// Series of the sample.
    pub labels: Labels,
    /// The rejected sample.
    pub sample: Sample,
    /// Rejection kind.
    pub reason: RejectReason,
    /// Error message.
    pub message: String,
}

/// Result of a push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushResponse {
    /// Samples stored.
    pub appended: usize,
    /// Identical re-sent samples that were ignored.
    pub duplicates: usize,
    /// Samples rejected individually.
    pub failures: Vec<SampleFailure>,
}

impl PushResponse {
    /// Whether every sample was stored or was a duplicate.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Disposes of in-memory data for the lifecycler. Holds no reference back
/// to the lifecycler.
#[derive(Debug)]
struct Disposer {
    flusher: Arc<Flusher>,
    transferer: ChunkTransferer,
}

#[async_trait]
impl FlushTransferer for Disposer {
    async fn flush(&self) -> Result<()> {
        let stats = self.flusher.flush_all(FlushReason::Shutdown, true).await?;
        debug!(chunks = stats.chunks, tenants = stats.tenants, "Shutdown flush done");
        Ok(())
    }

    async fn transfer_out(&self) -> Result<TransferOutcome> {
        self.transferer.transfer_out().await
    }
}

#[derive(Debug)]
struct IngesterInner {
    config: IngesterConfig,
    store: Arc<ChunkStore>,
    flusher: Arc<Flusher>,
    lifecycler: Arc<Lifecycler>,
    receiver: ChunkReceiver,
    limits: Arc<dyn LimitsProvider>,
    metrics: Arc<IngesterMetrics>,
    cancel: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for IngesterInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One ingester node. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Ingester {
    inner: Arc<IngesterInner>,
}

/// Non-owning handle to an [`Ingester`].
#[derive(Debug, Clone, Default)]
pub struct WeakIngester {
    inner: Weak<IngesterInner>,
}

impl WeakIngester {
    /// The ingester, if it is still alive.
    pub fn upgrade(&self) -> Option<Ingester> {
        self.inner.upgrade().map(|inner| Ingester { inner })
    }
}

impl Ingester {
    /// Build an ingester. Nothing touches the ring until [`start`](Self::start).
    pub fn new(
        config: IngesterConfig,
        kv: Arc<dyn KvStore>,
        sink: Arc<dyn ChunkSink>,
        clients: Arc<dyn ClientFactory>,
        limits: Arc<dyn LimitsProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(IngesterMetrics::new());
        let store = Arc::new(ChunkStore::new(config.chunk.clone()));
        let ring = RingClient::new(
            kv,
            config.lifecycler.ring_key.clone(),
            config.lifecycler.max_cas_retries,
            metrics.clone(),
        );

        let flusher = Arc::new(Flusher::new(
            store.clone(),
            sink,
            config.flush.clone(),
            config.chunk.max_chunk_idle,
            metrics.clone(),
        ));
        let transferer = ChunkTransferer::new(
            config.lifecycler.instance_id.clone(),
            store.clone(),
            ring.clone(),
            clients,
            config.transfer.clone(),
            config.lifecycler.heartbeat_timeout,
            metrics.clone(),
        );
        let disposer = Arc::new(Disposer {
            flusher: flusher.clone(),
            transferer,
        });
        let lifecycler = Arc::new(Lifecycler::new(
            config.lifecycler.clone(),
            ring,
            disposer,
            metrics.clone(),
        ));
        let receiver = ChunkReceiver::new(
            store.clone(),
            lifecycler.clone(),
            config.transfer.clone(),
            config.chunk.clone(),
            metrics.clone(),
        );

        Ok(Self {
            inner: Arc::new(IngesterInner {
                config,
                store,
                flusher,
                lifecycler,
                receiver,
                limits,
                metrics,
                cancel: CancellationToken::new(),
                sweep_handle: Mutex::new(None),
            }),
        })
    }

    /// Weak handle, for registries that must not keep the node alive.
    pub fn downgrade(&self) -> WeakIngester {
        WeakIngester {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Instance id.
    pub fn instance_id(&self) -> &str {
        &self.inner.config.lifecycler.instance_id
    }

    /// Address peers use to reach this node.
    pub fn addr(&self) -> &str {
        &self.inner.config.lifecycler.addr
    }

    /// Register in the ring and start background loops.
    pub async fn start(&self) -> Result<()> {
        self.inner.lifecycler.start().await?;
        let flusher = Arc::clone(&self.inner.flusher);
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(flusher.run_sweep_loop(cancel));
        *self.inner.sweep_handle.lock() = Some(handle);
        info!(instance_id = %self.instance_id(), addr = %self.addr(), "Ingester started");
        Ok(())
    }

    async fn stop_sweep(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.sweep_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(instance_id = %self.instance_id(), error = %e, "Flush sweep loop panicked");
            }
        }
    }

    /// Process shutdown: dispose of in-memory data and, if configured,
    /// leave the ring.
    pub async fn stop(&self) -> Result<()> {
        self.stop_sweep().await;
        self.inner.lifecycler.stop().await
    }

    /// Administrative drain. Always removes the ring record once the data
    /// has been transferred or flushed.
    pub async fn shutdown_handler(&self) -> Result<()> {
        info!(instance_id = %self.instance_id(), "Shutdown requested");
        self.stop_sweep().await;
        self.inner.lifecycler.shutdown().await
    }

    /// Append samples for `tenant`.
    ///
    /// Out-of-order samples and samples over the series limit are reported
    /// in the response; the rest of the request is still applied.
    pub fn push(&self, tenant: &str, series: Vec<TimeSeries>) -> Result<PushResponse> {
        let lifecycler = &self.inner.lifecycler;
        if !lifecycler.is_servable_for_writes() {
            return Err(Error::Unavailable {
                state: lifecycler.state(),
            });
        }

        let limits = self.inner.limits.limits(tenant);
        if let Some(limit) = limits.max_samples_per_push {
            let samples: usize = series.iter().map(|s| s.samples.len()).sum();
            if samples > limit {
                return Err(Error::PushTooLarge {
                    tenant: tenant.to_string(),
                    samples,
                    limit,
                });
            }
        }

        let store = &self.inner.store;
        let metrics = &self.inner.metrics;
        let mut response = PushResponse::default();
        for ts in series {
            for sample in ts.samples {
                match store.append(tenant, &ts.labels, sample, limits.max_series_per_tenant) {
                    Ok(result) => {
                        if result.created {
                            metrics.series_created.inc();
                        }
                        match result.outcome {
                            AppendOutcome::Appended => {
                                metrics.samples_appended.inc();
                                response.appended += 1;
                            }
                            AppendOutcome::Duplicate => {
                                metrics.samples_duplicated.inc();
                                response.duplicates += 1;
                            }
                        }
                    }
                    Err(e) => {
                        let Some(reason) = RejectReason::from_error(&e) else {
                            return Err(e);
                        };
                        metrics.record_rejection(reason.as_str());
                        response.failures.push(SampleFailure {
                            labels: ts.labels.clone(),
                            sample,
                            reason,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        metrics.memory_series.set(store.series_count() as i64);

        if !response.failures.is_empty() {
            debug!(
                %tenant,
                appended = response.appended,
                rejected = response.failures.len(),
                "Push partially rejected"
            );
        }
        Ok(response)
    }

    /// Samples of series matching all `matchers` within `range`, sorted by
    /// labels.
    pub fn query(
        &self,
        tenant: &str,
        matchers: &[Matcher],
        range: TimeRange,
    ) -> Result<Vec<SampleStream>> {
        self.check_readable()?;
        Ok(self.inner.store.query(tenant, matchers, range))
    }

    /// Label sets of `tenant`'s in-memory series matching all `matchers`.
    pub fn series(&self, tenant: &str, matchers: &[Matcher]) -> Result<Vec<Labels>> {
        self.check_readable()?;
        Ok(self.inner.store.series_matching(tenant, matchers))
    }

    /// Label names used by `tenant`'s in-memory series.
    pub fn label_names(&self, tenant: &str) -> Result<Vec<String>> {
        self.check_readable()?;
        Ok(self.inner.store.label_names(tenant))
    }

    fn check_readable(&self) -> Result<()> {
        let lifecycler = &self.inner.lifecycler;
        if lifecycler.is_servable_for_reads() {
            Ok(())
        } else {
            Err(Error::Unavailable {
                state: lifecycler.state(),
            })
        }
    }

    /// Serve an incoming chunk transfer.
    pub async fn transfer_chunks(
        &self,
        mut stream: Box<dyn TransferReceiver>,
    ) -> Result<TransferChunksResponse> {
        self.inner.receiver.receive(stream.as_mut()).await
    }

    /// Flush everything in memory, including open heads.
    pub async fn flush(&self) -> Result<FlushStats> {
        self.inner.flusher.flush_all(FlushReason::Manual, true).await
    }

    /// Install a hook called before each tenant's flush write.
    pub fn set_flush_hook(&self, hook: Option<Arc<dyn FlushHook>>) {
        self.inner.flusher.set_hook(hook);
    }

    /// Series held in memory.
    pub fn series_count(&self) -> usize {
        self.inner.store.series_count()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.inner.lifecycler.state()
    }

    /// The node's lifecycler.
    pub fn lifecycler(&self) -> &Arc<Lifecycler> {
        &self.inner.lifecycler
    }

    /// The node's metrics.
    pub fn metrics(&self) -> &Arc<IngesterMetrics> {
        &self.inner.metrics
    }
}
