//! Flushing closed chunks to the durable sink.
//!
//! A flush seals idle heads, then drains each tenant and writes its series
//! to the sink. At most `concurrent_flushes` tenants are in flight. A tenant
//! whose write fails gets its chunks back and is retried; other tenants are
//! unaffected.

use super::sink::ChunkSink;
use crate::chunk::{ChunkStore, FlushBatch};
use crate::config::FlushConfig;
use crate::error::{FlushError, Result};
use crate::metrics::IngesterMetrics;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a flush runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Periodic sweep of idle chunks.
    Idle,
    /// Disposition while leaving.
    Shutdown,
    /// Explicit request.
    Manual,
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushReason::Idle => write!(f, "idle"),
            FlushReason::Shutdown => write!(f, "shutdown"),
            FlushReason::Manual => write!(f, "manual"),
        }
    }
}

/// Called for each tenant after its chunks were drained and before they
/// are written.
#[async_trait]
pub trait FlushHook: Send + Sync + std::fmt::Debug {
    /// Runs before the tenant's first write.
    async fn before_write(&self, tenant: &str);
}

/// Summary of a completed flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Heads sealed before draining.
    pub sealed: usize,
    /// Tenants with data written.
    pub tenants: usize,
    /// Chunks written.
    pub chunks: usize,
}

/// Writes closed chunks to a [`ChunkSink`].
#[derive(Debug)]
pub struct Flusher {
    store: Arc<ChunkStore>,
    sink: Arc<dyn ChunkSink>,
    config: FlushConfig,
    max_chunk_idle: Duration,
    limiter: Arc<Semaphore>,
    hook: RwLock<Option<Arc<dyn FlushHook>>>,
    metrics: Arc<IngesterMetrics>,
}

impl Flusher {
    /// Create a flusher.
    pub fn new(
        store: Arc<ChunkStore>,
        sink: Arc<dyn ChunkSink>,
        config: FlushConfig,
        max_chunk_idle: Duration,
        metrics: Arc<IngesterMetrics>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.concurrent_flushes.max(1)));
        Self {
            store,
            sink,
            config,
            max_chunk_idle,
            limiter,
            hook: RwLock::new(None),
            metrics,
        }
    }

    /// Install a hook run between draining and writing.
    pub fn set_hook(&self, hook: Option<Arc<dyn FlushHook>>) {
        *self.hook.write() = hook;
    }

    /// Flush every tenant. With `force_head` the open heads are flushed too.
    pub async fn flush_all(self: &Arc<Self>, reason: FlushReason, force_head: bool) -> Result<FlushStats> {
        let sealed = self.store.close_idle(Instant::now(), self.max_chunk_idle);
        let tenants = self.store.tenants();
        debug!(%reason, sealed, tenants = tenants.len(), "Starting flush");

        let mut tasks = JoinSet::new();
        for tenant in tenants {
            let flusher = Arc::clone(self);
            tasks.spawn(async move {
                let result = match Arc::clone(&flusher.limiter).acquire_owned().await {
                    Ok(_permit) => flusher.flush_tenant(&tenant, force_head).await,
                    Err(_) => Err(FlushError::Sink("flush limiter closed".into())),
                };
                (tenant, result)
            });
        }

        let mut stats = FlushStats {
            sealed,
            ..Default::default()
        };
        let mut failed = Vec::new();
        let mut last_error = String::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(0))) => {}
                Ok((_, Ok(chunks))) => {
                    stats.tenants += 1;
                    stats.chunks += chunks;
                }
                Ok((tenant, Err(e))) => {
                    error!(%tenant, %reason, error = %e, "Flush of tenant failed");
                    last_error = e.to_string();
                    failed.push(tenant);
                }
                Err(e) => {
                    last_error = format!("flush task failed: {e}");
                    error!(%reason, error = %last_error, "Flush task panicked");
                    failed.push(String::from("<unknown>"));
                }
            }
        }
        self.metrics
            .memory_series
            .set(self.store.series_count() as i64);

        if !failed.is_empty() {
            failed.sort();
            return Err(FlushError::Exhausted {
                tenants: failed,
                last_error,
            }
            .into());
        }
        if stats.chunks > 0 {
            info!(%reason, tenants = stats.tenants, chunks = stats.chunks, "Flush complete");
        }
        Ok(stats)
    }

    /// Flush one tenant, retrying failed attempts. Returns chunks written.
    async fn flush_tenant(&self, tenant: &str, force_head: bool) -> std::result::Result<usize, FlushError> {
        let attempts = self.config.max_flush_retries.max(1);
        let mut last_error = FlushError::Sink("no attempt made".into());
        for attempt in 1..=attempts {
            let batches = self.store.drain_for_flush(tenant, force_head);
            if batches.is_empty() {
                return Ok(0);
            }

            let hook = self.hook.read().clone();
            if let Some(hook) = hook {
                hook.before_write(tenant).await;
            }

            let written = tokio::time::timeout(
                self.config.flush_op_timeout,
                self.write_batches(tenant, &batches),
            )
            .await;
            match written {
                Ok(Ok(chunks)) => {
                    self.metrics.chunks_flushed.inc_by(chunks as u64);
                    debug!(%tenant, chunks, attempt, "Flushed tenant");
                    return Ok(chunks);
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = FlushError::Timeout {
                        tenant: tenant.to_string(),
                    }
                }
            }

            self.metrics.flush_failures.inc();
            warn!(%tenant, attempt, error = %last_error, "Flush attempt failed, restoring chunks");
            self.store.restore(tenant, batches);
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
        Err(last_error)
    }

    async fn write_batches(
        &self,
        tenant: &str,
        batches: &[FlushBatch],
    ) -> std::result::Result<usize, FlushError> {
        let mut chunks = 0;
        for batch in batches {
            self.sink
                .write(tenant, &batch.labels, &batch.chunks)
                .await
                .map_err(|e| FlushError::Sink(e.to_string()))?;
            chunks += batch.chunks.len();
        }
        Ok(chunks)
    }

    /// Periodically flush idle chunks until cancelled.
    pub async fn run_sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.flush_check_period;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.flush_all(FlushReason::Idle, false).await {
                        warn!(error = %e, "Periodic flush failed");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Flush sweep loop shutting down");
                    break;
                }
            }
        }
    }
}
