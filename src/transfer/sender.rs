//! Outgoing chunk transfer, run while leaving.

use super::message::TimeSeriesChunk;
use super::stream::{ClientFactory, TransferSender};
use crate::chunk::ChunkStore;
use crate::config::TransferConfig;
use crate::error::{Error, Result, TransferError};
use crate::metrics::IngesterMetrics;
use crate::ring::RingClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a transfer-out that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Everything was handed to `to`.
    Transferred { to: String, series: usize },
    /// The store was empty; no stream was opened.
    NothingToTransfer,
    /// Transfer-out is turned off (`max_transfer_retries = 0`).
    Disabled,
}

/// Streams the whole chunk store to a pending peer.
#[derive(Debug, Clone)]
pub struct ChunkTransferer {
    instance_id: String,
    store: Arc<ChunkStore>,
    ring: RingClient,
    clients: Arc<dyn ClientFactory>,
    config: TransferConfig,
    heartbeat_timeout: Duration,
    metrics: Arc<IngesterMetrics>,
}

impl ChunkTransferer {
    /// Create a transferer for this node.
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<ChunkStore>,
        ring: RingClient,
        clients: Arc<dyn ClientFactory>,
        config: TransferConfig,
        heartbeat_timeout: Duration,
        metrics: Arc<IngesterMetrics>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            ring,
            clients,
            config,
            heartbeat_timeout,
            metrics,
        }
    }

    /// Transfer everything in memory, retrying with backoff. The store is
    /// cleared once a peer acknowledged.
    pub async fn transfer_out(&self) -> Result<TransferOutcome> {
        let max_attempts = self.config.max_transfer_retries;
        if max_attempts == 0 {
            return Ok(TransferOutcome::Disabled);
        }
        if self.store.is_empty() {
            return Ok(TransferOutcome::NothingToTransfer);
        }

        let mut backoff = self.config.min_backoff;
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.attempt().await {
                Ok((to, series)) => {
                    self.store.clear();
                    self.metrics.transfers_out.inc();
                    self.metrics.memory_series.set(0);
                    info!(instance_id = %self.instance_id, peer = %to, series, attempt, "Transfer out complete");
                    return Ok(TransferOutcome::Transferred { to, series });
                }
                Err(e) => {
                    self.metrics.transfers_failed.inc();
                    warn!(instance_id = %self.instance_id, attempt, error = %e, "Transfer attempt failed");
                    last_error = e.to_string();
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
        }

        Err(TransferError::Exhausted {
            attempts: max_attempts,
            last_error,
        }
        .into())
    }

    async fn attempt(&self) -> Result<(String, usize)> {
        let (peer_id, peer) = self
            .ring
            .find_pending_peer(
                &self.instance_id,
                self.heartbeat_timeout,
                self.config.peer_lookup_timeout,
            )
            .await?
            .ok_or(TransferError::NoPeer)?;

        let client = self.clients.connect(&peer.addr).await?;
        let mut stream = client.transfer_chunks().await?;
        debug!(
            instance_id = %self.instance_id,
            peer = %peer_id,
            transfer_id = %stream.context().transfer_id,
            "Opened transfer stream"
        );

        let idle = self.config.stream_idle_timeout;
        let mut sent = 0;
        for handle in self.store.snapshot_all() {
            let chunks = handle.chunks();
            if chunks.is_empty() {
                continue;
            }
            let msg = TimeSeriesChunk::new(&self.instance_id, handle.tenant, handle.labels, &chunks);
            match tokio::time::timeout(idle, stream.send(msg)).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => return Err(remote_error(stream.as_mut(), idle, e).await),
                Err(_) => return Err(TransferError::Timeout.into()),
            }
        }

        let response = match tokio::time::timeout(idle, stream.close_and_recv()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransferError::Timeout.into()),
        };
        if response.series_received != sent {
            return Err(TransferError::Protocol(format!(
                "peer acknowledged {} series, sent {}",
                response.series_received, sent
            ))
            .into());
        }
        Ok((peer_id, sent))
    }
}

/// A failed send usually means the receiver gave up; prefer its reason.
async fn remote_error(stream: &mut dyn TransferSender, idle: Duration, send_error: Error) -> Error {
    match tokio::time::timeout(idle, stream.close_and_recv()).await {
        Ok(Err(e @ Error::Transfer(TransferError::Remote(_)))) => e,
        _ => send_error,
    }
}
