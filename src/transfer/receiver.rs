//! Incoming chunk transfer.
//!
//! The receiver stages everything in a private store and only installs it,
//! claims the sender's tokens and becomes active once the sender closed the
//! stream cleanly. On any failure nothing stays installed and the node is
//! back to `Pending`.

use super::message::{TimeSeriesChunk, TransferChunksResponse};
use super::stream::TransferReceiver;
use crate::chunk::ChunkStore;
use crate::config::{ChunkConfig, TransferConfig};
use crate::error::{Result, TransferError};
use crate::lifecycle::Lifecycler;
use crate::metrics::IngesterMetrics;
use crate::types::{Labels, SeriesKey, TenantId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Accepts transfers into the local store.
#[derive(Debug, Clone)]
pub struct ChunkReceiver {
    store: Arc<ChunkStore>,
    lifecycler: Arc<Lifecycler>,
    config: TransferConfig,
    chunk_config: ChunkConfig,
    metrics: Arc<IngesterMetrics>,
}

/// Series accepted from one stream, not yet visible to queries.
struct Staged {
    from: String,
    store: ChunkStore,
    seen: HashSet<SeriesKey>,
}

impl ChunkReceiver {
    /// Create a receiver for this node.
    pub fn new(
        store: Arc<ChunkStore>,
        lifecycler: Arc<Lifecycler>,
        config: TransferConfig,
        chunk_config: ChunkConfig,
        metrics: Arc<IngesterMetrics>,
    ) -> Self {
        Self {
            store,
            lifecycler,
            config,
            chunk_config,
            metrics,
        }
    }

    /// Serve one incoming stream. The outcome is sent to the peer and also
    /// returned.
    pub async fn receive(&self, stream: &mut dyn TransferReceiver) -> Result<TransferChunksResponse> {
        let transfer_id = stream.context().transfer_id;
        if let Err(e) = self.lifecycler.begin_transfer_in().await {
            let _ = stream.send_and_close(Err(e.to_string())).await;
            return Err(e);
        }
        info!(instance_id = %self.lifecycler.instance_id(), %transfer_id, "Receiving chunk transfer");

        match self.receive_inner(stream).await {
            Ok(response) => {
                self.metrics.series_received.inc_by(response.series_received as u64);
                self.metrics.memory_series.set(self.store.series_count() as i64);
                if let Err(e) = stream.send_and_close(Ok(response)).await {
                    warn!(%transfer_id, error = %e, "Sender went away before the acknowledgement");
                }
                info!(
                    instance_id = %self.lifecycler.instance_id(),
                    %transfer_id,
                    series = response.series_received,
                    "Chunk transfer complete"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(instance_id = %self.lifecycler.instance_id(), %transfer_id, error = %e, "Chunk transfer failed");
                self.lifecycler.abort_transfer_in().await;
                let _ = stream.send_and_close(Err(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn receive_inner(&self, stream: &mut dyn TransferReceiver) -> Result<TransferChunksResponse> {
        let staged = self.stage(stream).await?;
        let series_received = staged.seen.len();

        let installed = self.install(staged.store)?;
        if let Err(e) = self.lifecycler.complete_transfer_in(&staged.from).await {
            self.rollback(&installed);
            return Err(e);
        }
        Ok(TransferChunksResponse { series_received })
    }

    async fn stage(&self, stream: &mut dyn TransferReceiver) -> Result<Staged> {
        let mut staged: Option<Staged> = None;
        loop {
            let msg = match tokio::time::timeout(self.config.stream_idle_timeout, stream.recv()).await {
                Ok(Ok(Some(msg))) => msg,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(TransferError::Timeout.into()),
            };
            let current = staged.get_or_insert_with(|| Staged {
                from: msg.from_instance_id.clone(),
                store: ChunkStore::new(self.chunk_config.clone()),
                seen: HashSet::new(),
            });
            self.stage_one(current, msg)?;
        }
        staged.ok_or_else(|| TransferError::EmptyTransfer.into())
    }

    fn stage_one(&self, staged: &mut Staged, msg: TimeSeriesChunk) -> Result<()> {
        msg.validate()?;
        if msg.from_instance_id != staged.from {
            return Err(TransferError::Protocol(format!(
                "stream carries series from {} and {}",
                staged.from, msg.from_instance_id
            ))
            .into());
        }
        if !staged
            .seen
            .insert(SeriesKey::new(msg.tenant.clone(), msg.labels.clone()))
        {
            return Err(TransferError::Protocol(format!(
                "series {} of tenant {} sent twice",
                msg.labels, msg.tenant
            ))
            .into());
        }
        if self.store.contains_series(&msg.tenant, &msg.labels) {
            return Err(TransferError::AlreadyPopulated {
                tenant: msg.tenant,
                series: msg.labels.to_string(),
            }
            .into());
        }
        let chunks = msg.decode_chunks()?;
        debug!(tenant = %msg.tenant, series = %msg.labels, chunks = chunks.len(), "Staged series");
        staged.store.install_series(&msg.tenant, msg.labels, chunks)
    }

    /// Move staged series into the live store. On failure the series
    /// installed so far are removed again.
    fn install(&self, staged: ChunkStore) -> Result<Vec<(TenantId, Labels)>> {
        let mut installed = Vec::new();
        for (tenant, batch) in staged.take_all() {
            let labels = batch.labels.clone();
            if let Err(e) = self.store.install_series(&tenant, batch.labels, batch.chunks) {
                self.rollback(&installed);
                return Err(e);
            }
            installed.push((tenant, labels));
        }
        Ok(installed)
    }

    fn rollback(&self, installed: &[(TenantId, Labels)]) {
        for (tenant, labels) in installed {
            self.store.remove_series(tenant, labels);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::config::LifecyclerConfig;
    use crate::error::Error;
    use crate::lifecycle::FlushTransferer;
    use crate::ring::{InMemoryKvStore, NodeState, RingClient};
    use crate::transfer::{channel_stream, TransferOutcome, TransferSender};
    use crate::types::{Sample, TimeRange};
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Debug)]
    struct NoopDisposer;

    #[async_trait]
    impl FlushTransferer for NoopDisposer {
        async fn flush(&self) -> Result<()> {
            Ok(())
        }

        async fn transfer_out(&self) -> Result<TransferOutcome> {
            Ok(TransferOutcome::NothingToTransfer)
        }
    }

    struct Fixture {
        store: Arc<ChunkStore>,
        lifecycler: Arc<Lifecycler>,
        receiver: ChunkReceiver,
        ring: RingClient,
    }

    async fn fixture() -> Fixture {
        let metrics = Arc::new(IngesterMetrics::new());
        let kv = Arc::new(InMemoryKvStore::new());
        let ring = RingClient::new(kv, "ring", 10, metrics.clone());
        ring.register("ing-a", "addr-a").await.unwrap();
        ring.claim_tokens("ing-a", 4, NodeState::Active).await.unwrap();

        let mut config = LifecyclerConfig::new("ing-b", "addr-b");
        config.join_after = None;
        let lifecycler = Arc::new(Lifecycler::new(
            config,
            ring.clone(),
            Arc::new(NoopDisposer),
            metrics.clone(),
        ));
        lifecycler.start().await.unwrap();

        let store = Arc::new(ChunkStore::new(ChunkConfig::default()));
        let receiver = ChunkReceiver::new(
            store.clone(),
            lifecycler.clone(),
            TransferConfig::default(),
            ChunkConfig::default(),
            metrics,
        );
        Fixture {
            store,
            lifecycler,
            receiver,
            ring,
        }
    }

    fn message(name: &str, ts: &[i64]) -> TimeSeriesChunk {
        let chunk = Chunk::from_samples(ts.iter().map(|t| Sample::new(*t, 1.0)).collect());
        TimeSeriesChunk::new("ing-a", "t1", Labels::metric(name), &[chunk])
    }

    fn serve(
        receiver: &ChunkReceiver,
    ) -> (
        Box<dyn TransferSender>,
        tokio::task::JoinHandle<Result<TransferChunksResponse>>,
    ) {
        let (tx, mut rx) = channel_stream(4);
        let receiver = receiver.clone();
        let handle = tokio::spawn(async move { receiver.receive(&mut rx).await });
        (Box::new(tx), handle)
    }

    #[tokio::test]
    async fn test_receive_installs_and_claims_tokens() {
        let f = fixture().await;
        let (mut tx, handle) = serve(&f.receiver);
        tx.send(message("foo", &[1, 2])).await.unwrap();
        tx.send(message("bar", &[3])).await.unwrap();
        let response = tx.close_and_recv().await.unwrap();

        assert_eq!(response.series_received, 2);
        assert_eq!(handle.await.unwrap().unwrap(), response);
        assert_eq!(f.lifecycler.state(), NodeState::Active);
        assert_eq!(f.lifecycler.tokens().len(), 4);
        assert!(f.ring.instance("ing-a").await.unwrap().unwrap().tokens.is_empty());
        assert_eq!(
            f.store
                .query_series("t1", &Labels::metric("foo"), TimeRange::all())
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_populated_series_rejected() {
        let f = fixture().await;
        let foo = Labels::metric("foo");
        f.store.append("t1", &foo, Sample::new(1, 9.0), None).unwrap();

        let (mut tx, handle) = serve(&f.receiver);
        let _ = tx.send(message("foo", &[5])).await;
        assert!(tx.close_and_recv().await.is_err());
        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::Transfer(TransferError::AlreadyPopulated { .. }))
        ));

        assert_eq!(f.lifecycler.state(), NodeState::Pending);
        assert_eq!(
            f.store.query_series("t1", &foo, TimeRange::all()),
            vec![Sample::new(1, 9.0)]
        );
    }

    #[tokio::test]
    async fn test_repeated_series_rejected() {
        let f = fixture().await;
        let (mut tx, handle) = serve(&f.receiver);
        let _ = tx.send(message("foo", &[1])).await;
        let _ = tx.send(message("foo", &[2])).await;
        assert!(tx.close_and_recv().await.is_err());
        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::Transfer(TransferError::Protocol(_)))
        ));
        assert!(f.store.is_empty());
        assert_eq!(f.lifecycler.state(), NodeState::Pending);
    }

    #[tokio::test]
    async fn test_sender_gone_without_close_aborts() {
        let f = fixture().await;
        let (mut tx, handle) = serve(&f.receiver);
        tx.send(message("foo", &[1, 2])).await.unwrap();
        drop(tx);

        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::Transfer(TransferError::StreamClosed))
        ));
        assert!(f.store.is_empty());
        assert_eq!(f.lifecycler.state(), NodeState::Pending);
        assert!(f.lifecycler.tokens().is_empty());
        assert_eq!(
            f.ring.instance("ing-a").await.unwrap().unwrap().tokens.len(),
            4
        );
    }

    #[tokio::test]
    async fn test_shutdown_during_transfer_rolls_back() {
        let f = fixture().await;
        let (mut tx, handle) = serve(&f.receiver);
        tx.send(message("foo", &[1])).await.unwrap();

        let mut state = f.lifecycler.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == NodeState::Joining),
        )
        .await
        .unwrap()
        .unwrap();
        f.lifecycler.shutdown().await.unwrap();

        assert!(tx.close_and_recv().await.is_err());
        assert!(handle.await.unwrap().is_err());
        assert!(f.store.is_empty());
        assert_eq!(f.lifecycler.state(), NodeState::Stopped);
    }
}
