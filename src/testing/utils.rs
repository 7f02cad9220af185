use crate::config::{FlushConfig, IngesterConfig, LifecyclerConfig, TransferConfig};
use crate::error::Result;
use crate::flush::InMemorySink;
use crate::ingester::Ingester;
use crate::limits::{Limits, Overrides};
use crate::metrics::IngesterMetrics;
use crate::ring::{InMemoryKvStore, InstanceDesc, NodeState, RingClient};
use crate::transfer::LocalNetwork;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared backends for a set of in-process ingesters.
#[derive(Debug, Clone)]
pub struct TestCluster {
    /// Ring store.
    pub kv: Arc<InMemoryKvStore>,
    /// Address book used for transfers.
    pub network: Arc<LocalNetwork>,
    /// Durable sink shared by all nodes.
    pub sink: Arc<InMemorySink>,
    /// Tenant limits shared by all nodes.
    pub limits: Arc<Overrides>,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    /// Create empty backends.
    pub fn new() -> Self {
        Self {
            kv: Arc::new(InMemoryKvStore::new()),
            network: Arc::new(LocalNetwork::new(Self::transfer_config().stream_buffer)),
            sink: Arc::new(InMemorySink::new()),
            limits: Arc::new(Overrides::new(Limits::unlimited())),
        }
    }

    /// Configuration with short timings. The node joins immediately.
    pub fn config(&self, instance_id: &str) -> IngesterConfig {
        let lifecycler = LifecyclerConfig::new(instance_id, format!("local://{instance_id}"))
            .with_heartbeat_period(Duration::from_millis(20))
            .with_heartbeat_timeout(Duration::from_secs(5));
        IngesterConfig::default()
            .with_lifecycler_config(lifecycler)
            .with_num_tokens(16)
            .with_join_after(Some(Duration::ZERO))
            .with_transfer_config(Self::transfer_config())
            .with_flush_config(
                FlushConfig::default()
                    .with_max_flush_retries(2)
                    .with_retry_backoff(Duration::from_millis(5)),
            )
    }

    fn transfer_config() -> TransferConfig {
        TransferConfig::default()
            .with_max_transfer_retries(3)
            .with_stream_buffer(4)
            .with_peer_lookup_timeout(Duration::from_millis(100))
            .with_stream_idle_timeout(Duration::from_secs(2))
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
    }

    /// Build an ingester on the shared backends and make it reachable.
    pub fn ingester(&self, config: IngesterConfig) -> Result<Ingester> {
        let ingester = Ingester::new(
            config,
            self.kv.clone(),
            self.sink.clone(),
            self.network.clone(),
            self.limits.clone(),
        )?;
        self.network.register(ingester.addr(), ingester.downgrade());
        Ok(ingester)
    }

    /// Ring client on the shared store.
    pub fn ring(&self) -> RingClient {
        RingClient::new(self.kv.clone(), "ring", 10, Arc::new(IngesterMetrics::new()))
    }

    /// Current ring record of `instance_id`.
    pub async fn ring_instance(&self, instance_id: &str) -> Option<InstanceDesc> {
        self.ring().instance(instance_id).await.ok().flatten()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wait until the ingester reaches `state`.
pub async fn wait_for_state(ingester: &Ingester, state: NodeState, timeout: Duration) -> bool {
    let mut rx = ingester.lifecycler().subscribe_state();
    let reached = matches!(
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await,
        Ok(Ok(_))
    );
    reached
}
