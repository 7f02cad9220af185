//! Ring membership client.
//!
//! Every update is a read-modify-write of the whole [`RingDesc`] guarded by
//! compare-and-swap. A lost race re-reads the ring and re-applies the change;
//! after `max_cas_retries` losses the update fails with
//! [`RingError::Conflict`].

use super::desc::{InstanceDesc, NodeState, RingDesc};
use super::kv::{CasResult, KvStore};
use super::tokens::generate_tokens;
use crate::error::{Error, Result, RingError};
use crate::metrics::IngesterMetrics;
use crate::types::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Client for reading and updating the ring.
#[derive(Debug, Clone)]
pub struct RingClient {
    kv: Arc<dyn KvStore>,
    key: String,
    max_cas_retries: usize,
    metrics: Arc<IngesterMetrics>,
}

impl RingClient {
    /// Create a client for the ring stored under `key`.
    pub fn new(
        kv: Arc<dyn KvStore>,
        key: impl Into<String>,
        max_cas_retries: usize,
        metrics: Arc<IngesterMetrics>,
    ) -> Self {
        Self {
            kv,
            key: key.into(),
            max_cas_retries: max_cas_retries.max(1),
            metrics,
        }
    }

    /// Ring key in the store.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the current ring.
    pub async fn desc(&self) -> Result<RingDesc> {
        match self.kv.get(&self.key).await? {
            Some(v) => RingDesc::decode(&v.value),
            None => Ok(RingDesc::new()),
        }
    }

    /// Look up one instance.
    pub async fn instance(&self, instance_id: &str) -> Result<Option<InstanceDesc>> {
        Ok(self.desc().await?.get(instance_id).cloned())
    }

    /// Total tokens in the ring.
    pub async fn token_count(&self) -> Result<usize> {
        Ok(self.desc().await?.token_count())
    }

    /// Apply `f` to the ring under compare-and-swap.
    async fn update<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut RingDesc) -> Result<T> + Send,
        T: Send,
    {
        for attempt in 1..=self.max_cas_retries {
            let current = self.kv.get(&self.key).await?;
            let (mut desc, version) = match &current {
                Some(v) => (RingDesc::decode(&v.value)?, Some(v.version)),
                None => (RingDesc::new(), None),
            };
            let out = f(&mut desc)?;
            match self
                .kv
                .compare_and_swap(&self.key, version, desc.encode()?)
                .await?
            {
                CasResult::Swapped { .. } => return Ok(out),
                CasResult::Conflict { .. } => {
                    self.metrics.ring_cas_conflicts.inc();
                    debug!(key = %self.key, attempt, "ring CAS conflict, retrying");
                }
            }
        }
        warn!(key = %self.key, attempts = self.max_cas_retries, "ring CAS retries exhausted");
        Err(RingError::Conflict {
            key: self.key.clone(),
            attempts: self.max_cas_retries,
        }
        .into())
    }

    /// Register the instance. An existing record keeps its tokens; a record
    /// without tokens is reset to `Pending`.
    pub async fn register(&self, instance_id: &str, addr: &str) -> Result<InstanceDesc> {
        self.update(|desc| {
            let now = now_ms();
            let record = desc
                .instances
                .entry(instance_id.to_string())
                .or_insert_with(|| InstanceDesc::new(addr, NodeState::Pending, now));
            record.addr = addr.to_string();
            record.heartbeat_ms = now;
            if record.tokens.is_empty() {
                record.state = NodeState::Pending;
            }
            Ok(record.clone())
        })
        .await
    }

    /// Give the instance `n` fresh tokens (kept if it already owns some)
    /// and publish `state`.
    pub async fn claim_tokens(
        &self,
        instance_id: &str,
        n: usize,
        state: NodeState,
    ) -> Result<Vec<u32>> {
        self.update(|desc| {
            let taken = desc.taken_tokens();
            let record = desc
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| RingError::InstanceNotFound(instance_id.to_string()))?;
            if record.tokens.is_empty() {
                record.tokens = generate_tokens(n, &taken);
            }
            record.state = state;
            record.heartbeat_ms = now_ms();
            Ok(record.tokens.clone())
        })
        .await
    }

    /// Move the tokens of `from` to `to` and mark `to` active.
    pub async fn claim_tokens_from(&self, to: &str, from: &str) -> Result<Vec<u32>> {
        self.update(|desc| {
            let tokens = desc
                .instances
                .get_mut(from)
                .map(|r| std::mem::take(&mut r.tokens))
                .unwrap_or_default();
            let record = desc
                .instances
                .get_mut(to)
                .ok_or_else(|| RingError::InstanceNotFound(to.to_string()))?;
            record.tokens.extend(tokens);
            record.tokens.sort_unstable();
            record.tokens.dedup();
            record.state = NodeState::Active;
            record.heartbeat_ms = now_ms();
            Ok(record.tokens.clone())
        })
        .await
    }

    /// Publish a new state for the instance.
    pub async fn update_state(&self, instance_id: &str, state: NodeState) -> Result<()> {
        self.update(|desc| {
            let record = desc
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| RingError::InstanceNotFound(instance_id.to_string()))?;
            record.state = state;
            record.heartbeat_ms = now_ms();
            Ok(())
        })
        .await
    }

    /// Refresh the heartbeat timestamp.
    pub async fn heartbeat(&self, instance_id: &str) -> Result<()> {
        self.update(|desc| {
            let record = desc
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| RingError::InstanceNotFound(instance_id.to_string()))?;
            record.heartbeat_ms = now_ms();
            Ok(())
        })
        .await
    }

    /// Remove the instance's record.
    pub async fn deregister(&self, instance_id: &str) -> Result<()> {
        self.update(|desc| {
            desc.instances.remove(instance_id);
            Ok(())
        })
        .await
    }

    /// Find a healthy `Pending` instance other than `exclude`, waiting up to
    /// `wait` for one to appear.
    pub async fn find_pending_peer(
        &self,
        exclude: &str,
        heartbeat_timeout: Duration,
        wait: Duration,
    ) -> Result<Option<(String, InstanceDesc)>> {
        let mut changes = self.kv.watch(&self.key);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let desc = self.desc().await?;
            if let Some(peer) = desc.find_pending_peer(exclude, now_ms(), heartbeat_timeout) {
                return Ok(Some(peer));
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(Error::Ring(RingError::Store("ring watch closed".into())))
                }
                Err(_) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::kv::InMemoryKvStore;

    fn client(kv: Arc<InMemoryKvStore>) -> RingClient {
        RingClient::new(kv, "ring", 10, Arc::new(IngesterMetrics::new()))
    }

    #[tokio::test]
    async fn test_register_and_claim() {
        let kv = Arc::new(InMemoryKvStore::new());
        let ring = client(kv);

        let record = ring.register("ing-1", "addr-1").await.unwrap();
        assert_eq!(record.state, NodeState::Pending);
        assert!(record.tokens.is_empty());

        let tokens = ring.claim_tokens("ing-1", 4, NodeState::Active).await.unwrap();
        assert_eq!(tokens.len(), 4);

        // Re-registration keeps the tokens and the claim is idempotent.
        let record = ring.register("ing-1", "addr-1").await.unwrap();
        assert_eq!(record.tokens, tokens);
        assert_eq!(
            ring.claim_tokens("ing-1", 4, NodeState::Active).await.unwrap(),
            tokens
        );
        assert_eq!(ring.token_count().await.unwrap(), 4);

        ring.deregister("ing-1").await.unwrap();
        assert!(ring.instance("ing-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_tokens_from() {
        let ring = client(Arc::new(InMemoryKvStore::new()));
        ring.register("a", "addr-a").await.unwrap();
        let tokens = ring.claim_tokens("a", 8, NodeState::Active).await.unwrap();
        ring.register("b", "addr-b").await.unwrap();

        assert_eq!(ring.claim_tokens_from("b", "a").await.unwrap(), tokens);
        let desc = ring.desc().await.unwrap();
        assert!(desc.get("a").unwrap().tokens.is_empty());
        assert_eq!(desc.get("b").unwrap().state, NodeState::Active);
        assert_eq!(desc.token_count(), 8);
    }

    #[tokio::test]
    async fn test_conflicts_retry_then_fail() {
        let kv = Arc::new(InMemoryKvStore::new());
        let ring = RingClient::new(kv.clone(), "ring", 3, Arc::new(IngesterMetrics::new()));

        kv.inject_conflicts(2);
        ring.register("a", "addr").await.unwrap();
        assert_eq!(ring.metrics.ring_cas_conflicts.get(), 2);

        kv.inject_conflicts(3);
        assert!(matches!(
            ring.heartbeat("a").await,
            Err(Error::Ring(RingError::Conflict { attempts: 3, .. }))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_registration_converges() {
        let kv = Arc::new(InMemoryKvStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let ring = client(kv.clone());
            handles.push(tokio::spawn(async move {
                let id = format!("ing-{i}");
                ring.register(&id, "addr").await?;
                ring.claim_tokens(&id, 16, NodeState::Active).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let desc = client(kv).desc().await.unwrap();
        assert_eq!(desc.instances.len(), 8);
        assert_eq!(desc.token_count(), 128);
        assert_eq!(desc.taken_tokens().len(), 128);
    }

    #[tokio::test]
    async fn test_find_pending_peer_waits_for_registration() {
        let kv = Arc::new(InMemoryKvStore::new());
        let ring = client(kv.clone());
        ring.register("leaving", "addr").await.unwrap();

        assert!(ring
            .find_pending_peer("leaving", Duration::from_secs(60), Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        let other = client(kv);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            other.register("joiner", "addr-j").await.unwrap();
        });
        let (id, record) = ring
            .find_pending_peer("leaving", Duration::from_secs(60), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "joiner");
        assert_eq!(record.addr, "addr-j");
    }
}
