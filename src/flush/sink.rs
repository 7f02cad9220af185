//! Durable chunk storage seam and an in-memory implementation.

use crate::chunk::Chunk;
use crate::error::{FlushError, Result};
use crate::types::{Labels, Sample, TenantId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Durable storage for flushed chunks.
///
/// Writes must be idempotent: a retried flush may write the same chunk twice.
#[async_trait]
pub trait ChunkSink: Send + Sync + std::fmt::Debug {
    /// Persist the chunks of one series.
    async fn write(&self, tenant: &str, labels: &Labels, chunks: &[Chunk]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoredChunkKey {
    tenant: TenantId,
    labels: Labels,
    first_ms: i64,
    last_ms: i64,
}

/// One accepted write call.
#[derive(Debug, Clone)]
pub struct SinkWrite {
    /// Tenant written.
    pub tenant: TenantId,
    /// Series written.
    pub labels: Labels,
    /// Number of chunks in the call.
    pub chunks: usize,
    /// When the write was accepted.
    pub at: Instant,
}

/// In-memory sink keyed by `(tenant, labels, first_ms, last_ms)`, with
/// failure injection for tests.
#[derive(Debug, Default)]
pub struct InMemorySink {
    chunks: DashMap<StoredChunkKey, Chunk>,
    writes: Mutex<Vec<SinkWrite>>,
    /// Remaining failures per tenant; `usize::MAX` fails forever.
    failures: RwLock<HashMap<TenantId, usize>>,
    write_delay: RwLock<Option<Duration>>,
}

impl InMemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` writes for `tenant`.
    pub fn fail_tenant(&self, tenant: &str, times: usize) {
        self.failures.write().insert(tenant.to_string(), times);
    }

    /// Fail every write for `tenant`.
    pub fn fail_tenant_always(&self, tenant: &str) {
        self.fail_tenant(tenant, usize::MAX);
    }

    /// Delay every write.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.write() = delay;
    }

    fn take_failure(&self, tenant: &str) -> bool {
        let mut failures = self.failures.write();
        match failures.get_mut(tenant) {
            Some(0) | None => false,
            Some(n) if *n == usize::MAX => true,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    /// Number of distinct stored chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Accepted write calls, oldest first.
    pub fn writes(&self) -> Vec<SinkWrite> {
        self.writes.lock().clone()
    }

    /// Time of the first accepted write.
    pub fn first_write_at(&self) -> Option<Instant> {
        self.writes.lock().first().map(|w| w.at)
    }

    /// All stored samples of one series, in timestamp order.
    pub fn samples(&self, tenant: &str, labels: &Labels) -> Vec<Sample> {
        let mut chunks: Vec<(i64, Chunk)> = self
            .chunks
            .iter()
            .filter(|e| e.key().tenant == tenant && &e.key().labels == labels)
            .map(|e| (e.key().first_ms, e.value().clone()))
            .collect();
        chunks.sort_by_key(|(first, _)| *first);
        chunks
            .into_iter()
            .flat_map(|(_, c)| c.samples().to_vec())
            .collect()
    }

    /// Tenants with stored chunks, sorted.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.chunks.iter().map(|e| e.key().tenant.clone()).collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }
}

#[async_trait]
impl ChunkSink for InMemorySink {
    async fn write(&self, tenant: &str, labels: &Labels, chunks: &[Chunk]) -> Result<()> {
        let delay = *self.write_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure(tenant) {
            return Err(FlushError::Sink(format!("injected failure for tenant {tenant}")).into());
        }
        for chunk in chunks {
            let (Some(first_ms), Some(last_ms)) = (chunk.first_ms(), chunk.last_ms()) else {
                continue;
            };
            let key = StoredChunkKey {
                tenant: tenant.to_string(),
                labels: labels.clone(),
                first_ms,
                last_ms,
            };
            self.chunks.insert(key, chunk.clone());
        }
        self.writes.lock().push(SinkWrite {
            tenant: tenant.to_string(),
            labels: labels.clone(),
            chunks: chunks.len(),
            at: Instant::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ts: &[i64]) -> Chunk {
        Chunk::from_samples(ts.iter().map(|t| Sample::new(*t, *t as f64)).collect())
    }

    #[tokio::test]
    async fn test_writes_are_idempotent() {
        let sink = InMemorySink::new();
        let foo = Labels::metric("foo");
        sink.write("t1", &foo, &[chunk(&[1, 2]), chunk(&[3])]).await.unwrap();
        sink.write("t1", &foo, &[chunk(&[1, 2])]).await.unwrap();

        assert_eq!(sink.chunk_count(), 2);
        assert_eq!(sink.writes().len(), 2);
        let ts: Vec<i64> = sink.samples("t1", &foo).iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(ts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let sink = InMemorySink::new();
        let foo = Labels::metric("foo");
        sink.fail_tenant("t1", 1);
        sink.fail_tenant_always("t2");

        assert!(sink.write("t1", &foo, &[chunk(&[1])]).await.is_err());
        assert!(sink.write("t1", &foo, &[chunk(&[1])]).await.is_ok());
        assert!(sink.write("t2", &foo, &[chunk(&[1])]).await.is_err());
        assert!(sink.write("t2", &foo, &[chunk(&[1])]).await.is_err());
        assert_eq!(sink.tenants(), vec!["t1".to_string()]);
    }
}
