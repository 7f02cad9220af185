//! In-process transport: ingesters in one process reach each other by
//! address through a shared [`LocalNetwork`].

use super::stream::{channel_stream, ClientFactory, IngesterClient, TransferSender};
use crate::error::{Result, TransferError};
use crate::ingester::WeakIngester;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Address book of in-process ingesters.
///
/// Entries are weak: a dropped ingester becomes unreachable rather than
/// being kept alive by the network.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    nodes: DashMap<String, WeakIngester>,
    stream_buffer: usize,
}

impl LocalNetwork {
    /// Create a network whose streams buffer `stream_buffer` messages.
    pub fn new(stream_buffer: usize) -> Self {
        Self {
            nodes: DashMap::new(),
            stream_buffer: stream_buffer.max(1),
        }
    }

    /// Make an ingester reachable at `addr`.
    pub fn register(&self, addr: impl Into<String>, ingester: WeakIngester) {
        let addr = addr.into();
        debug!(%addr, "Registered local ingester");
        self.nodes.insert(addr, ingester);
    }

    /// Remove `addr` from the network.
    pub fn unregister(&self, addr: &str) {
        self.nodes.remove(addr);
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no address is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl ClientFactory for LocalNetwork {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn IngesterClient>> {
        let target = self
            .nodes
            .get(addr)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransferError::PeerUnreachable {
                addr: addr.to_string(),
                reason: "unknown address".into(),
            })?;
        Ok(Arc::new(LocalIngesterClient {
            addr: addr.to_string(),
            target,
            stream_buffer: self.stream_buffer.max(1),
        }))
    }
}

/// Client for an ingester in the same process.
#[derive(Debug, Clone)]
pub struct LocalIngesterClient {
    addr: String,
    target: WeakIngester,
    stream_buffer: usize,
}

#[async_trait]
impl IngesterClient for LocalIngesterClient {
    async fn transfer_chunks(&self) -> Result<Box<dyn TransferSender>> {
        let ingester = self
            .target
            .upgrade()
            .ok_or_else(|| TransferError::PeerUnreachable {
                addr: self.addr.clone(),
                reason: "ingester dropped".into(),
            })?;
        let (sender, receiver) = channel_stream(self.stream_buffer);
        let addr = self.addr.clone();
        tokio::spawn(async move {
            // The outcome already went back over the stream.
            if let Err(e) = ingester.transfer_chunks(Box::new(receiver)).await {
                warn!(%addr, error = %e, "Incoming transfer rejected");
            }
        });
        Ok(Box::new(sender))
    }
}
