//! Time-series ingester node with ring membership and chunk handoff.
//!
//! An ingester accepts samples for many tenants, keeps them in compressed
//! in-memory chunks per series, and serves queries over what it holds. Its
//! ownership of the keyspace is recorded in a shared hash ring. When the node
//! leaves, its in-memory data is either streamed to a pending replacement
//! (which takes over the ring tokens) or flushed to durable storage, and only
//! then is the ring record removed.
//!
//! # Example
//!
//! ```rust,no_run
//! use ingester::flush::InMemorySink;
//! use ingester::limits::Limits;
//! use ingester::ring::InMemoryKvStore;
//! use ingester::transfer::LocalNetwork;
//! use ingester::{Ingester, IngesterConfig, Labels, Matcher, Sample, TimeRange, TimeSeries};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IngesterConfig::new("ingester-1", "local://ingester-1")
//!         .with_join_after(Some(Duration::from_secs(1)));
//!     let network = Arc::new(LocalNetwork::new(config.transfer.stream_buffer));
//!
//!     let ingester = Ingester::new(
//!         config,
//!         Arc::new(InMemoryKvStore::new()),
//!         Arc::new(InMemorySink::new()),
//!         network.clone(),
//!         Arc::new(Limits::unlimited()),
//!     )?;
//!     network.register(ingester.addr(), ingester.downgrade());
//!     ingester.start().await?;
//!
//!     // Once active, writes are accepted.
//!     let series = TimeSeries::new(Labels::metric("foo"), vec![Sample::new(123_000, 456.0)]);
//!     ingester.push("tenant-1", vec![series])?;
//!
//!     let streams = ingester.query("tenant-1", &[Matcher::metric("foo")], TimeRange::new(0, 200_000))?;
//!     println!("{streams:?}");
//!
//!     // Transfer to a pending peer or flush, then leave the ring.
//!     ingester.shutdown_handler().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!                 push / query
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │                  Ingester                   │
//! │  • push(tenant, series) -> PushResponse     │
//! │  • query(tenant, matchers, range)           │
//! │  • transfer_chunks(stream)                  │
//! │  • shutdown_handler()                       │
//! └─────────────────────────────────────────────┘
//!        │               │                │
//!        ▼               ▼                ▼
//! ┌────────────┐  ┌─────────────┐  ┌─────────────┐
//! │ ChunkStore │  │ Lifecycler  │  │  Transfer   │
//! │ (DashMap)  │  │ ring + FSM  │  │ send / recv │
//! └────────────┘  └─────────────┘  └─────────────┘
//!        │               │                │
//!        ▼               ▼                ▼
//!    ChunkSink        KvStore       peer ingester
//! ```
//!
//! # Lifecycle
//!
//! `PENDING → JOINING → ACTIVE → LEAVING → STOPPED`. A pending node becomes
//! active either by claiming fresh tokens after `join_after`, or by
//! receiving a transfer from a leaving node and taking over its tokens.

pub mod chunk;
pub mod config;
pub mod error;
pub mod flush;
pub mod ingester;
pub mod lifecycle;
pub mod limits;
pub mod metrics;
pub mod ring;
pub mod testing;
pub mod transfer;
pub mod types;

// Re-export main types for convenience
pub use config::{ChunkConfig, FlushConfig, IngesterConfig, LifecyclerConfig, TransferConfig};
pub use error::{Error, Result};
pub use ingester::{Ingester, PushResponse, RejectReason, SampleFailure, WeakIngester};
pub use types::{
    Label, Labels, MatchType, Matcher, Sample, SampleStream, SeriesKey, TenantId, TimeRange,
    TimeSeries,
};

// Re-export membership types
pub use lifecycle::{LifecycleEvent, Lifecycler};
pub use ring::{InstanceDesc, NodeState, RingDesc};

// Re-export metrics types
pub use metrics::{Counter, Gauge, IngesterMetrics, LabeledCounter, MetricsSnapshot};
