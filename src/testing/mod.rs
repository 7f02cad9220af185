//! Testing utilities for ingester clusters.
//!
//! Everything runs in one process: ingesters share an
//! [`InMemoryKvStore`](crate::ring::InMemoryKvStore) for the ring, reach each
//! other through a [`LocalNetwork`](crate::transfer::LocalNetwork), and flush
//! into one [`InMemorySink`](crate::flush::InMemorySink).
//!
//! ```text
//! ┌──────────────────────── TestCluster ────────────────────────┐
//! │  kv: InMemoryKvStore   network: LocalNetwork   sink: InMem  │
//! │        ▲                    ▲    ▲                  ▲       │
//! │        │        ┌───────────┘    └──────────┐       │       │
//! │   ┌────┴────────┴──┐                   ┌────┴───────┴──┐    │
//! │   │  Ingester ing-1 │ ── transfer ──►  │ Ingester ing-2 │    │
//! │   └─────────────────┘                  └────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = TestCluster::new();
//! let ing = cluster.ingester(cluster.config("ing-1"))?;
//! ing.start().await?;
//! assert!(wait_for_state(&ing, NodeState::Active, Duration::from_secs(5)).await);
//! ```

mod transfer_tests;
mod utils;

pub use utils::{wait_for, wait_for_state, TestCluster};
