//! In-memory chunk storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       ChunkStore                        │
//! │  tenant ──► TenantChunks                                │
//! │               labels ──► Mutex<MemorySeries>            │
//! │                            [closed] [closed] [head]     │
//! └─────────────────────────────────────────────────────────┘
//!        │ drain_for_flush            │ snapshot_all
//!        ▼                            ▼
//!     Flusher                  transfer sender
//! ```
//!
//! Closed chunks are immutable; only the head accepts appends. Chunks are
//! serialized with [`Chunk::encode`] when they leave the node.

mod encoding;
mod series;
mod store;

pub use crate::config::OutOfOrderPolicy;
pub use encoding::Chunk;
pub use series::{AppendOutcome, MemorySeries};
pub use store::{AppendResult, ChunkStore, FlushBatch, SeriesHandle};
