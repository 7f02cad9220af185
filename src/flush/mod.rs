//! Flushing in-memory chunks to durable storage.
//!
//! ```text
//!   ChunkStore ──drain──► Flusher ──write──► ChunkSink
//!        ▲                   │
//!        └────restore────────┘  (on failure)
//! ```
//!
//! The periodic sweep flushes chunks that went idle or hit their age limit;
//! a shutdown flush also takes the open heads.

mod flusher;
mod sink;

pub use flusher::{FlushHook, FlushReason, FlushStats, Flusher};
pub use sink::{ChunkSink, InMemorySink, SinkWrite};
