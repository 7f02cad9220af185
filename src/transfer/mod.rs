//! Chunk handoff between ingesters.
//!
//! ```text
//!   leaving node                               pending node
//!  ┌────────────────┐   TimeSeriesChunk ×N   ┌────────────────┐
//!  │ChunkTransferer │ ─────────────────────► │ ChunkReceiver  │
//!  │ snapshot_all() │ ◄───────────────────── │ stage, install │
//!  └────────────────┘ TransferChunksResponse └────────────────┘
//! ```
//!
//! The sender only clears its store after the receiver acknowledged; the
//! receiver only exposes the data after the sender closed the stream.

mod local;
mod message;
mod receiver;
mod sender;
mod stream;

pub use local::{LocalIngesterClient, LocalNetwork};
pub use message::{TimeSeriesChunk, TransferChunksResponse, TransferResult, WireChunk};
pub use receiver::ChunkReceiver;
pub use sender::{ChunkTransferer, TransferOutcome};
pub use stream::{
    channel_stream, ChannelReceiver, ChannelSender, ClientFactory, IngesterClient,
    TransferContext, TransferReceiver, TransferSender,
};
