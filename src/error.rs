//! Error types for the ingester.

use crate::ring::NodeState;
use thiserror::Error;

/// Result type alias for ingester operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the ingester.
#[derive(Error, Debug)]
pub enum Error {
    /// A sample was not newer than the last sample of its series.
    #[error("out of order sample for series {series}: timestamp {timestamp_ms} is not after {last_timestamp_ms}")]
    OutOfOrder {
        series: String,
        timestamp_ms: i64,
        last_timestamp_ms: i64,
    },

    /// The node is not in a state that can serve the request.
    #[error("ingester unavailable: state is {state}")]
    Unavailable { state: NodeState },

    /// Creating a new series would exceed the tenant's series limit.
    #[error("series limit exceeded for tenant {tenant}: limit is {limit}")]
    SeriesLimitExceeded { tenant: String, limit: usize },

    /// A push request carried more samples than the tenant allows.
    #[error("push too large for tenant {tenant}: {samples} samples, limit is {limit}")]
    PushTooLarge {
        tenant: String,
        samples: usize,
        limit: usize,
    },

    /// Chunk handoff errors.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Durable storage flush errors.
    #[error("flush failed: {0}")]
    Flush(#[from] FlushError),

    /// Ring membership errors.
    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    /// Chunk blob decoding errors.
    #[error("chunk encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A lifecycle event is not valid in the current state.
    #[error("invalid lifecycle transition from {from} on {event}")]
    InvalidTransition { from: NodeState, event: String },

    /// Outcome of an earlier, failed disposition of the same leaving episode.
    #[error("disposition failed: {0}")]
    Disposition(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization errors.
    #[error("codec error: {0}")]
    Codec(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Chunk handoff errors.
#[derive(Error, Debug)]
pub enum TransferError {
    /// No peer in a state that can accept a transfer was found.
    #[error("no pending peer found to transfer to")]
    NoPeer,

    /// The peer could not be reached.
    #[error("peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: String, reason: String },

    /// A message violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The stream was closed before any series was sent.
    #[error("transfer closed without any series")]
    EmptyTransfer,

    /// The receiver already holds data for a transferred series.
    #[error("receiver already holds data for series {series} of tenant {tenant}")]
    AlreadyPopulated { tenant: String, series: String },

    /// The receiver is not in a state that accepts a transfer.
    #[error("receiver not pending: state is {state}")]
    NotPending { state: NodeState },

    /// The remote side answered with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// The stream closed unexpectedly.
    #[error("transfer stream closed")]
    StreamClosed,

    /// The stream was idle for too long.
    #[error("transfer stream timed out")]
    Timeout,

    /// All transfer attempts failed.
    #[error("transfer failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

/// Durable storage flush errors.
#[derive(Error, Debug)]
pub enum FlushError {
    /// The sink rejected a write.
    #[error("sink write failed: {0}")]
    Sink(String),

    /// A tenant flush attempt did not complete in time.
    #[error("flush of tenant {tenant} timed out")]
    Timeout { tenant: String },

    /// One or more tenants still failed after all retries.
    #[error("flush failed for tenants {tenants:?}: {last_error}")]
    Exhausted {
        tenants: Vec<String>,
        last_error: String,
    },
}

/// Ring membership errors.
#[derive(Error, Debug)]
pub enum RingError {
    /// Compare-and-swap kept losing against concurrent writers.
    #[error("compare-and-swap conflict on {key} after {attempts} attempts")]
    Conflict { key: String, attempts: usize },

    /// The instance has no record in the ring.
    #[error("instance not found in ring: {0}")]
    InstanceNotFound(String),

    /// The backing store failed.
    #[error("ring store error: {0}")]
    Store(String),
}

/// Chunk blob decoding errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodingError {
    /// The blob does not start with the chunk magic.
    #[error("bad chunk magic")]
    BadMagic,

    /// The blob was written by an unknown format version.
    #[error("unsupported chunk version {0}")]
    UnsupportedVersion(u32),

    /// The blob is shorter than its header claims.
    #[error("chunk truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The checksum trailer does not match the content.
    #[error("chunk checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Samples in the blob are not in timestamp order.
    #[error("chunk samples out of order at index {0}")]
    Unordered(usize),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
