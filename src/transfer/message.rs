//! Messages exchanged on a transfer stream.

use crate::chunk::Chunk;
use crate::error::{Result, TransferError};
use crate::types::{Labels, TenantId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An encoded chunk with its time bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChunk {
    /// Timestamp of the first sample.
    pub first_ms: i64,
    /// Timestamp of the last sample.
    pub last_ms: i64,
    /// Blob produced by [`Chunk::encode`].
    pub data: Bytes,
}

impl WireChunk {
    /// Encode a chunk. Empty chunks have no wire form.
    pub fn from_chunk(chunk: &Chunk) -> Option<Self> {
        Some(Self {
            first_ms: chunk.first_ms()?,
            last_ms: chunk.last_ms()?,
            data: chunk.encode(),
        })
    }

    /// Decode the blob and check it against the advertised bounds.
    pub fn decode(&self) -> Result<Chunk> {
        let chunk = Chunk::decode(&self.data)?;
        if chunk.first_ms() != Some(self.first_ms) || chunk.last_ms() != Some(self.last_ms) {
            return Err(TransferError::Protocol(format!(
                "chunk bounds [{}, {}] do not match its samples",
                self.first_ms, self.last_ms
            ))
            .into());
        }
        Ok(chunk)
    }
}

/// All chunks of one series, sent as one stream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesChunk {
    /// Instance id of the sender.
    pub from_instance_id: String,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Series labels.
    pub labels: Labels,
    /// Chunks, oldest first.
    pub chunks: Vec<WireChunk>,
}

impl TimeSeriesChunk {
    /// Build a message from in-memory chunks.
    pub fn new(
        from_instance_id: impl Into<String>,
        tenant: impl Into<TenantId>,
        labels: Labels,
        chunks: &[Chunk],
    ) -> Self {
        Self {
            from_instance_id: from_instance_id.into(),
            tenant: tenant.into(),
            labels,
            chunks: chunks.iter().filter_map(WireChunk::from_chunk).collect(),
        }
    }

    /// Check the message shape without decoding chunk data.
    pub fn validate(&self) -> Result<()> {
        let problem = if self.from_instance_id.is_empty() {
            "missing sender instance id"
        } else if self.tenant.is_empty() {
            "missing tenant"
        } else if self.labels.is_empty() {
            "series without labels"
        } else if self.chunks.is_empty() {
            "series without chunks"
        } else {
            return Ok(());
        };
        Err(TransferError::Protocol(problem.to_string()).into())
    }

    /// Decode all chunks, requiring them to be ordered and non-overlapping.
    pub fn decode_chunks(&self) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(self.chunks.len());
        let mut prev_last: Option<i64> = None;
        for wire in &self.chunks {
            if wire.first_ms > wire.last_ms {
                return Err(TransferError::Protocol("chunk ends before it starts".into()).into());
            }
            if let Some(prev) = prev_last {
                if wire.first_ms <= prev {
                    return Err(TransferError::Protocol(format!(
                        "chunks of {} overlap or are out of order",
                        self.labels
                    ))
                    .into());
                }
            }
            prev_last = Some(wire.last_ms);
            chunks.push(wire.decode()?);
        }
        Ok(chunks)
    }
}

/// Acknowledgement of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChunksResponse {
    /// Number of series installed by the receiver.
    pub series_received: usize,
}

/// What the receiver answers: an acknowledgement or an error message.
pub type TransferResult = std::result::Result<TransferChunksResponse, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::Sample;

    fn chunk(ts: &[i64]) -> Chunk {
        Chunk::from_samples(ts.iter().map(|t| Sample::new(*t, 1.0)).collect())
    }

    #[test]
    fn test_message_decodes() {
        let msg = TimeSeriesChunk::new(
            "ing-1",
            "t1",
            Labels::metric("foo"),
            &[chunk(&[1, 2]), Chunk::new(), chunk(&[5])],
        );
        assert_eq!(msg.chunks.len(), 2);
        msg.validate().unwrap();
        let chunks = msg.decode_chunks().unwrap();
        assert_eq!(chunks[1].first_ms(), Some(5));
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let mut msg = TimeSeriesChunk::new("ing-1", "", Labels::metric("foo"), &[chunk(&[1])]);
        assert!(matches!(
            msg.validate(),
            Err(Error::Transfer(TransferError::Protocol(_)))
        ));
        msg.tenant = "t1".into();
        msg.chunks.clear();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_overlapping_chunks_rejected() {
        let msg = TimeSeriesChunk::new(
            "ing-1",
            "t1",
            Labels::metric("foo"),
            &[chunk(&[1, 5]), chunk(&[5, 6])],
        );
        assert!(msg.decode_chunks().is_err());
    }

    #[test]
    fn test_bounds_must_match_blob() {
        let mut wire = WireChunk::from_chunk(&chunk(&[1, 2])).unwrap();
        wire.last_ms = 3;
        assert!(wire.decode().is_err());
    }
}
