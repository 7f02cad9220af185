//! Chunk blob format.
//!
//! ```text
//! ┌────────┬─────────┬───────┬──────────────────────────────┬────────┐
//! │ "ICHK" │ version │ count │ count × (i64 ts, f64 bits)   │ crc32c │
//! │ 4B     │ u32 LE  │ u32 LE│ 16B each, little-endian      │ u32 LE │
//! └────────┴─────────┴───────┴──────────────────────────────┴────────┘
//! ```
//!
//! The checksum covers everything before the trailer. Samples are stored
//! raw; there is no compression.

use crate::error::EncodingError;
use crate::types::Sample;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};

const MAGIC: &[u8; 4] = b"ICHK";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 12;
const SAMPLE_LEN: usize = 16;
const TRAILER_LEN: usize = 4;

static CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// An ordered run of samples of one series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    samples: Vec<Sample>,
}

impl Chunk {
    /// Create an empty chunk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chunk from samples. Callers must pass them in timestamp order.
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Samples in timestamp order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the chunk has no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Timestamp of the first sample.
    pub fn first_ms(&self) -> Option<i64> {
        self.samples.first().map(|s| s.timestamp_ms)
    }

    /// Timestamp of the last sample.
    pub fn last_ms(&self) -> Option<i64> {
        self.samples.last().map(|s| s.timestamp_ms)
    }

    /// Last sample.
    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub(crate) fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Insert at the sorted position. Returns the existing sample if the
    /// timestamp is already present.
    pub(crate) fn insert_sorted(&mut self, sample: Sample) -> Result<(), Sample> {
        match self
            .samples
            .binary_search_by(|s| s.timestamp_ms.cmp(&sample.timestamp_ms))
        {
            Ok(i) => Err(self.samples[i]),
            Err(i) => {
                self.samples.insert(i, sample);
                Ok(())
            }
        }
    }

    /// Serialize to a blob.
    pub fn encode(&self) -> Bytes {
        let len = HEADER_LEN + self.samples.len() * SAMPLE_LEN + TRAILER_LEN;
        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(MAGIC);
        buf.put_u32_le(VERSION);
        buf.put_u32_le(self.samples.len() as u32);
        for sample in &self.samples {
            buf.put_i64_le(sample.timestamp_ms);
            buf.put_u64_le(sample.value.to_bits());
        }
        let checksum = CASTAGNOLI.checksum(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    /// Deserialize a blob produced by [`Chunk::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        if data.len() < HEADER_LEN + TRAILER_LEN {
            return Err(EncodingError::Truncated {
                expected: HEADER_LEN + TRAILER_LEN,
                actual: data.len(),
            });
        }
        if &data[..4] != MAGIC {
            return Err(EncodingError::BadMagic);
        }

        let mut header = &data[4..HEADER_LEN];
        let version = header.get_u32_le();
        if version != VERSION {
            return Err(EncodingError::UnsupportedVersion(version));
        }
        let count = header.get_u32_le() as usize;

        let expected = HEADER_LEN + count * SAMPLE_LEN + TRAILER_LEN;
        if data.len() != expected {
            return Err(EncodingError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        let body_end = expected - TRAILER_LEN;
        let stored = (&data[body_end..]).get_u32_le();
        let computed = CASTAGNOLI.checksum(&data[..body_end]);
        if stored != computed {
            return Err(EncodingError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let mut body = &data[HEADER_LEN..body_end];
        let mut samples: Vec<Sample> = Vec::with_capacity(count);
        for i in 0..count {
            let timestamp_ms = body.get_i64_le();
            let value = f64::from_bits(body.get_u64_le());
            if let Some(prev) = samples.last() {
                if timestamp_ms <= prev.timestamp_ms {
                    return Err(EncodingError::Unordered(i));
                }
            }
            samples.push(Sample::new(timestamp_ms, value));
        }
        Ok(Self { samples })
    }
}
