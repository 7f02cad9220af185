//! One in-memory series: closed chunks followed by at most one open head.

use super::encoding::Chunk;
use crate::config::{ChunkConfig, OutOfOrderPolicy};
use crate::error::{Error, Result};
use crate::types::{Labels, Sample, TimeRange};
use std::time::{Duration, Instant};

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The sample was stored.
    Appended,
    /// An identical sample was already stored; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone)]
struct ChunkDesc {
    chunk: Chunk,
    closed: bool,
    last_update: Instant,
}

impl ChunkDesc {
    fn open(now: Instant) -> Self {
        Self {
            chunk: Chunk::new(),
            closed: false,
            last_update: now,
        }
    }

    fn closed(chunk: Chunk, now: Instant) -> Self {
        Self {
            chunk,
            closed: true,
            last_update: now,
        }
    }

    fn is_full(&self, config: &ChunkConfig) -> bool {
        if self.chunk.len() >= config.max_samples_per_chunk {
            return true;
        }
        match (self.chunk.first_ms(), self.chunk.last_ms()) {
            (Some(first), Some(last)) => {
                (last - first) as u128 >= config.max_chunk_age.as_millis()
            }
            _ => false,
        }
    }
}

/// Chunks of one series.
#[derive(Debug, Clone)]
pub struct MemorySeries {
    labels: Labels,
    chunks: Vec<ChunkDesc>,
}

impl MemorySeries {
    /// Create an empty series.
    pub fn new(labels: Labels) -> Self {
        Self {
            labels,
            chunks: Vec::new(),
        }
    }

    /// Rebuild a series from transferred chunks. The last chunk becomes the
    /// open head.
    pub fn from_chunks(labels: Labels, chunks: Vec<Chunk>, now: Instant) -> Self {
        let mut descs: Vec<ChunkDesc> = chunks
            .into_iter()
            .filter(|c| !c.is_empty())
            .map(|c| ChunkDesc::closed(c, now))
            .collect();
        if let Some(head) = descs.last_mut() {
            head.closed = false;
        }
        Self {
            labels,
            chunks: descs,
        }
    }

    /// Series labels.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Whether the series holds no samples.
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.chunk.is_empty())
    }

    /// Number of chunks, head included.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of closed chunks.
    pub fn closed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.closed).count()
    }

    fn last_sample(&self) -> Option<Sample> {
        self.chunks.iter().rev().find_map(|c| c.chunk.last().copied())
    }

    fn head_mut(&mut self) -> Option<&mut ChunkDesc> {
        self.chunks.last_mut().filter(|c| !c.closed)
    }

    fn out_of_order(&self, sample: &Sample, last: &Sample) -> Error {
        Error::OutOfOrder {
            series: self.labels.to_string(),
            timestamp_ms: sample.timestamp_ms,
            last_timestamp_ms: last.timestamp_ms,
        }
    }

    /// Append a sample to the head, sealing a full head first.
    pub fn append(
        &mut self,
        sample: Sample,
        config: &ChunkConfig,
        now: Instant,
    ) -> Result<AppendOutcome> {
        if let Some(last) = self.last_sample() {
            if sample.same_as(&last) {
                return Ok(AppendOutcome::Duplicate);
            }
            if sample.timestamp_ms <= last.timestamp_ms {
                return self.append_out_of_order(sample, last, config, now);
            }
        }

        if let Some(head) = self.head_mut() {
            if head.is_full(config) {
                head.closed = true;
            }
        }
        if self.head_mut().is_none() {
            self.chunks.push(ChunkDesc::open(now));
        }
        if let Some(head) = self.head_mut() {
            head.chunk.push(sample);
            head.last_update = now;
        }
        Ok(AppendOutcome::Appended)
    }

    fn append_out_of_order(
        &mut self,
        sample: Sample,
        last: Sample,
        config: &ChunkConfig,
        now: Instant,
    ) -> Result<AppendOutcome> {
        if config.out_of_order == OutOfOrderPolicy::Reject {
            return Err(self.out_of_order(&sample, &last));
        }
        let err = self.out_of_order(&sample, &last);
        let head = match self.head_mut() {
            Some(head) => head,
            None => return Err(err),
        };
        match head.chunk.first_ms() {
            Some(first) if sample.timestamp_ms >= first => {}
            _ => return Err(err),
        }
        match head.chunk.insert_sorted(sample) {
            Ok(()) => {
                head.last_update = now;
                Ok(AppendOutcome::Appended)
            }
            Err(existing) if existing.same_as(&sample) => Ok(AppendOutcome::Duplicate),
            Err(_) => Err(err),
        }
    }

    /// Seal the head if idle for at least `idle` or past its bounds.
    /// Returns whether the head was sealed.
    pub fn close_idle(&mut self, now: Instant, idle: Duration, config: &ChunkConfig) -> bool {
        match self.head_mut() {
            Some(head) if !head.chunk.is_empty() => {
                if now.saturating_duration_since(head.last_update) >= idle || head.is_full(config)
                {
                    head.closed = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Samples within the range, in timestamp order.
    pub fn samples_in(&self, range: &TimeRange) -> Vec<Sample> {
        self.chunks
            .iter()
            .filter(|c| match (c.chunk.first_ms(), c.chunk.last_ms()) {
                (Some(first), Some(last)) => range.overlaps(first, last),
                _ => false,
            })
            .flat_map(|c| c.chunk.samples().iter())
            .filter(|s| range.contains(s.timestamp_ms))
            .copied()
            .collect()
    }

    /// Copy of every non-empty chunk, head included.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks
            .iter()
            .filter(|c| !c.chunk.is_empty())
            .map(|c| c.chunk.clone())
            .collect()
    }

    /// Remove and return closed chunks, sealing the head first when forced.
    pub fn drain(&mut self, force_head: bool) -> Vec<Chunk> {
        if force_head {
            if let Some(head) = self.head_mut() {
                head.closed = true;
            }
        }
        let split = self
            .chunks
            .iter()
            .position(|c| !c.closed)
            .unwrap_or(self.chunks.len());
        self.chunks
            .drain(..split)
            .map(|c| c.chunk)
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// Put chunks of a failed flush back ahead of newer chunks.
    pub fn restore(&mut self, chunks: Vec<Chunk>, now: Instant) {
        let restored: Vec<ChunkDesc> = chunks
            .into_iter()
            .map(|c| ChunkDesc::closed(c, now))
            .collect();
        self.chunks.splice(0..0, restored);
    }
}
