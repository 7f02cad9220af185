//! Per-tenant in-memory chunk store.
//!
//! Tenants and series live in sharded maps; each series sits behind its own
//! mutex so appends to different series never contend. Readers copy samples
//! out under that short lock.

use super::encoding::Chunk;
use super::series::{AppendOutcome, MemorySeries};
use crate::config::ChunkConfig;
use crate::error::{Error, Result, TransferError};
use crate::types::{Labels, Matcher, Sample, SampleStream, TenantId, TimeRange};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::time::{Duration, Instant};
use twox_hash::XxHash64;

type SeriesRef = Arc<Mutex<MemorySeries>>;

/// Series of one tenant, keyed by label set and hashed with xxHash64.
type SeriesMap = DashMap<Labels, SeriesRef, BuildHasherDefault<XxHash64>>;

#[derive(Debug, Default)]
struct TenantChunks {
    series: SeriesMap,
}

impl TenantChunks {
    /// Drop the series if it is empty and nobody else holds a handle on it.
    fn prune(&self, labels: &Labels) {
        self.series
            .remove_if(labels, |_, s| Arc::strong_count(s) == 1 && s.lock().is_empty());
    }

    fn matching(&self, matchers: &[Matcher]) -> Vec<(Labels, SeriesRef)> {
        self.series
            .iter()
            .filter(|e| matchers.iter().all(|m| m.matches(e.key())))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// Outcome of [`ChunkStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// What happened to the sample.
    pub outcome: AppendOutcome,
    /// Whether the series was created by this append.
    pub created: bool,
}

/// Chunks of one series removed for flushing.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    /// Series labels.
    pub labels: Labels,
    /// Closed chunks, oldest first.
    pub chunks: Vec<Chunk>,
}

/// Lazy handle on one series, used for streaming transfers.
#[derive(Debug, Clone)]
pub struct SeriesHandle {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Series labels.
    pub labels: Labels,
    series: SeriesRef,
}

impl SeriesHandle {
    /// Copy the series' chunks under its lock.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.series.lock().chunks()
    }
}

/// In-memory store of all tenants' series.
#[derive(Debug)]
pub struct ChunkStore {
    tenants: DashMap<TenantId, Arc<TenantChunks>>,
    config: ChunkConfig,
}

impl ChunkStore {
    /// Create an empty store.
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            tenants: DashMap::new(),
            config,
        }
    }

    /// Chunk configuration.
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    fn tenant(&self, tenant: &str) -> Option<Arc<TenantChunks>> {
        self.tenants.get(tenant).map(|t| t.value().clone())
    }

    fn tenant_or_create(&self, tenant: &str) -> Arc<TenantChunks> {
        if let Some(t) = self.tenant(tenant) {
            return t;
        }
        self.tenants
            .entry(tenant.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Append a sample, creating the series if needed.
    ///
    /// `series_limit` caps the number of series of the tenant; it only
    /// applies when the series does not exist yet.
    pub fn append(
        &self,
        tenant: &str,
        labels: &Labels,
        sample: Sample,
        series_limit: Option<usize>,
    ) -> Result<AppendResult> {
        let chunks = self.tenant_or_create(tenant);

        let existing = chunks.series.get(labels).map(|s| s.value().clone());
        let (series, created) = match existing {
            Some(series) => (series, false),
            None => {
                if let Some(limit) = series_limit {
                    if chunks.series.len() >= limit {
                        return Err(Error::SeriesLimitExceeded {
                            tenant: tenant.to_string(),
                            limit,
                        });
                    }
                }
                let mut created = false;
                let series = chunks
                    .series
                    .entry(labels.clone())
                    .or_insert_with(|| {
                        created = true;
                        Arc::new(Mutex::new(MemorySeries::new(labels.clone())))
                    })
                    .value()
                    .clone();
                (series, created)
            }
        };

        let outcome = series.lock().append(sample, &self.config, Instant::now());
        drop(series);
        match outcome {
            Ok(outcome) => Ok(AppendResult { outcome, created }),
            Err(e) => {
                if created {
                    chunks.prune(labels);
                }
                Err(e)
            }
        }
    }

    /// Seal heads idle for at least `threshold` or past their bounds.
    /// Returns the number of sealed heads.
    pub fn close_idle(&self, now: Instant, threshold: Duration) -> usize {
        let mut sealed = 0;
        for tenant in self.tenant_refs() {
            for entry in tenant.series.iter() {
                if entry.value().lock().close_idle(now, threshold, &self.config) {
                    sealed += 1;
                }
            }
        }
        sealed
    }

    /// Samples of one series within the range.
    pub fn query_series(&self, tenant: &str, labels: &Labels, range: TimeRange) -> Vec<Sample> {
        self.tenant(tenant)
            .and_then(|t| t.series.get(labels).map(|s| s.value().clone()))
            .map(|s| s.lock().samples_in(&range))
            .unwrap_or_default()
    }

    /// Samples of every series matching all matchers, sorted by labels.
    /// Series without samples in the range are omitted.
    pub fn query(&self, tenant: &str, matchers: &[Matcher], range: TimeRange) -> Vec<SampleStream> {
        let Some(chunks) = self.tenant(tenant) else {
            return Vec::new();
        };
        let mut streams: Vec<SampleStream> = chunks
            .matching(matchers)
            .into_iter()
            .filter_map(|(labels, series)| {
                let samples = series.lock().samples_in(&range);
                (!samples.is_empty()).then_some(SampleStream { labels, samples })
            })
            .collect();
        streams.sort_by(|a, b| a.labels.cmp(&b.labels));
        streams
    }

    /// Label sets of the tenant's series matching all matchers, sorted.
    pub fn series_matching(&self, tenant: &str, matchers: &[Matcher]) -> Vec<Labels> {
        let mut labels: Vec<Labels> = self
            .tenant(tenant)
            .map(|t| t.matching(matchers).into_iter().map(|(l, _)| l).collect())
            .unwrap_or_default();
        labels.sort();
        labels
    }

    /// Sorted distinct label names of the tenant's series.
    pub fn label_names(&self, tenant: &str) -> Vec<String> {
        let mut names = BTreeSet::new();
        if let Some(chunks) = self.tenant(tenant) {
            for entry in chunks.series.iter() {
                names.extend(entry.key().iter().map(|l| l.name.clone()));
            }
        }
        names.into_iter().collect()
    }

    /// Remove the tenant's closed chunks (and heads, when forced) for flushing.
    /// Series left without chunks are dropped.
    pub fn drain_for_flush(&self, tenant: &str, force_head: bool) -> Vec<FlushBatch> {
        let Some(chunks) = self.tenant(tenant) else {
            return Vec::new();
        };
        let mut batches = Vec::new();
        let mut touched = Vec::new();
        for (labels, series) in chunks.matching(&[]) {
            let drained = series.lock().drain(force_head);
            if !drained.is_empty() {
                batches.push(FlushBatch {
                    labels: labels.clone(),
                    chunks: drained,
                });
            }
            touched.push(labels);
        }
        for labels in &touched {
            chunks.prune(labels);
        }
        batches.sort_by(|a, b| a.labels.cmp(&b.labels));
        batches
    }

    /// Return drained chunks of a failed flush to the store.
    pub fn restore(&self, tenant: &str, batches: Vec<FlushBatch>) {
        let chunks = self.tenant_or_create(tenant);
        let now = Instant::now();
        for batch in batches {
            let series = chunks
                .series
                .entry(batch.labels.clone())
                .or_insert_with(|| Arc::new(Mutex::new(MemorySeries::new(batch.labels.clone()))))
                .value()
                .clone();
            series.lock().restore(batch.chunks, now);
        }
    }

    /// Cheap handles on every series. Chunk data is copied lazily.
    pub fn snapshot_all(&self) -> Vec<SeriesHandle> {
        let mut handles = Vec::new();
        for tenant in self.tenants.iter() {
            for series in tenant.value().series.iter() {
                handles.push(SeriesHandle {
                    tenant: tenant.key().clone(),
                    labels: series.key().clone(),
                    series: series.value().clone(),
                });
            }
        }
        handles
    }

    /// Whether the store holds data for the series.
    pub fn contains_series(&self, tenant: &str, labels: &Labels) -> bool {
        self.tenant(tenant)
            .and_then(|t| t.series.get(labels).map(|s| s.value().clone()))
            .is_some_and(|s| !s.lock().is_empty())
    }

    /// Install transferred chunks for a series that holds no data here.
    pub fn install_series(&self, tenant: &str, labels: Labels, chunks: Vec<Chunk>) -> Result<()> {
        let tenant_chunks = self.tenant_or_create(tenant);
        let series = MemorySeries::from_chunks(labels.clone(), chunks, Instant::now());
        match tenant_chunks.series.entry(labels) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if !entry.get().lock().is_empty() {
                    return Err(TransferError::AlreadyPopulated {
                        tenant: tenant.to_string(),
                        series: entry.key().to_string(),
                    }
                    .into());
                }
                entry.insert(Arc::new(Mutex::new(series)));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(series)));
            }
        }
        Ok(())
    }

    /// Drop one series.
    pub fn remove_series(&self, tenant: &str, labels: &Labels) {
        if let Some(chunks) = self.tenant(tenant) {
            chunks.series.remove(labels);
        }
    }

    /// Remove and return every series' chunks.
    pub fn take_all(&self) -> Vec<(TenantId, FlushBatch)> {
        let handles = self.snapshot_all();
        self.clear();
        handles
            .into_iter()
            .map(|h| {
                let chunks = h.chunks();
                (
                    h.tenant,
                    FlushBatch {
                        labels: h.labels,
                        chunks,
                    },
                )
            })
            .collect()
    }

    /// Drop all data.
    pub fn clear(&self) {
        self.tenants.clear();
    }

    /// Number of series across all tenants.
    pub fn series_count(&self) -> usize {
        self.tenants.iter().map(|t| t.value().series.len()).sum()
    }

    /// Tenants with at least one series, sorted.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .tenants
            .iter()
            .filter(|t| !t.value().series.is_empty())
            .map(|t| t.key().clone())
            .collect();
        tenants.sort();
        tenants
    }

    /// Whether the store holds no samples.
    pub fn is_empty(&self) -> bool {
        self.tenant_refs()
            .iter()
            .all(|t| t.series.iter().all(|s| s.value().lock().is_empty()))
    }

    fn tenant_refs(&self) -> Vec<Arc<TenantChunks>> {
        self.tenants.iter().map(|t| t.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ChunkStore {
        ChunkStore::new(ChunkConfig::default())
    }

    fn labels(name: &str, job: &str) -> Labels {
        Labels::from_pairs([("__name__", name), ("job", job)])
    }

    #[test]
    fn test_append_and_query() {
        let store = store();
        let foo = labels("foo", "a");
        let r = store.append("t1", &foo, Sample::new(123_000, 456.0), None).unwrap();
        assert!(r.created);
        assert_eq!(r.outcome, AppendOutcome::Appended);

        let r = store.append("t1", &foo, Sample::new(123_000, 456.0), None).unwrap();
        assert!(!r.created);
        assert_eq!(r.outcome, AppendOutcome::Duplicate);

        store.append("t1", &labels("bar", "a"), Sample::new(1, 1.0), None).unwrap();
        store.append("t2", &foo, Sample::new(1, 1.0), None).unwrap();

        let streams = store.query("t1", &[Matcher::metric("foo")], TimeRange::new(0, 200_000));
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].samples, vec![Sample::new(123_000, 456.0)]);

        let all = store.query("t1", &[Matcher::equal("job", "a")], TimeRange::all());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].labels.metric_name(), Some("bar"));

        assert!(store.query("t1", &[Matcher::metric("foo")], TimeRange::new(0, 1000)).is_empty());
        assert_eq!(store.series_count(), 3);
        assert_eq!(store.tenants(), vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(store.label_names("t1"), vec!["__name__".to_string(), "job".to_string()]);
    }

    #[test]
    fn test_series_limit() {
        let store = store();
        store.append("t1", &labels("a", "x"), Sample::new(1, 1.0), Some(1)).unwrap();
        store.append("t1", &labels("a", "x"), Sample::new(2, 1.0), Some(1)).unwrap();
        assert!(matches!(
            store.append("t1", &labels("b", "x"), Sample::new(1, 1.0), Some(1)),
            Err(Error::SeriesLimitExceeded { limit: 1, .. })
        ));
        assert_eq!(store.series_matching("t1", &[]), vec![labels("a", "x")]);
    }

    #[test]
    fn test_drained_series_are_dropped() {
        let store = store();
        let foo = labels("foo", "a");
        store.append("t1", &foo, Sample::new(10, 1.0), None).unwrap();
        store.drain_for_flush("t1", true);
        assert_eq!(store.series_count(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_drain_and_restore() {
        let store = store();
        let foo = labels("foo", "a");
        store.append("t1", &foo, Sample::new(1, 1.0), None).unwrap();

        assert!(store.drain_for_flush("t1", false).is_empty());
        assert_eq!(store.close_idle(Instant::now() + Duration::from_secs(3600), Duration::from_secs(60)), 1);
        store.append("t1", &foo, Sample::new(2, 2.0), None).unwrap();

        let batches = store.drain_for_flush("t1", false);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].chunks[0].samples(), &[Sample::new(1, 1.0)]);

        store.restore("t1", batches);
        let samples = store.query_series("t1", &foo, TimeRange::all());
        assert_eq!(samples, vec![Sample::new(1, 1.0), Sample::new(2, 2.0)]);

        let forced = store.drain_for_flush("t1", true);
        assert_eq!(forced[0].chunks.len(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_install_rejects_populated_series() {
        let store = store();
        let foo = labels("foo", "a");
        store.append("t1", &foo, Sample::new(1, 1.0), None).unwrap();

        let chunk = Chunk::from_samples(vec![Sample::new(5, 5.0)]);
        assert!(matches!(
            store.install_series("t1", foo.clone(), vec![chunk.clone()]),
            Err(Error::Transfer(TransferError::AlreadyPopulated { .. }))
        ));

        let bar = labels("bar", "a");
        store.install_series("t1", bar.clone(), vec![chunk]).unwrap();
        assert!(store.contains_series("t1", &bar));
        // The installed head keeps accepting newer samples.
        store.append("t1", &bar, Sample::new(6, 6.0), None).unwrap();
        assert_eq!(store.query_series("t1", &bar, TimeRange::all()).len(), 2);
    }

    #[test]
    fn test_snapshot_is_lazy() {
        let store = store();
        let foo = labels("foo", "a");
        store.append("t1", &foo, Sample::new(1, 1.0), None).unwrap();
        let handles = store.snapshot_all();
        store.append("t1", &foo, Sample::new(2, 2.0), None).unwrap();

        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].chunks()[0].len(), 2);

        let taken = store.take_all();
        assert_eq!(taken.len(), 1);
        assert!(store.is_empty());
    }
}
