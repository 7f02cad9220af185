//! Core types used throughout the ingester.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tenant identifier.
pub type TenantId = String;

/// Name of the label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single label pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Create a new label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A sorted set of labels identifying one series within a tenant.
///
/// Labels are kept sorted by name and de-duplicated (last value wins), so two
/// label sets describing the same series always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set from arbitrary pairs.
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut labels: Vec<Label> = labels.into_iter().collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        // Keep the last occurrence of a duplicated name.
        let mut deduped: Vec<Label> = Vec::with_capacity(labels.len());
        for label in labels {
            match deduped.last_mut() {
                Some(last) if last.name == label.name => *last = label,
                _ => deduped.push(label),
            }
        }
        Self(deduped)
    }

    /// Build a label set from `(name, value)` string pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::new(pairs.into_iter().map(|(n, v)| Label::new(n, v)))
    }

    /// Label set with only a metric name.
    pub fn metric(name: &str) -> Self {
        Self::from_pairs([(METRIC_NAME_LABEL, name)])
    }

    /// Get the value of a label.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Get the metric name, if set.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Iterate over the labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set has no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

/// Identifies one series across tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Series labels.
    pub labels: Labels,
}

impl SeriesKey {
    /// Create a new series key.
    pub fn new(tenant: impl Into<TenantId>, labels: Labels) -> Self {
        Self {
            tenant: tenant.into(),
            labels,
        }
    }
}

/// A single sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Sample value.
    pub value: f64,
}

impl Sample {
    /// Create a new sample.
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }

    /// Whether two samples are bit-identical (NaN-safe).
    pub fn same_as(&self, other: &Sample) -> bool {
        self.timestamp_ms == other.timestamp_ms && self.value.to_bits() == other.value.to_bits()
    }
}

/// Samples of one series in a push request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Series labels.
    pub labels: Labels,
    /// Samples, expected in timestamp order.
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    /// Create a series with the given samples.
    pub fn new(labels: Labels, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }
}

/// Inclusive time range in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// First included timestamp.
    pub start_ms: i64,
    /// Last included timestamp.
    pub end_ms: i64,
}

impl TimeRange {
    /// Create a new range.
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    /// Range covering all timestamps.
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// Whether the timestamp lies in the range.
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_ms && ts <= self.end_ms
    }

    /// Whether `[first, last]` intersects the range.
    pub fn overlaps(&self, first: i64, last: i64) -> bool {
        first <= self.end_ms && last >= self.start_ms
    }
}

/// How a matcher compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Value must equal.
    Equal,
    /// Value must differ (a missing label counts as empty).
    NotEqual,
}

/// A label matcher used to select series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    /// Label name.
    pub name: String,
    /// Value to compare against.
    pub value: String,
    /// Comparison.
    pub match_type: MatchType,
}

impl Matcher {
    /// Equality matcher.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            match_type: MatchType::Equal,
        }
    }

    /// Inequality matcher.
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            match_type: MatchType::NotEqual,
        }
    }

    /// Matcher on the metric name.
    pub fn metric(name: impl Into<String>) -> Self {
        Self::equal(METRIC_NAME_LABEL, name)
    }

    /// Whether the label set satisfies this matcher.
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.name).unwrap_or("");
        match self.match_type {
            MatchType::Equal => value == self.value,
            MatchType::NotEqual => value != self.value,
        }
    }
}

/// Samples of one series returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleStream {
    /// Series labels.
    pub labels: Labels,
    /// Samples in timestamp order.
    pub samples: Vec<Sample>,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
