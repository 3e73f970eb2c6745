//! Core data-point model: labels, metric/log/span points, and query shapes.
//!
//! Design reference: spec §4.1 (Data-point model & labels)

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a captured log entry, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "err" => Ok(Self::Error),
            "fatal" | "critical" | "panic" => Ok(Self::Fatal),
            _ => Err(()),
        }
    }
}

/// An ordered, value-equal bag of short string key/value pairs.
///
/// Backed by a `BTreeMap` so two bags built from the same key/value pairs in
/// any insertion order compare equal and render identically — this is what
/// makes series-key construction order-invariant (spec §8 round-trip
/// property `K(name, L1) = K(name, L2)` whenever `L1 ≡ L2`).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Return a copy of this bag restricted to keys not present in `exclude`.
    ///
    /// Used by the pull exporter to compute identity labels by subtracting
    /// the per-metric context-label set (spec §4.8).
    #[must_use]
    pub fn without_keys(&self, exclude: &[&str]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| !exclude.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Subset match: every key/value in `filter` must be present and equal
    /// in `self`. An empty filter matches everything.
    #[must_use]
    pub fn matches_subset(&self, filter: &Self) -> bool {
        filter.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// Deterministic rendering used as part of a series key: labels joined
    /// in sorted key order as `key=value,key=value`. `BTreeMap` iteration is
    /// already key-sorted, so this needs no extra sort step.
    #[must_use]
    pub fn render_sorted(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl<K, V> FromIterator<(K, V)> for Labels
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// A single metric observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
    pub unit: Option<String>,
}

/// A single captured log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub level: Level,
    pub labels: Labels,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// A reserved span entry. Not produced or consumed by the core today; the
/// variant exists so `DataPoint` is a closed sum matching spec §3's data
/// model, and so the store/bus can carry span data through unchanged once a
/// span-producing collector is added upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEntry {
    pub name: String,
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The closed sum of everything that can flow through the bus and be stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataPoint {
    Metric(MetricPoint),
    Log(LogEntry),
    Span(SpanEntry),
}

/// The data type a series or query is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Metric,
    Log,
    Span,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Metric => "metric",
            Self::Log => "log",
            Self::Span => "span",
        };
        f.write_str(s)
    }
}

impl DataPoint {
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Metric(_) => DataType::Metric,
            Self::Log(_) => DataType::Log,
            Self::Span(_) => DataType::Span,
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Metric(m) => m.timestamp,
            Self::Log(l) => l.timestamp,
            Self::Span(s) => s.timestamp,
        }
    }

    /// A borrowed copy of this point's labels. Callers must not assume the
    /// returned bag aliases internal state — labels are always handed out
    /// by value (copy-on-read, spec §4.1).
    #[must_use]
    pub fn labels(&self) -> Labels {
        match self {
            Self::Metric(m) => m.labels.clone(),
            Self::Log(l) => l.labels.clone(),
            Self::Span(s) => s.labels.clone(),
        }
    }

    /// The series/family name this point belongs to, when it has one.
    /// Spans carry a `name` too but are not indexed by the store today.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Metric(m) => Some(m.name.as_str()),
            Self::Log(_) => None,
            Self::Span(s) => Some(s.name.as_str()),
        }
    }

    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Metric(m) => format!(
                "{} {} {}",
                m.name,
                m.value,
                m.timestamp.to_rfc3339()
            ),
            Self::Log(l) => format!("[{}] {} ({})", l.level, l.message, l.source),
            Self::Span(s) => format!("span {} ({}ms)", s.name, s.duration_ms),
        }
    }
}

/// A descriptor for `Store::query`.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    pub data_type: DataType,
    pub name: Option<String>,
    pub label_filter: Labels,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: Option<usize>,
    pub aggregator: Option<String>,
    pub step: Option<std::time::Duration>,
}

impl QueryDescriptor {
    #[must_use]
    pub fn new(data_type: DataType, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            data_type,
            name: None,
            label_filter: Labels::new(),
            start,
            end,
            limit: None,
            aggregator: None,
            step: None,
        }
    }
}

/// The result of a `Store::query`.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub points: Vec<DataPoint>,
    pub total: usize,
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_order_invariant_equality() {
        let a = Labels::from_pairs([("b", "2"), ("a", "1")]);
        let b = Labels::from_pairs([("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a.render_sorted(), b.render_sorted());
        assert_eq!(a.render_sorted(), "a=1,b=2");
    }

    #[test]
    fn without_keys_removes_context_labels() {
        let labels = Labels::from_pairs([
            ("stream_id", "s1"),
            ("fps", "30"),
            ("dropped_frames", "0"),
        ]);
        let identity = labels.without_keys(&["fps", "dropped_frames", "duplicate_frames", "processing_speed"]);
        assert_eq!(identity.len(), 1);
        assert_eq!(identity.get("stream_id"), Some("s1"));
    }

    #[test]
    fn matches_subset_empty_filter_matches_all() {
        let labels = Labels::from_pairs([("a", "1")]);
        assert!(labels.matches_subset(&Labels::new()));
    }

    #[test]
    fn matches_subset_requires_all_filter_keys() {
        let labels = Labels::from_pairs([("a", "1"), ("b", "2")]);
        let filter = Labels::from_pairs([("a", "1"), ("b", "3")]);
        assert!(!labels.matches_subset(&filter));
    }

    #[test]
    fn level_from_str_normalizes_aliases() {
        assert_eq!("WARNING".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("err".parse::<Level>().unwrap(), Level::Error);
        assert_eq!("critical".parse::<Level>().unwrap(), Level::Fatal);
    }

    #[test]
    fn level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }
}
