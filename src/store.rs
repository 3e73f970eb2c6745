//! Bounded in-memory time-series store.
//!
//! Design reference: spec §4.2 (Time-series store), §8 (dedup / ordering /
//! retention properties).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::{DataPoint, DataType, Labels, QueryDescriptor, QueryResult};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is full ({0} series tracked) and no matching series exists")]
    Full(usize),
}

/// Tunable caps, matching spec §6's recognized core knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_series: usize,
    pub max_points_per_series: usize,
    pub max_retention: Duration,
    /// Minimum time between lazy retention sweeps (spec §4.2: sweep is
    /// invoked lazily on write when `now - last_sweep > flush_interval`).
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_series: 10_000,
            max_points_per_series: 1_000,
            max_retention: Duration::from_secs(24 * 3600),
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// A bounded FIFO of data points sharing a `(name, labels)` identity.
struct Series {
    name: String,
    data_type: DataType,
    identity_labels: Labels,
    points: VecDeque<DataPoint>,
    capacity: usize,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Series {
    fn new(name: String, data_type: DataType, labels: Labels, capacity: usize, point: DataPoint) -> Self {
        let now = point.timestamp();
        let mut points = VecDeque::with_capacity(capacity.min(64));
        points.push_back(point);
        Self {
            name,
            data_type,
            identity_labels: labels,
            points,
            capacity,
            first_seen: now,
            last_seen: now,
        }
    }

    fn push(&mut self, point: DataPoint) {
        if self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.last_seen = point.timestamp();
        self.points.push_back(point);
    }
}

/// Read-only metadata snapshot of a series, returned by `list_series`.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesInfo {
    pub name: String,
    pub data_type: DataType,
    pub labels: Labels,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub capacity: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub series_count: usize,
    pub point_count: usize,
    pub max_series: usize,
    pub max_points_per_series: usize,
    pub last_sweep: Option<DateTime<Utc>>,
    pub store_full_total: u64,
}

struct Inner {
    series: HashMap<String, Series>,
    name_index: HashMap<String, HashSet<String>>,
    last_sweep: Instant,
    last_sweep_at: Option<DateTime<Utc>>,
    store_full_total: u64,
}

/// The store. Cheap to clone (wraps an `Arc`-free `RwLock` behind a shared
/// reference held by the manager); callers share one instance via `Arc`.
pub struct Store {
    config: StoreConfig,
    inner: RwLock<Inner>,
}

/// Derive the `(name, identity labels)` pair a point is filed under. The
/// store treats every label on the point as part of identity (spec §3: "the
/// store itself treats all labels as identity" — only the pull exporter
/// narrows this to stable labels). Log entries have no `name` field in the
/// data model, so they are filed under a fixed `"log"` series name grouped
/// by their label bag; this is an explicit resolution of an open question
/// the distilled spec left silent on (see DESIGN.md).
fn series_identity(point: &DataPoint) -> (String, Labels) {
    match point {
        DataPoint::Metric(m) => (m.name.clone(), m.labels.clone()),
        DataPoint::Log(l) => ("log".to_owned(), l.labels.clone()),
        DataPoint::Span(s) => (format!("span:{}", s.name), s.labels.clone()),
    }
}

/// Series key: name plus labels rendered in sorted-key order, so identical
/// labels in any input order collide (spec §4.2 algorithmic note).
fn series_key(name: &str, labels: &Labels) -> String {
    format!("{name}\u{1}{}", labels.render_sorted())
}

impl Store {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                series: HashMap::new(),
                name_index: HashMap::new(),
                last_sweep: Instant::now(),
                last_sweep_at: None,
                store_full_total: 0,
            }),
        }
    }

    /// Insert a point. Creates a series on first sight of a `(name, labels)`
    /// key. Fails with `StoreError::Full` only when the series cap is hit
    /// *and* no existing series matches — existing series keep accepting
    /// points even when the store as a whole is full (spec §8 boundary
    /// behavior).
    pub fn add(&self, point: DataPoint) -> Result<(), StoreError> {
        let (name, labels) = series_identity(&point);
        let key = series_key(&name, &labels);
        let data_type = point.data_type();

        let mut inner = self.inner.write().expect("store lock poisoned");

        if inner.last_sweep.elapsed() > self.config.flush_interval {
            self.sweep_locked(&mut inner);
        }

        if let Some(series) = inner.series.get_mut(&key) {
            series.push(point);
            return Ok(());
        }

        if inner.series.len() >= self.config.max_series {
            inner.store_full_total += 1;
            return Err(StoreError::Full(inner.series.len()));
        }

        let series = Series::new(
            name.clone(),
            data_type,
            labels,
            self.config.max_points_per_series,
            point,
        );
        inner.series.insert(key.clone(), series);
        inner.name_index.entry(name).or_default().insert(key);
        Ok(())
    }

    /// Matching: when `name` is set, consult the name index then filter by
    /// label subset; otherwise scan all series of the query's data type.
    /// Points from matching series are merged and stable-sorted by
    /// timestamp ascending; `limit` is applied after the merge.
    #[must_use]
    pub fn query(&self, descriptor: &QueryDescriptor) -> QueryResult {
        let inner = self.inner.read().expect("store lock poisoned");

        let candidates: Vec<&Series> = if let Some(name) = &descriptor.name {
            inner
                .name_index
                .get(name)
                .into_iter()
                .flat_map(|keys| keys.iter())
                .filter_map(|k| inner.series.get(k))
                .filter(|s| s.data_type == descriptor.data_type)
                .filter(|s| s.identity_labels.matches_subset(&descriptor.label_filter))
                .collect()
        } else {
            inner
                .series
                .values()
                .filter(|s| s.data_type == descriptor.data_type)
                .filter(|s| s.identity_labels.matches_subset(&descriptor.label_filter))
                .collect()
        };

        let mut merged: Vec<DataPoint> = candidates
            .into_iter()
            .flat_map(|s| s.points.iter().cloned())
            .filter(|p| p.timestamp() >= descriptor.start && p.timestamp() <= descriptor.end)
            .collect();

        merged.sort_by_key(DataPoint::timestamp);

        let total = merged.len();
        let truncated = match descriptor.limit {
            Some(limit) if merged.len() > limit => {
                merged.truncate(limit);
                true
            }
            _ => false,
        };

        QueryResult {
            points: merged,
            total,
            truncated,
        }
    }

    #[must_use]
    pub fn list_series(&self) -> Vec<SeriesInfo> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut out: Vec<SeriesInfo> = inner
            .series
            .values()
            .map(|s| SeriesInfo {
                name: s.name.clone(),
                data_type: s.data_type,
                labels: s.identity_labels.clone(),
                first_seen: s.first_seen,
                last_seen: s.last_seen,
                capacity: s.capacity,
                size: s.points.len(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read().expect("store lock poisoned");
        StoreStats {
            series_count: inner.series.len(),
            point_count: inner.series.values().map(|s| s.points.len()).sum(),
            max_series: self.config.max_series,
            max_points_per_series: self.config.max_points_per_series,
            last_sweep: inner.last_sweep_at,
            store_full_total: inner.store_full_total,
        }
    }

    /// Force a retention sweep regardless of the lazy `flush_interval` gate.
    /// Exposed for tests and for callers who want a background tick instead
    /// of relying purely on write-triggered sweeps (spec §9 notes either is
    /// compliant).
    pub fn sweep(&self) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        self.sweep_locked(&mut inner);
    }

    fn sweep_locked(&self, inner: &mut Inner) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.max_retention).unwrap_or(chrono::Duration::zero());
        let stale: Vec<String> = inner
            .series
            .iter()
            .filter(|(_, s)| s.last_seen < cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        for key in stale {
            if let Some(series) = inner.series.remove(&key) {
                if let Some(keys) = inner.name_index.get_mut(&series.name) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        inner.name_index.remove(&series.name);
                    }
                }
            }
        }

        inner.last_sweep = Instant::now();
        inner.last_sweep_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricPoint;

    fn metric(name: &str, labels: Labels, value: f64, ts: DateTime<Utc>) -> DataPoint {
        DataPoint::Metric(MetricPoint {
            name: name.to_owned(),
            value,
            labels,
            timestamp: ts,
            unit: None,
        })
    }

    #[test]
    fn add_creates_series_on_first_point() {
        let store = Store::new(StoreConfig::default());
        store
            .add(metric("cpu", Labels::new(), 1.0, Utc::now()))
            .unwrap();
        assert_eq!(store.stats().series_count, 1);
        assert_eq!(store.stats().point_count, 1);
    }

    #[test]
    fn series_key_is_label_order_invariant() {
        let store = Store::new(StoreConfig::default());
        let l1 = Labels::from_pairs([("a", "1"), ("b", "2")]);
        let l2 = Labels::from_pairs([("b", "2"), ("a", "1")]);
        store.add(metric("m", l1, 1.0, Utc::now())).unwrap();
        store.add(metric("m", l2, 2.0, Utc::now())).unwrap();
        assert_eq!(store.stats().series_count, 1);
        assert_eq!(store.stats().point_count, 2);
    }

    #[test]
    fn ring_buffer_evicts_oldest_when_full() {
        let mut cfg = StoreConfig::default();
        cfg.max_points_per_series = 2;
        let store = Store::new(cfg);
        let labels = Labels::new();
        for i in 0..5 {
            store
                .add(metric("m", labels.clone(), f64::from(i), Utc::now()))
                .unwrap();
        }
        let q = store.query(&QueryDescriptor::new(
            DataType::Metric,
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(1),
        ));
        assert_eq!(q.points.len(), 2);
        if let DataPoint::Metric(m) = &q.points[0] {
            assert_eq!(m.value, 3.0);
        } else {
            panic!("expected metric");
        }
    }

    #[test]
    fn store_full_when_series_cap_hit_without_match() {
        let mut cfg = StoreConfig::default();
        cfg.max_series = 1;
        let store = Store::new(cfg);
        store
            .add(metric("a", Labels::new(), 1.0, Utc::now()))
            .unwrap();
        let err = store
            .add(metric("b", Labels::new(), 1.0, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Full(1)));
        // existing series still accepts points
        store
            .add(metric("a", Labels::new(), 2.0, Utc::now()))
            .unwrap();
        assert_eq!(store.stats().point_count, 2);
    }

    #[test]
    fn retention_sweep_removes_stale_series() {
        let mut cfg = StoreConfig::default();
        cfg.max_retention = Duration::from_secs(0);
        let store = Store::new(cfg);
        store
            .add(metric("a", Labels::new(), 1.0, Utc::now() - chrono::Duration::hours(2)))
            .unwrap();
        store.sweep();
        assert_eq!(store.stats().series_count, 0);
        assert!(store.list_series().is_empty());
    }

    #[test]
    fn query_merges_sorted_by_timestamp_and_respects_limit() {
        let store = Store::new(StoreConfig::default());
        let base = Utc::now();
        store
            .add(metric("m", Labels::from_pairs([("x", "1")]), 1.0, base + chrono::Duration::seconds(2)))
            .unwrap();
        store
            .add(metric("m", Labels::from_pairs([("x", "2")]), 2.0, base))
            .unwrap();
        let mut desc = QueryDescriptor::new(
            DataType::Metric,
            base - chrono::Duration::seconds(10),
            base + chrono::Duration::seconds(10),
        );
        desc.name = Some("m".to_owned());
        let result = store.query(&desc);
        assert_eq!(result.total, 2);
        assert!(!result.truncated);
        assert_eq!(result.points[0].timestamp(), base);

        desc.limit = Some(1);
        let limited = store.query(&desc);
        assert_eq!(limited.total, 2);
        assert!(limited.truncated);
        assert_eq!(limited.points.len(), 1);
    }

    #[test]
    fn list_series_sorted_by_name() {
        let store = Store::new(StoreConfig::default());
        store.add(metric("zz", Labels::new(), 1.0, Utc::now())).unwrap();
        store.add(metric("aa", Labels::new(), 1.0, Utc::now())).unwrap();
        let names: Vec<_> = store.list_series().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["aa".to_owned(), "zz".to_owned()]);
    }
}
