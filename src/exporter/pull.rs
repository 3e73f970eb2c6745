//! Pull exporter: dynamic metric-family registry, stable-label identity,
//! text-exposition rendering, and the `GET /metrics` axum route.
//!
//! Design reference: spec §4.8 — the second-hardest piece of the core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use std::sync::LazyLock;

use crate::error::ObsError;
use crate::exporter::Exporter;
use crate::model::{DataPoint, Labels, MetricPoint};
use crate::store::Store;
use crate::telemetry::InternalCounters;

/// Namespace prefix every exported metric name carries (spec §4.8 name
/// sanitization: "prepend a common namespace prefix when absent").
const NAMESPACE_PREFIX: &str = "obs_";

const COUNTER_SUFFIXES: &[&str] = &[
    "_total",
    "_count",
    "_errors",
    "_requests",
    "_bytes_received",
    "_bytes_sent",
    "_packets",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// Per-metric-name policy deciding which labels are context (not identity).
/// `ffmpeg_stream_metrics`' policy is given directly by spec §4.8. `paths`'
/// `state` field resolves an explicit open question from spec §8 scenario
/// S3: the core treats `state` as context so the registry holds one entry
/// carrying the latest `state` value (documented in DESIGN.md).
static CONTEXT_LABEL_POLICY: LazyLock<HashMap<&'static str, &'static [&'static str]>> = LazyLock::new(|| {
    HashMap::from([
        ("ffmpeg_stream_metrics", &["fps", "dropped_frames", "duplicate_frames", "processing_speed"][..]),
        ("paths", &["state"][..]),
    ])
});

fn context_labels_for(name: &str) -> &'static [&'static str] {
    CONTEXT_LABEL_POLICY.get(name).copied().unwrap_or(&[])
}

/// Replace any character outside `[A-Za-z0-9_]` with `_`, prefix `_` if the
/// first character is a digit, then prepend the namespace prefix if absent.
/// Idempotent: `sanitize_name(sanitize_name(x)) == sanitize_name(x)`.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if !out.starts_with(NAMESPACE_PREFIX) {
        out = format!("{NAMESPACE_PREFIX}{out}");
    }
    out
}

/// Decide a metric's type from its (sanitized) name suffix. Sticky for the
/// exporter's lifetime once a family exists (spec §4.8).
#[must_use]
pub fn infer_metric_type(sanitized_name: &str) -> MetricType {
    if COUNTER_SUFFIXES.iter().any(|suffix| sanitized_name.ends_with(suffix)) {
        MetricType::Counter
    } else {
        MetricType::Gauge
    }
}

/// Spec §4.8 retransmission filter: drop points re-scraped from another
/// pull endpoint, to avoid export loops.
fn is_retransmitted(labels: &Labels) -> bool {
    labels.get("collector_type") == Some("prometheus") || labels.contains_key("prometheus_endpoint")
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

struct Sample {
    labels: Labels,
    value: f64,
}

struct Family {
    metric_type: MetricType,
    /// keyed by identity-label rendering; value is the latest sample
    /// (dedup by stable identity, spec §8 property 1).
    samples: Mutex<HashMap<String, Sample>>,
}

/// The live, scrape-rendered registry.
struct Registry {
    families: DashMap<String, Family>,
}

impl Registry {
    fn upsert(&self, point: &MetricPoint) {
        if is_retransmitted(&point.labels) {
            return;
        }

        let sanitized = sanitize_name(&point.name);
        let context_keys = context_labels_for(&point.name);
        let identity = point.labels.without_keys(context_keys);
        let identity_key = identity.render_sorted();

        let family = self
            .families
            .entry(sanitized)
            .or_insert_with(|| Family {
                metric_type: infer_metric_type(&point.name),
                samples: Mutex::new(HashMap::new()),
            });

        let mut samples = family.samples.lock().expect("family samples lock poisoned");
        samples.insert(
            identity_key,
            Sample { labels: point.labels.clone(), value: point.value },
        );
    }

    fn render(&self, extra: &[(String, MetricType, Vec<(Labels, f64)>)]) -> String {
        let mut out = String::new();
        let mut names: Vec<_> = self.families.iter().map(|e| e.key().clone()).collect();
        names.sort();

        for name in names {
            let Some(family) = self.families.get(&name) else { continue };
            out.push_str(&format!("# HELP {name} exported by videonode-observability\n"));
            out.push_str(&format!("# TYPE {name} {}\n", family.metric_type.as_str()));
            let samples = family.samples.lock().expect("family samples lock poisoned");
            for sample in samples.values() {
                out.push_str(&render_sample(&name, &sample.labels, sample.value));
            }
        }

        for (name, metric_type, samples) in extra {
            out.push_str(&format!("# HELP {name} exported by videonode-observability\n"));
            out.push_str(&format!("# TYPE {name} {}\n", metric_type.as_str()));
            for (labels, value) in samples {
                out.push_str(&render_sample(name, labels, *value));
            }
        }

        out
    }
}

fn render_sample(name: &str, labels: &Labels, value: f64) -> String {
    if labels.is_empty() {
        return format!("{name} {value}\n");
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    format!("{name}{{{}}} {value}\n", rendered.join(","))
}

/// Pull exporter. Buffers `export` calls; the buffer is flushed into the
/// live registry on `force_flush` and at the start of every scrape, so a
/// scrape is atomic with respect to in-flight exports (spec §4.8
/// buffering).
pub struct PullExporter {
    registry: Registry,
    buffer: Mutex<Vec<MetricPoint>>,
    buffer_size: usize,
    store: Arc<Store>,
    counters: Arc<InternalCounters>,
    running: AtomicBool,
}

impl PullExporter {
    #[must_use]
    pub fn new(store: Arc<Store>, counters: Arc<InternalCounters>, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry { families: DashMap::new() },
            buffer: Mutex::new(Vec::with_capacity(buffer_size.min(1024))),
            buffer_size,
            store,
            counters,
            running: AtomicBool::new(false),
        })
    }

    /// Upsert every buffered point into the live registry.
    pub fn force_flush(&self) {
        let mut buffer = self.buffer.lock().expect("pull buffer lock poisoned");
        for point in buffer.drain(..) {
            self.registry.upsert(&point);
        }
    }

    /// Render the full text-exposition document, flushing first.
    #[must_use]
    pub fn render(&self) -> String {
        self.force_flush();

        let store_stats = self.store.stats();
        let mut extra = vec![
            ("obs_bus_dropped_total".to_owned(), MetricType::Counter, vec![(Labels::new(), self.counters.bus_dropped_total() as f64)]),
            (
                "obs_export_buffer_overflow_total".to_owned(),
                MetricType::Counter,
                vec![(Labels::new(), self.counters.export_buffer_overflow_total() as f64)],
            ),
            (
                "obs_store_full_total".to_owned(),
                MetricType::Counter,
                vec![(Labels::new(), store_stats.store_full_total as f64)],
            ),
        ];

        let scrape_failures: Vec<(Labels, f64)> = self
            .counters
            .scrape_failures()
            .into_iter()
            .map(|(endpoint, count)| (Labels::from_pairs([("endpoint", endpoint)]), count as f64))
            .collect();
        if !scrape_failures.is_empty() {
            extra.push(("obs_scrape_failures_total".to_owned(), MetricType::Counter, scrape_failures));
        }

        self.registry.render(&extra)
    }
}

impl Exporter for PullExporter {
    fn name(&self) -> &str {
        "pull"
    }

    fn start(&self) -> Result<(), ObsError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn export(&self, points: &[DataPoint]) -> Result<(), ObsError> {
        let mut buffer = self.buffer.lock().expect("pull buffer lock poisoned");
        for point in points {
            let DataPoint::Metric(m) = point else {
                continue;
            };
            if buffer.len() >= self.buffer_size {
                self.counters.record_export_buffer_overflow();
                continue;
            }
            buffer.push(m.clone());
        }
        Ok(())
    }
}

async fn metrics_handler(State(exporter): State<Arc<PullExporter>>) -> impl IntoResponse {
    let body = exporter.render();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Build the `GET /metrics` router, grounded on the teacher's axum
/// `Router` + shared `Arc<State>` convention.
#[must_use]
pub fn router(exporter: Arc<PullExporter>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(exporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use chrono::Utc;

    fn metric(name: &str, labels: Labels, value: f64) -> DataPoint {
        DataPoint::Metric(MetricPoint { name: name.to_owned(), value, labels, timestamp: Utc::now(), unit: None })
    }

    fn exporter() -> Arc<PullExporter> {
        PullExporter::new(Arc::new(Store::new(StoreConfig::default())), InternalCounters::new(), 1024)
    }

    #[test]
    fn sanitize_name_is_idempotent_and_prefixes_namespace() {
        let once = sanitize_name("3-weird.name");
        let twice = sanitize_name(&once);
        assert_eq!(once, twice);
        assert!(once.starts_with("obs_"));
    }

    #[test]
    fn infer_type_is_sticky_by_suffix() {
        assert_eq!(infer_metric_type("obs_requests_total"), MetricType::Counter);
        assert_eq!(infer_metric_type("obs_cpu_usage"), MetricType::Gauge);
    }

    /// Spec §8 property 1 + scenario S2: dedup by stable identity.
    #[test]
    fn s2_dedup_by_stream_id_collapses_to_one_entry() {
        let exp = exporter();
        for i in 0..6 {
            let labels = Labels::from_pairs([
                ("stream_id", "proper_stream"),
                ("fps", &i.to_string()),
                ("dropped_frames", "0"),
                ("duplicate_frames", "0"),
                ("processing_speed", "1.0"),
            ]);
            exp.export(&[metric("ffmpeg_stream_metrics", labels, 1.0)]).unwrap();
        }
        exp.force_flush();
        let family = exp.registry.families.get("obs_ffmpeg_stream_metrics").unwrap();
        assert_eq!(family.samples.lock().unwrap().len(), 1);
    }

    /// Spec §8 property 3: retransmission safety.
    #[test]
    fn s3_retransmitted_points_never_rendered() {
        let exp = exporter();
        let labels = Labels::from_pairs([("collector_type", "prometheus"), ("name", "x")]);
        exp.export(&[metric("some_metric", labels, 1.0)]).unwrap();
        let rendered = exp.render();
        assert!(!rendered.contains("some_metric"));
    }

    /// Spec §8 scenario S3: state transition policy — one entry with the
    /// latest `state=ready`.
    #[test]
    fn s3_state_transition_resolves_to_single_entry_with_latest_state() {
        let exp = exporter();
        exp.export(&[metric("paths", Labels::from_pairs([("name", "X"), ("state", "notReady")]), 1.0)])
            .unwrap();
        exp.export(&[metric("paths", Labels::from_pairs([("name", "X"), ("state", "ready")]), 1.0)])
            .unwrap();
        exp.force_flush();
        let family = exp.registry.families.get("obs_paths").unwrap();
        let samples = family.samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        let sample = samples.values().next().unwrap();
        assert_eq!(sample.labels.get("state"), Some("ready"));
    }

    #[test]
    fn internal_counters_rendered_on_scrape() {
        let exp = exporter();
        let rendered = exp.render();
        assert!(rendered.contains("obs_bus_dropped_total"));
        assert!(rendered.contains("obs_store_full_total"));
    }

    #[test]
    fn render_escapes_quotes_and_backslashes_in_label_values() {
        let exp = exporter();
        exp.export(&[metric("weird", Labels::from_pairs([("msg", "a\"b\\c")]), 1.0)]).unwrap();
        let rendered = exp.render();
        assert!(rendered.contains(r#"msg="a\"b\\c""#));
    }
}
