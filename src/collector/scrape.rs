//! Scrape collector: periodic HTTP pull of text-exposition metrics.
//!
//! Design reference: spec §4.5.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::collector::{run_periodic, Collector, CollectorLabels, OutBus, RunGuard};
use crate::error::ObsError;
use crate::model::{DataPoint, Labels, MetricPoint};

/// Label attached to every point this collector emits, so the pull exporter
/// can drop re-scraped samples and avoid export loops (spec §4.5
/// retransmission rule, §4.8 retransmission filter).
pub const ORIGIN_LABEL_KEY: &str = "collector_type";
pub const ORIGIN_LABEL_VALUE: &str = "prometheus";

#[derive(Debug, Clone)]
pub struct ScrapeFilter {
    pub name: Option<Regex>,
    pub labels: Vec<Regex>,
}

impl Default for ScrapeFilter {
    fn default() -> Self {
        Self { name: None, labels: Vec::new() }
    }
}

impl ScrapeFilter {
    fn matches(&self, name: &str, labels: &Labels) -> bool {
        if let Some(re) = &self.name {
            if !re.is_match(name) {
                return false;
            }
        }
        self.labels.iter().all(|re| labels.iter().any(|(k, v)| re.is_match(k) || re.is_match(v)))
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub name: String,
    pub endpoint: String,
    pub interval: Duration,
    pub filter: ScrapeFilter,
}

/// One parsed sample line, pre-filter.
#[derive(Debug, Clone, PartialEq)]
struct Sample {
    name: String,
    labels: Labels,
    value: f64,
}

/// Parse a text-exposition document into samples, skipping malformed lines
/// silently (spec §4.5: "invalid lines are skipped silently, not fatal").
/// `# HELP` / `# TYPE` lines are recognized but carry no further state here —
/// the core does not need to re-expose the original type, only to classify
/// it again downstream (§4.8).
fn parse_exposition(body: &str) -> Vec<Sample> {
    let mut out = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(sample) = parse_sample_line(line) {
            out.push(sample);
        }
    }
    out
}

fn parse_sample_line(line: &str) -> Option<Sample> {
    let (name_and_labels, rest) = if let Some(brace) = line.find('{') {
        let close = line[brace..].find('}')? + brace;
        let name = line[..brace].trim();
        let label_body = &line[brace + 1..close];
        let rest = line[close + 1..].trim();
        (parse_labels(name, label_body)?, rest)
    } else {
        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts.next()?.trim();
        let rest = parts.next()?.trim();
        ((name.to_owned(), Labels::new()), rest)
    };

    let mut fields = rest.split_whitespace();
    let value: f64 = fields.next()?.parse().ok()?;
    // an optional trailing timestamp field is accepted and ignored — the
    // collector stamps its own arrival time (spec is silent on reusing the
    // source timestamp, and arrival time keeps ordering-within-series
    // meaningful regardless of clock skew between nodes).
    let (name, labels) = name_and_labels;
    Some(Sample { name, labels, value })
}

fn parse_labels(name: &str, body: &str) -> Option<(String, Labels)> {
    let mut labels = Labels::new();
    for pair in split_label_pairs(body) {
        let (k, v) = pair.split_once('=')?;
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        labels.insert(k, v);
    }
    Some((name.trim().to_owned(), labels))
}

/// Split `k="v",k2="v2"` on top-level commas, respecting quoted values that
/// may themselves contain commas.
fn split_label_pairs(body: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(body[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = body[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

pub struct ScrapeCollector {
    config: ScrapeConfig,
    labels: CollectorLabels,
    guard: RunGuard,
    client: reqwest::Client,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
    counters: std::sync::Arc<crate::telemetry::InternalCounters>,
}

impl ScrapeCollector {
    #[must_use]
    pub fn new(config: ScrapeConfig, counters: std::sync::Arc<crate::telemetry::InternalCounters>) -> Self {
        Self {
            config,
            labels: CollectorLabels::default(),
            guard: RunGuard::new(),
            client: reqwest::Client::new(),
            cancel: std::sync::Mutex::new(None),
            counters,
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = CollectorLabels::new(labels);
        self
    }

    async fn tick(&self, bus: &OutBus, cancel: &CancellationToken) {
        let request = self.client.get(&self.config.endpoint).send();
        let response = tokio::select! {
            () = cancel.cancelled() => return,
            r = request => r,
        };

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(endpoint = %self.config.endpoint, status = %r.status(), "scrape returned non-OK status");
                self.counters.record_scrape_failure(&self.config.endpoint);
                return;
            }
            Err(e) => {
                warn!(endpoint = %self.config.endpoint, error = %e, "scrape request failed");
                self.counters.record_scrape_failure(&self.config.endpoint);
                return;
            }
        };

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!(endpoint = %self.config.endpoint, error = %e, "scrape body read failed");
                self.counters.record_scrape_failure(&self.config.endpoint);
                return;
            }
        };

        let now = Utc::now();
        for sample in parse_exposition(&body) {
            if !self.config.filter.matches(&sample.name, &sample.labels) {
                continue;
            }
            let mut labels = sample.labels;
            labels.insert(ORIGIN_LABEL_KEY, ORIGIN_LABEL_VALUE);
            let point = DataPoint::Metric(MetricPoint {
                name: sample.name,
                value: sample.value,
                labels,
                timestamp: now,
                unit: None,
            });
            bus.send(self.labels.apply(point));
        }
    }
}

#[async_trait]
impl Collector for ScrapeCollector {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config_summary(&self) -> String {
        format!(
            "scrape name={} endpoint={} interval={:?}",
            self.config.name, self.config.endpoint, self.config.interval
        )
    }

    fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    #[instrument(skip(self, cancel, bus), fields(name = %self.config.name))]
    async fn start(&self, cancel: CancellationToken, bus: OutBus) -> Result<(), ObsError> {
        self.guard.mark_running();
        let inner = cancel.child_token();
        *self.cancel.lock().expect("cancel lock poisoned") = Some(inner.clone());

        run_periodic(self.config.interval, inner.clone(), || self.tick(&bus, &inner)).await;

        self.guard.mark_stopped();
        Ok(())
    }

    fn stop(&self) {
        if let Some(token) = self.cancel.lock().expect("cancel lock poisoned").as_ref() {
            token.cancel();
        }
        self.guard.mark_stopped();
    }
}
