//! File-tail collector: rotation-aware tail with level inference and bounded
//! metric extraction.
//!
//! Design reference: spec §4.6.

use std::fs::Metadata;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::collector::{run_periodic, Collector, CollectorLabels, OutBus, RunGuard};
use crate::error::ObsError;
use crate::model::{DataPoint, Labels, Level, LogEntry, MetricPoint};

const LINES_PROCESSED_METRIC: &str = "logfile_lines_processed_total";
const PATTERN_METRIC: &str = "logfile_pattern_matches_total";

struct LevelPattern {
    level: Level,
    re: Regex,
}

/// Checked in priority order: most severe wins on the first match. Compiled
/// once, not per line (teacher convention: `observability::ingestion`'s
/// `ALLOWED_LABEL_KEYS` uses the same `std::sync::LazyLock` static-table
/// shape for a lookup built once and consulted on every line).
static LEVEL_PATTERNS: LazyLock<Vec<LevelPattern>> = LazyLock::new(|| {
    vec![
        LevelPattern { level: Level::Fatal, re: Regex::new(r"(?i)\b(fatal|panic|critical)\b").expect("valid regex") },
        LevelPattern { level: Level::Error, re: Regex::new(r"(?i)\b(error|err|failed)\b").expect("valid regex") },
        LevelPattern { level: Level::Warn, re: Regex::new(r"(?i)\b(warn|warning|caution)\b").expect("valid regex") },
        LevelPattern { level: Level::Info, re: Regex::new(r"(?i)\binfo\b").expect("valid regex") },
        LevelPattern { level: Level::Debug, re: Regex::new(r"(?i)\b(debug|trace)\b").expect("valid regex") },
    ]
});

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[([a-z]+)\]|\b([a-z]+):").expect("valid regex"));

fn explicit_marker_level(line: &str) -> Option<Level> {
    for caps in MARKER_RE.captures_iter(line) {
        let word = caps.get(1).or_else(|| caps.get(2))?.as_str();
        if let Ok(level) = word.parse::<Level>() {
            return Some(level);
        }
    }
    None
}

/// Infer a log entry's level: ordered-pattern detection, then an explicit
/// `[LEVEL]` or `LEVEL:` marker overrides it if present (spec §4.6).
fn infer_level(line: &str) -> Level {
    let detected = LEVEL_PATTERNS
        .iter()
        .find(|p| p.re.is_match(line))
        .map_or(Level::Info, |p| p.level);
    explicit_marker_level(line).unwrap_or(detected)
}

fn timestamp_formats() -> &'static [&'static str] {
    &[
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%b %d %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
        "%H:%M:%S",
    ]
}

/// Try parsing a timestamp out of up to the first three whitespace-separated
/// tokens of a log line, against a fixed set of common formats. Falls back
/// to `now` (the file-scan wall clock) when nothing matches (spec §4.6).
fn extract_timestamp(line: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    for token_count in 1..=3.min(tokens.len()) {
        let candidate = tokens[..token_count].join(" ");
        for fmt in timestamp_formats() {
            if let Ok(dt) = DateTime::parse_from_str(&candidate, fmt) {
                return dt.with_timezone(&Utc);
            }
            if let Ok(ndt) = NaiveDateTime::parse_from_str(&candidate, fmt) {
                return DateTime::from_naive_utc_and_offset(ndt, Utc);
            }
            // syslog's "%b %d %H:%M:%S" carries no year; `NaiveDateTime`
            // parsing can never succeed against it on its own, so retry with
            // the scan's current year prefixed.
            if *fmt == "%b %d %H:%M:%S" {
                let with_year = format!("{} {candidate}", now.year());
                if let Ok(ndt) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S") {
                    return DateTime::from_naive_utc_and_offset(ndt, Utc);
                }
            }
            if *fmt == "%H:%M:%S" {
                if let Ok(t) = chrono::NaiveTime::parse_from_str(&candidate, "%H:%M:%S") {
                    let date = now.date_naive();
                    if let Some(full) = chrono::NaiveDateTime::new(date, t).and_local_timezone(Utc).single() {
                        return full;
                    }
                }
            }
        }
    }
    now
}

/// Recognized substrings that bump a bounded counter alongside the log
/// entry (spec §4.6). Each pattern maps to a fixed label value, so
/// cardinality on `logfile_pattern_matches_total` is capped at four.
fn detect_patterns(line: &str) -> Vec<&'static str> {
    let lower = line.to_ascii_lowercase();
    let mut hits = Vec::new();
    if lower.contains("exception") {
        hits.push("exception");
    }
    if lower.contains("timeout") {
        hits.push("timeout");
    }
    if lower.contains("connection") && (lower.contains("failed") || lower.contains("error")) {
        hits.push("connection_error");
    }
    if lower.contains("out of memory") || lower.contains("oom") {
        hits.push("oom");
    }
    hits
}

#[derive(Debug, Default)]
struct TailState {
    position: u64,
    last_size: u64,
    last_mtime: Option<SystemTime>,
    seen_before: bool,
}

pub struct FileTailCollector {
    name: String,
    path: PathBuf,
    interval: Duration,
    labels: CollectorLabels,
    guard: RunGuard,
    cancel: Mutex<Option<CancellationToken>>,
    state: Mutex<TailState>,
}

impl FileTailCollector {
    #[must_use]
    pub fn new(name: impl Into<String>, path: PathBuf, interval: Duration) -> Self {
        Self {
            name: name.into(),
            path,
            interval,
            labels: CollectorLabels::default(),
            guard: RunGuard::new(),
            cancel: Mutex::new(None),
            state: Mutex::new(TailState::default()),
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = CollectorLabels::new(labels);
        self
    }

    fn mtime(meta: &Metadata) -> Option<SystemTime> {
        meta.modified().ok()
    }

    async fn tick(&self, bus: &OutBus) {
        let meta = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(_) => {
                let mut state = self.state.lock().expect("tail state lock poisoned");
                *state = TailState::default();
                return;
            }
        };

        let size = meta.len();
        let mtime = Self::mtime(&meta);

        let mut state = self.state.lock().expect("tail state lock poisoned");

        if state.seen_before && size < state.last_size {
            // truncation/rotation: reset cursor, keep watching the same path.
            state.position = 0;
        }

        let advanced = !state.seen_before || size > state.last_size || mtime != state.last_mtime;
        if !advanced {
            return;
        }

        let position = state.position;
        state.last_size = size;
        state.last_mtime = mtime;
        state.seen_before = true;
        drop(state);

        let lines = match self.read_from(position) {
            Ok((lines, new_pos)) => {
                self.state.lock().expect("tail state lock poisoned").position = new_pos;
                lines
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "file-tail read failed");
                return;
            }
        };

        let now = Utc::now();
        let mut processed: u64 = 0;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            processed += 1;
            let level = infer_level(&line);
            let timestamp = extract_timestamp(&line, now);

            let mut fields = std::collections::BTreeMap::new();
            fields.insert("raw".to_owned(), serde_json::Value::String(line.clone()));

            let mut labels = Labels::new();
            labels.insert("file", self.path.display().to_string());
            labels.insert("source", self.name.clone());

            let entry = DataPoint::Log(LogEntry {
                message: line.clone(),
                level,
                labels,
                fields,
                timestamp,
                source: self.name.clone(),
            });
            bus.send(self.labels.apply(entry));

            for pattern in detect_patterns(&line) {
                let mut labels = Labels::new();
                labels.insert("pattern", pattern);
                labels.insert("source", self.name.clone());
                let metric = DataPoint::Metric(MetricPoint {
                    name: PATTERN_METRIC.to_owned(),
                    value: 1.0,
                    labels,
                    timestamp,
                    unit: None,
                });
                bus.send(self.labels.apply(metric));
            }
        }

        if processed > 0 {
            let mut labels = Labels::new();
            labels.insert("source", self.name.clone());
            let counted = DataPoint::Metric(MetricPoint {
                name: LINES_PROCESSED_METRIC.to_owned(),
                value: processed as f64,
                labels,
                timestamp: now,
                unit: None,
            });
            bus.send(self.labels.apply(counted));
        }
    }

    fn read_from(&self, position: u64) -> std::io::Result<(Vec<String>, u64)> {
        use std::io::Read;
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(position))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let new_pos = position + buf.len() as u64;
        let lines = buf.lines().map(ToString::to_string).collect();
        Ok((lines, new_pos))
    }
}

#[async_trait]
impl Collector for FileTailCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn config_summary(&self) -> String {
        format!("file-tail name={} path={} interval={:?}", self.name, self.path.display(), self.interval)
    }

    fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    #[instrument(skip(self, cancel, bus), fields(name = %self.name))]
    async fn start(&self, cancel: CancellationToken, bus: OutBus) -> Result<(), ObsError> {
        self.guard.mark_running();
        let inner = cancel.child_token();
        *self.cancel.lock().expect("cancel lock poisoned") = Some(inner.clone());

        run_periodic(self.interval, inner, || self.tick(&bus)).await;

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
