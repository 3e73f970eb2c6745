//! Progress-socket collector: per-stream Unix socket listener translating a
//! line-oriented `key=value` protocol into composite metric points.
//!
//! Design reference: spec §4.4 — the hardest piece of the core.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::collector::{Collector, CollectorLabels, OutBus, RunGuard};
use crate::error::ObsError;
use crate::model::{DataPoint, Labels, MetricPoint};

const METRIC_NAME: &str = "ffmpeg_stream_metrics";

/// Build the well-known socket path for a stream (spec §6).
#[must_use]
pub fn socket_path(base_dir: &std::path::Path, stream_id: &str) -> PathBuf {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    base_dir.join(format!("ffmpeg-progress-{stream_id}-{epoch}.sock"))
}

/// Translate a raw `key=value` frame key into its label name, stripping a
/// trailing `x` from `speed` (spec §4.4: "the latter may carry a trailing
/// `x` which is stripped").
fn normalize_key_value(key: &str, value: &str) -> (String, String) {
    match key {
        "drop_frames" => ("dropped_frames".to_owned(), value.to_owned()),
        "dup_frames" => ("duplicate_frames".to_owned(), value.to_owned()),
        "speed" => ("processing_speed".to_owned(), value.trim_end_matches('x').to_owned()),
        other => (other.to_owned(), value.to_owned()),
    }
}

/// Parse one already-trimmed, non-empty line into `(key, value)`, or `None`
/// if it does not look like `key=value`.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let (k, v) = line.split_once('=')?;
    Some((k.trim(), v.trim()))
}

/// Build the single composite point for one accumulated progress frame.
fn build_point(stream_id: &str, pending: &HashMap<String, String>) -> DataPoint {
    let mut labels = Labels::new();
    labels.insert("stream_id", stream_id);
    for (k, v) in pending {
        labels.insert(k.clone(), v.clone());
    }
    DataPoint::Metric(MetricPoint {
        name: METRIC_NAME.to_owned(),
        value: 1.0,
        labels,
        timestamp: chrono::Utc::now(),
        unit: None,
    })
}

pub struct ProgressSocketCollector {
    stream_id: String,
    path: PathBuf,
    labels: CollectorLabels,
    guard: RunGuard,
    inner_cancel: Mutex<Option<CancellationToken>>,
}

impl ProgressSocketCollector {
    #[must_use]
    pub fn new(stream_id: impl Into<String>, path: PathBuf) -> Self {
        Self {
            stream_id: stream_id.into(),
            path,
            labels: CollectorLabels::default(),
            guard: RunGuard::new(),
            inner_cancel: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = CollectorLabels::new(labels);
        self
    }

    fn prepare_path(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn handle_connection(
        stream: tokio::net::UnixStream,
        stream_id: String,
        labels: CollectorLabels,
        bus: OutBus,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let mut reader = BufReader::new(stream).lines();
        let mut pending: HashMap<String, String> = HashMap::new();

        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => break,
                line = reader.next_line() => line,
            };

            match line {
                Ok(Some(raw)) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Some((key, value)) = parse_line(trimmed) else {
                        continue;
                    };
                    if key == "progress" {
                        let point = build_point(&stream_id, &pending);
                        bus.send(labels.apply(point));
                        pending.clear();
                        continue;
                    }
                    let (norm_key, norm_value) = normalize_key_value(key, value);
                    pending.insert(norm_key, norm_value);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, stream_id = %stream_id, "progress socket read error");
                    break;
                }
            }
        }

        info!(
            stream_id = %stream_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "progress connection closed"
        );
    }
}

#[async_trait]
impl Collector for ProgressSocketCollector {
    fn name(&self) -> &str {
        &self.stream_id
    }

    fn config_summary(&self) -> String {
        format!("progress-socket stream_id={} path={}", self.stream_id, self.path.display())
    }

    fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    #[instrument(skip(self, cancel, bus), fields(stream_id = %self.stream_id))]
    async fn start(&self, cancel: CancellationToken, bus: OutBus) -> Result<(), ObsError> {
        self.prepare_path()?;
        let listener = UnixListener::bind(&self.path)?;
        self.guard.mark_running();

        let inner = cancel.child_token();
        *self.inner_cancel.lock().expect("inner cancel lock poisoned") = Some(inner.clone());

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = inner.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let stream_id = self.stream_id.clone();
                            let labels = self.labels.clone();
                            let bus = bus.clone();
                            let conn_cancel = cancel.clone();
                            tokio::spawn(async move {
                                Self::handle_connection(stream, stream_id, labels, bus, conn_cancel).await;
                            });
                        }
                        Err(e) => {
                            debug!(error = %e, "progress socket accept error");
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.path);
        self.guard.mark_stopped();
        Ok(())
    }

    fn stop(&self) {
        if let Some(token) = self.inner_cancel.lock().expect("inner cancel lock poisoned").as_ref() {
            token.cancel();
        }
        self.guard.mark_stopped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_splits_key_value_and_trims() {
        assert_eq!(parse_line("fps = 30 "), Some(("fps", "30")));
        assert_eq!(parse_line("no-equals-sign"), None);
    }

    #[test]
    fn normalize_key_value_renames_and_strips_speed_suffix() {
        assert_eq!(
            normalize_key_value("speed", "0.467x"),
            ("processing_speed".to_owned(), "0.467".to_owned())
        );
        assert_eq!(
            normalize_key_value("drop_frames", "0"),
            ("dropped_frames".to_owned(), "0".to_owned())
        );
        assert_eq!(
            normalize_key_value("dup_frames", "14"),
            ("duplicate_frames".to_owned(), "14".to_owned())
        );
        assert_eq!(
            normalize_key_value("custom_key", "x"),
            ("custom_key".to_owned(), "x".to_owned())
        );
    }

    /// Spec §8 scenario S1: one full frame produces exactly one composite
    /// point with the documented label set.
    #[test]
    fn s1_frame_accumulation_produces_one_composite_point() {
        let lines = ["fps=30", "drop_frames=0", "dup_frames=14", "speed=0.467x", "progress=continue"];
        let mut pending: HashMap<String, String> = HashMap::new();
        let mut emitted = Vec::new();
        for line in lines {
            let (k, v) = parse_line(line).unwrap();
            if k == "progress" {
                emitted.push(build_point("S1", &pending));
                pending.clear();
                continue;
            }
            let (nk, nv) = normalize_key_value(k, v);
            pending.insert(nk, nv);
        }
        assert_eq!(emitted.len(), 1);
        let DataPoint::Metric(m) = &emitted[0] else {
            panic!("expected metric point");
        };
        assert_eq!(m.name, "ffmpeg_stream_metrics");
        assert_eq!(m.labels.get("stream_id"), Some("S1"));
        assert_eq!(m.labels.get("fps"), Some("30"));
        assert_eq!(m.labels.get("dropped_frames"), Some("0"));
        assert_eq!(m.labels.get("duplicate_frames"), Some("14"));
        assert_eq!(m.labels.get("processing_speed"), Some("0.467"));
    }

    #[tokio::test]
    async fn socket_lifecycle_cleans_up_path_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ffmpeg-progress-test.sock");
        let collector = std::sync::Arc::new(ProgressSocketCollector::new("test", path.clone()));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let bus = OutBus::new(tx, dropped);

        let collector2 = collector.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move {
            collector2.start(cancel2, bus).await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(path.exists());
        assert!(collector.is_running());

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(!path.exists());
        assert!(!collector.is_running());
        drop(rx.try_recv());
    }
}
