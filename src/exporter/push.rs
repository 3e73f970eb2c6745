//! Push exporter: per-stream accumulator, composite event publication, the
//! `GET /events` SSE route.
//!
//! Design reference: spec §4.9.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{extract::State, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::ObsError;
use crate::exporter::Exporter;
use crate::model::{DataPoint, Level};

/// A single composite event payload (spec §6 push exporter output).
#[derive(Debug, Clone, Serialize)]
pub struct StreamMetricsEvent {
    pub event_type: &'static str,
    pub timestamp: DateTime<Utc>,
    pub stream_id: String,
    pub fps: String,
    pub dropped_frames: String,
    pub duplicate_frames: String,
    pub processing_speed: String,
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    fps: f64,
    dropped_frames: f64,
    duplicate_frames: f64,
    processing_speed: f64,
}

impl Accumulator {
    fn snapshot(&self, stream_id: &str) -> StreamMetricsEvent {
        StreamMetricsEvent {
            event_type: "stream-metrics",
            timestamp: Utc::now(),
            stream_id: stream_id.to_owned(),
            fps: format!("{:.2}", self.fps),
            dropped_frames: format!("{:.0}", self.dropped_frames),
            duplicate_frames: format!("{:.0}", self.duplicate_frames),
            processing_speed: format!("{:.3}", self.processing_speed),
        }
    }
}

/// Push exporter. Does not buffer: delivery to the broadcast sink is
/// synchronous, and a lagging/absent receiver simply misses the event —
/// that is this component's lossy-backpressure contract (spec §5, §4.9).
pub struct PushExporter {
    accumulators: DashMap<String, Accumulator>,
    level_threshold: Level,
    tx: broadcast::Sender<String>,
    running: AtomicBool,
}

impl PushExporter {
    #[must_use]
    pub fn new(level_threshold: Level, channel_capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(channel_capacity);
        Arc::new(Self {
            accumulators: DashMap::new(),
            level_threshold,
            tx,
            running: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn publish(&self, event: &StreamMetricsEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            // `send` only fails when there are no receivers; a full/slow
            // receiver just lags and misses events instead of blocking us.
            let _ = self.tx.send(json);
        }
    }

    fn apply_metric(&self, name: &str, value: f64, stream_id: &str) {
        let mut acc = self.accumulators.entry(stream_id.to_owned()).or_default();
        match name {
            "ffmpeg_fps" => acc.fps = value,
            "ffmpeg_dropped_frames_total" => acc.dropped_frames = value,
            "ffmpeg_duplicate_frames_total" => acc.duplicate_frames = value,
            "ffmpeg_processing_speed" => acc.processing_speed = value,
            _ => return,
        }
        let snapshot = acc.snapshot(stream_id);
        drop(acc);
        self.publish(&snapshot);
    }
}

impl Exporter for PushExporter {
    fn name(&self) -> &str {
        "push"
    }

    fn start(&self) -> Result<(), ObsError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn export(&self, points: &[DataPoint]) -> Result<(), ObsError> {
        for point in points {
            match point {
                DataPoint::Metric(m) if m.name.starts_with("ffmpeg_") => {
                    let Some(stream_id) = m.labels.get("stream_id") else {
                        continue;
                    };
                    self.apply_metric(&m.name, m.value, stream_id);
                }
                DataPoint::Metric(_) => {
                    // non-`ffmpeg_` metrics are the pull exporter's concern.
                }
                DataPoint::Log(l) => {
                    if l.level < self.level_threshold {
                        continue;
                    }
                    if let Ok(json) = serde_json::to_string(&serde_json::json!({
                        "event_type": "log-entry",
                        "timestamp": l.timestamp,
                        "level": l.level.as_str(),
                        "message": l.message,
                        "source": l.source,
                    })) {
                        let _ = self.tx.send(json);
                    }
                }
                DataPoint::Span(_) => {}
            }
        }
        Ok(())
    }
}

async fn events_handler(
    State(exporter): State<Arc<PushExporter>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = exporter.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(data) => Some(Ok(Event::default().data(data))),
        Err(_lagged) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// Build the `GET /events` SSE router.
#[must_use]
pub fn sse_router(exporter: Arc<PushExporter>) -> Router {
    Router::new().route("/events", get(events_handler)).with_state(exporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Labels, LogEntry, MetricPoint};

    fn metric(name: &str, stream_id: &str, value: f64) -> DataPoint {
        DataPoint::Metric(MetricPoint {
            name: name.to_owned(),
            value,
            labels: Labels::from_pairs([("stream_id", stream_id)]),
            timestamp: Utc::now(),
            unit: None,
        })
    }

    /// Spec §8 scenario S4: push accumulator formatting.
    #[test]
    fn s4_accumulator_formats_fixed_precision() {
        let exp = PushExporter::new(Level::Info, 16);
        let mut rx = exp.subscribe();
        exp.export(&[metric("ffmpeg_fps", "X", 30.0)]).unwrap();
        exp.export(&[metric("ffmpeg_dropped_frames_total", "X", 5.0)]).unwrap();
        exp.export(&[metric("ffmpeg_duplicate_frames_total", "X", 100.0)]).unwrap();
        exp.export(&[metric("ffmpeg_processing_speed", "X", 0.95)]).unwrap();

        let mut last: Option<StreamMetricsEvent> = None;
        while let Ok(json) = rx.try_recv() {
            last = Some(serde_json::from_str(&json).unwrap());
        }
        let last = last.expect("at least one event published");
        assert_eq!(last.fps, "30.00");
        assert_eq!(last.dropped_frames, "5");
        assert_eq!(last.duplicate_frames, "100");
        assert_eq!(last.processing_speed, "0.950");
    }

    #[test]
    fn non_ffmpeg_metrics_are_ignored() {
        let exp = PushExporter::new(Level::Info, 16);
        let mut rx = exp.subscribe();
        exp.export(&[metric("cpu_usage", "X", 1.0)]).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn log_entries_below_threshold_are_dropped() {
        let exp = PushExporter::new(Level::Warn, 16);
        let mut rx = exp.subscribe();
        let info_log = DataPoint::Log(LogEntry {
            message: "hello".into(),
            level: Level::Info,
            labels: Labels::new(),
            fields: Default::default(),
            timestamp: Utc::now(),
            source: "test".into(),
        });
        exp.export(&[info_log]).unwrap();
        assert!(rx.try_recv().is_err());

        let error_log = DataPoint::Log(LogEntry {
            message: "oops".into(),
            level: Level::Error,
            labels: Labels::new(),
            fields: Default::default(),
            timestamp: Utc::now(),
            source: "test".into(),
        });
        exp.export(&[error_log]).unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
