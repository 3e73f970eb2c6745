//! Collector framework: lifecycle trait, periodic-tick helper, label merge.
//!
//! Design reference: spec §4.3.

pub mod file_tail;
pub mod progress_socket;
pub mod scrape;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ObsError;
use crate::model::{DataPoint, Labels};

/// The bus handle collectors hold to emit points. A thin wrapper over the
/// manager's `mpsc::Sender` that always sends non-blocking and counts losses
/// itself, so every collector gets the lossy-backpressure contract (spec §5)
/// for free instead of re-implementing `try_send` bookkeeping three times.
#[derive(Clone)]
pub struct OutBus {
    tx: mpsc::Sender<DataPoint>,
    dropped: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl OutBus {
    #[must_use]
    pub fn new(tx: mpsc::Sender<DataPoint>, dropped: std::sync::Arc<std::sync::atomic::AtomicU64>) -> Self {
        Self { tx, dropped }
    }

    /// Non-blocking send; on a full bus the point is dropped and the loss
    /// counter incremented (spec §4.7 bus policy, §5 backpressure).
    pub fn send(&self, point: DataPoint) {
        if self.tx.try_send(point).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("bus full, dropping point");
        }
    }
}

/// Collector-scoped labels merged onto every point a collector emits, before
/// it reaches the bus (spec §4.3 item 2).
#[derive(Debug, Clone, Default)]
pub struct CollectorLabels(Labels);

impl CollectorLabels {
    #[must_use]
    pub fn new(labels: Labels) -> Self {
        Self(labels)
    }

    /// Merge these labels into `point`'s labels, collector labels losing to
    /// any identically-named label the point already carries (the point's
    /// own data is always more specific than the collector's static tag).
    #[must_use]
    pub fn apply(&self, mut point: DataPoint) -> DataPoint {
        if self.0.is_empty() {
            return point;
        }
        let merge = |existing: &mut Labels| {
            for (k, v) in self.0.iter() {
                if !existing.contains_key(k) {
                    existing.insert(k, v);
                }
            }
        };
        match &mut point {
            DataPoint::Metric(m) => merge(&mut m.labels),
            DataPoint::Log(l) => merge(&mut l.labels),
            DataPoint::Span(s) => merge(&mut s.labels),
        }
        point
    }
}

/// A producer of data points, periodic or event-driven (spec §4.3).
///
/// `start` runs until `cancel` fires or the collector is stopped; it must
/// return promptly after either. Implementations track their own
/// running/stopped state so `is_running` and `stop` are meaningful to call
/// from the manager while `start` is mid-flight on another task.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Unique name; at most one collector per name may be registered (spec
    /// §4.7).
    fn name(&self) -> &str;

    /// One-line human-readable summary of this collector's configuration,
    /// used in startup logs.
    fn config_summary(&self) -> String;

    fn is_running(&self) -> bool;

    /// Run until cancelled. Must not panic on producer errors; log and
    /// continue instead (spec §4.3 item 3).
    async fn start(&self, cancel: CancellationToken, bus: OutBus) -> Result<(), ObsError>;

    /// Request a stop. Idempotent; safe to call concurrently and more than
    /// once (spec §4.3 item 1, §5 "stopping a collector twice is a no-op").
    fn stop(&self);
}

/// Shared running-flag bookkeeping for collectors built on the blanket
/// periodic-tick helper below, and usable standalone by event-driven
/// collectors too.
#[derive(Debug, Default)]
pub struct RunGuard(AtomicBool);

impl RunGuard {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn mark_running(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn mark_stopped(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared tick-and-check-cancellation loop used by the scrape and file-tail
/// collectors (both periodic, spec §4.3 first shape). Factored once rather
/// than duplicated three times, in the spirit of the teacher's
/// `retention::spawn_retention_task` / `voice::spawn_voice_health_task`
/// tick shape (consume the first tick immediately, then loop selecting
/// between the ticker and cancellation).
///
/// `on_tick` is invoked once per interval and once immediately on entry; it
/// should perform exactly one best-effort scrape/tail pass.
pub async fn run_periodic<F, Fut>(interval: Duration, cancel: CancellationToken, mut on_tick: F)
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                on_tick().await;
            }
        }
    }
}
