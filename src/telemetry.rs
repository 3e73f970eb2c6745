//! Shared internal counters surfaced on the pull endpoint (spec §7
//! "user-visible behavior": `bus_dropped_total`, `export_buffer_overflow_total`,
//! `store_full_total`, `scrape_failures_total{endpoint}`).
//!
//! `store_full_total` lives on `StoreStats` instead (the store already
//! counts its own boundary condition); this module holds the three counters
//! that no single component naturally owns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct InternalCounters {
    pub bus_dropped: Arc<AtomicU64>,
    export_buffer_overflow: AtomicU64,
    scrape_failures: DashMap<String, AtomicU64>,
}

impl InternalCounters {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_export_buffer_overflow(&self) {
        self.export_buffer_overflow.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn export_buffer_overflow_total(&self) -> u64 {
        self.export_buffer_overflow.load(Ordering::Relaxed)
    }

    pub fn record_scrape_failure(&self, endpoint: &str) {
        self.scrape_failures
            .entry(endpoint.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn scrape_failures(&self) -> Vec<(String, u64)> {
        self.scrape_failures
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    #[must_use]
    pub fn bus_dropped_total(&self) -> u64 {
        self.bus_dropped.load(Ordering::Relaxed)
    }
}
