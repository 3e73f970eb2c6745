//! Top-level error taxonomy.
//!
//! Per-component errors live next to their component (`store::StoreError`,
//! `watcher::WatcherError`); this module holds the crate-wide error surfaced
//! by `Manager` lifecycle calls and by `main`. Recoverable per-line parse
//! errors (malformed scrape samples, malformed progress frames) are never
//! modeled as `Result` here — they are logged and discarded at the point of
//! parsing (spec §7).

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised by collector/exporter lifecycle operations (spec §7,
/// "Collector-lifecycle").
#[derive(Debug, Error)]
pub enum ObsError {
    #[error("collector {0:?} is already registered")]
    DuplicateCollector(String),

    #[error("no collector named {0:?} is registered")]
    UnknownCollector(String),

    #[error("collector {0:?} failed to start: {1}")]
    CollectorStartFailed(String, String),

    #[error("failed to construct the data bus or worker pool: {0}")]
    BusConstructionFailed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
