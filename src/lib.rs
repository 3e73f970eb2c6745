//! Videonode observability core.
//!
//! Ingests metrics and log events from heterogeneous sources, stores them
//! in a bounded in-memory time-series buffer, and fans them out to a
//! pull-mode metrics endpoint and a push-mode browser event stream.

pub mod collector;
pub mod config;
pub mod error;
pub mod exporter;
pub mod manager;
pub mod model;
pub mod store;
pub mod telemetry;
pub mod watcher;
