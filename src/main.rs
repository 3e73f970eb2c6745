//! Videonode observability core — binary entry point.
//!
//! Wires tracing init → config load → manager construction → exporter
//! registration → axum server (pull + push routers merged) → graceful
//! shutdown, mirroring the teacher's top-to-bottom `main.rs` wiring shape.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tower_http::trace::TraceLayer;
use tracing::info;

use videonode_observability::config::Config;
use videonode_observability::exporter::{pull, push};
use videonode_observability::manager::Manager;
use videonode_observability::store::{Store, StoreConfig};
use videonode_observability::telemetry::InternalCounters;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "videonode_observability=info,tower_http=info".into()),
        )
        .json()
        .init();

    dotenvy::dotenv().ok();

    let config_path = std::env::var("VIDEONODE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("videonode.toml"));
    let config = Config::load(&config_path)?;

    info!(version = env!("CARGO_PKG_VERSION"), config_path = %config_path.display(), "starting videonode observability core");

    let store = Arc::new(Store::new(StoreConfig {
        max_series: config.max_series,
        max_points_per_series: config.max_points_per_series,
        max_retention: config.retention,
        flush_interval: std::time::Duration::from_secs(30),
    }));
    let counters = InternalCounters::new();

    let manager = Manager::new(store.clone(), counters.clone(), config.worker_count, config.data_chan_size)?;

    // Collectors are registered at runtime by external callers as streams
    // start (one progress-socket collector per live transcoder pipeline,
    // scrape/file-tail collectors from operator configuration) rather than
    // at startup — the manager accepts registration at any time (spec
    // §4.7: "registration after start is legal").
    let mut router = axum::Router::new();

    if config.pull_enabled {
        let pull_exporter = pull::PullExporter::new(store.clone(), counters.clone(), config.pull_buffer_size);
        manager.register_exporter(pull_exporter.clone()).await?;
        router = router.merge(pull::router(pull_exporter));
    }

    if config.push_enabled {
        let push_exporter = push::PushExporter::new(config.push_log_level, config.push_channel_capacity);
        manager.register_exporter(push_exporter.clone()).await?;
        router = router.merge(push::sse_router(push_exporter));
    }

    manager.start().await?;

    let router = router.layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "http server listening");

    let cancel = manager.cancellation_token();
    let shutdown_signal = async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to install ctrl-c handler");
                }
            }
            () = cancel.cancelled() => {}
        }
        info!("shutdown signal received, draining http server");
    };

    let serve_result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await;

    manager.shutdown().await;
    serve_result?;

    info!("shutdown complete");
    Ok(())
}
