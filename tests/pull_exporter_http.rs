//! HTTP-level tests for the pull exporter's `GET /metrics` route.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use videonode_observability::exporter::pull::{router, PullExporter};
use videonode_observability::exporter::Exporter;
use videonode_observability::model::{DataPoint, Labels, MetricPoint};
use videonode_observability::store::{Store, StoreConfig};
use videonode_observability::telemetry::InternalCounters;

async fn body_text(resp: axum::http::Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn metrics_route_exposes_exported_points_and_internal_counters() {
    let store = Arc::new(Store::new(StoreConfig::default()));
    let counters = InternalCounters::new();
    let exporter = PullExporter::new(store, counters, 256);

    exporter
        .export(&[DataPoint::Metric(MetricPoint {
            name: "ffmpeg_fps".into(),
            value: 29.97,
            labels: Labels::from_pairs([("stream_id", "abc")]),
            timestamp: chrono::Utc::now(),
            unit: None,
        })])
        .unwrap();

    let app = router(exporter);
    let req = Request::builder().method(Method::GET).uri("/metrics").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap().to_owned();
    assert_eq!(content_type, "text/plain; version=0.0.4");

    let text = body_text(resp).await;
    assert!(text.contains("obs_ffmpeg_fps"));
    assert!(text.contains("stream_id=\"abc\""));
    assert!(text.contains("obs_bus_dropped_total"));
    assert!(text.contains("obs_store_full_total"));
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let store = Arc::new(Store::new(StoreConfig::default()));
    let exporter = PullExporter::new(store, InternalCounters::new(), 256);
    let app = router(exporter);

    let req = Request::builder().method(Method::GET).uri("/nope").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
