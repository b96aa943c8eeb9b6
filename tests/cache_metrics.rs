mod common;

use std::collections::HashSet;
use std::time::Duration;

use artcache::cache::{FreshnessWindow, now_ms};
use artcache::infra::telemetry;
use axum::{Json, Router, routing::get};
use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;
use serial_test::serial;
use tempfile::TempDir;

use common::{eventually, get as get_uri, key_for, layered, open_store, stored_body};

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir).await;
    let origin = Router::new().route(
        "/api/search",
        get(|| async { Json(json!({ "results": ["monet"] })) }),
    );
    let app = layered(origin, store.clone());

    // miss + write-back
    let key = key_for("/api/search?name=Monet");
    get_uri(&app, "/api/search?name=Monet").await;
    eventually(|| {
        let store = store.clone();
        let key = key.clone();
        async move { stored_body(&store, &key).await.is_some() }
    })
    .await;

    // fresh hit
    get_uri(&app, "/api/search?name=Monet").await;

    // stale hit + refresh
    let stale_key = key_for("/api/search?name=Goya");
    store
        .put_at(&stale_key, "old", FreshnessWindow::new(1, 3_600), now_ms() - 10_000)
        .await
        .expect("seed stale entry");
    get_uri(&app, "/api/search?name=Goya").await;
    eventually(|| {
        let store = store.clone();
        let key = stale_key.clone();
        async move { stored_body(&store, &key).await.as_deref() != Some("old") }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "artcache_cache_requests_total",
        "artcache_cache_writes_total",
        "artcache_refresh_scheduled_total",
        "artcache_refresh_completed_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
