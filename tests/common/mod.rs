#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use artcache::cache::{
    CacheConfig, CacheState, CacheStore, KeyDeriver, RefreshOptions, Refresher, RouteTable,
    StoreOptions, revalidate_layer,
};
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode, Uri},
    middleware,
};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

pub const MARKER: &str = artcache::cache::DEFAULT_TERMINAL_MARKER;

pub async fn open_store(dir: &TempDir) -> CacheStore {
    CacheStore::open(&dir.path().join("cache.db"), &StoreOptions::default())
        .await
        .expect("store should open")
}

pub fn routes() -> RouteTable {
    RouteTable::from_config(&CacheConfig::default()).expect("default routes are valid")
}

/// Wrap `origin` in the revalidation layer with the default route table.
pub fn layered(origin: Router, store: CacheStore) -> Router {
    let config = CacheConfig::default();
    let refresher = Refresher::new(
        origin.clone(),
        store.clone(),
        RefreshOptions {
            timeout: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(10),
            max_capture_bytes: config.max_capture_bytes,
        },
    );
    let state = CacheState::new(&config, routes(), store, refresher);
    origin.layer(middleware::from_fn_with_state(state, revalidate_layer))
}

/// Cache key the layer derives for `uri`.
pub fn key_for(uri: &str) -> String {
    let uri: Uri = uri.parse().expect("valid uri");
    let routes = routes();
    let route = routes.find(uri.path()).expect("guarded route");
    KeyDeriver::new(CacheConfig::default().key_prefix)
        .derive_from_uri(route, &uri)
        .as_str()
        .to_string()
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    (
        status,
        headers,
        String::from_utf8(bytes.to_vec()).expect("utf-8 body"),
    )
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, HeaderMap, String) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    send(app, request).await
}

pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

/// Body of the stored row for `key`, ignoring horizons.
pub async fn stored_body(store: &CacheStore, key: &str) -> Option<String> {
    store
        .peek(key)
        .await
        .expect("peek should succeed")
        .map(|entry| entry.body)
}
