//! Stale-while-revalidate middleware.
//!
//! Guards the routes of a [`RouteTable`]. A servable entry is answered from
//! the store without touching the origin; a stale one additionally schedules
//! a background refresh. Misses stream the origin response to the client
//! while a copy is captured and written back once the stream finishes.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use super::capture::{CaptureBody, Captured, cacheable_payload};
use super::config::{CacheConfig, Route, RouteTable};
use super::keys::{CacheKey, KeyDeriver};
use super::refresh::Refresher;
use super::store::{CacheStore, now_ms};
use super::{
    BYPASS_HEADER, CACHE_STATUS_HEADER, METRIC_CACHE_REQUESTS, METRIC_CACHE_WRITES,
    METRIC_REFRESH_SCHEDULED,
};

const ALLOW_METHODS: &str = "GET, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Bypass-Cache";

/// Shared state of the revalidation layer.
#[derive(Clone)]
pub struct CacheState {
    enabled: bool,
    max_capture_bytes: usize,
    routes: Arc<RouteTable>,
    keys: Arc<KeyDeriver>,
    store: CacheStore,
    refresher: Refresher,
}

impl CacheState {
    pub fn new(
        config: &CacheConfig,
        routes: RouteTable,
        store: CacheStore,
        refresher: Refresher,
    ) -> Self {
        Self {
            enabled: config.enabled,
            max_capture_bytes: config.max_capture_bytes,
            routes: Arc::new(routes),
            keys: Arc::new(KeyDeriver::new(config.key_prefix.clone())),
            store,
            refresher,
        }
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn revalidate_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.enabled {
        return next.run(request).await;
    }
    let Some(route) = cache.routes.find(request.uri().path()) else {
        return next.run(request).await;
    };

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut(), request.headers());
        return response;
    }
    if request.method() != route.method {
        return next.run(request).await;
    }
    if bypass_requested(request.headers()) {
        counter!(METRIC_CACHE_REQUESTS, "outcome" => "bypass").increment(1);
        debug!(cache = "revalidate", outcome = "bypass", "forwarding to origin");
        return next.run(request).await;
    }

    let key = cache.keys.derive_from_uri(route, request.uri());

    if route.short_circuit {
        match cache.store.get(key.as_str()).await {
            Ok(Some(entry)) => {
                let stale = !entry.is_fresh_at(now_ms());
                if stale {
                    counter!(METRIC_CACHE_REQUESTS, "outcome" => "stale").increment(1);
                    counter!(METRIC_REFRESH_SCHEDULED).increment(1);
                    debug!(cache = "revalidate", outcome = "stale", key = %key, "serving stale entry");
                    cache.refresher.schedule(route, &key, &request);
                } else {
                    counter!(METRIC_CACHE_REQUESTS, "outcome" => "hit").increment(1);
                    debug!(cache = "revalidate", outcome = "hit", key = %key, "serving cached entry");
                }
                return hit_response(route, entry.body, request.headers());
            }
            Ok(None) => {}
            Err(err) => {
                counter!(METRIC_CACHE_REQUESTS, "outcome" => "store_error").increment(1);
                warn!(key = %key, error = %err, "Cache lookup failed, treating as miss");
            }
        }
    }

    counter!(METRIC_CACHE_REQUESTS, "outcome" => "miss").increment(1);
    debug!(cache = "revalidate", outcome = "miss", key = %key, "forwarding to origin");

    let request_headers = request.headers().clone();
    let response = next.run(request).await;
    let mut response = if response.status() == StatusCode::OK {
        capture_response(&cache, route, key, response)
    } else {
        response
    };

    let headers = response.headers_mut();
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
    apply_cors(headers, &request_headers);
    response
}

fn hit_response(route: &Route, body: String, request_headers: &HeaderMap) -> Response {
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(route.content_type()));
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
    apply_cors(headers, request_headers);
    response
}

/// Swap the body for a capturing one and spawn the write-back.
fn capture_response(cache: &CacheState, route: &Route, key: CacheKey, response: Response) -> Response {
    let (parts, body) = response.into_parts();
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let (body, captured) = CaptureBody::new(body, cache.max_capture_bytes);
    tokio::spawn(write_back(
        cache.store.clone(),
        route.clone(),
        key,
        content_type,
        captured,
    ));
    Response::from_parts(parts, Body::new(body))
}

async fn write_back(
    store: CacheStore,
    route: Route,
    key: CacheKey,
    content_type: Option<String>,
    captured: oneshot::Receiver<Captured>,
) {
    let Ok(captured) = captured.await else {
        return;
    };
    let Some(payload) = cacheable_payload(&route, content_type.as_deref(), &captured) else {
        counter!(METRIC_CACHE_WRITES, "result" => "skipped").increment(1);
        debug!(key = %key, outcome = ?captured.outcome, "response not cacheable");
        return;
    };

    match store
        .put(key.as_str(), &payload, route.freshness_for(key.scope()))
        .await
    {
        Ok(()) => {
            counter!(METRIC_CACHE_WRITES, "result" => "stored").increment(1);
        }
        Err(err) => {
            counter!(METRIC_CACHE_WRITES, "result" => "failed").increment(1);
            warn!(key = %key, error = %err, "Cache write-back failed");
        }
    }
}

/// Only `X-Bypass-Cache: 1` skips the cache; any other value is ignored.
fn bypass_requested(headers: &HeaderMap) -> bool {
    headers
        .get(BYPASS_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == "1")
}

/// Permissive CORS for guarded routes, echoing the caller's origin.
fn apply_cors(headers: &mut HeaderMap, request_headers: &HeaderMap) {
    let origin = request_headers
        .get(header::ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
}
