//! Background revalidation.
//!
//! A stale hit schedules one refresh on a bounded pool. The refresh takes the
//! key's lock in the store, reissues the request against the origin router
//! with the bypass header set, and writes the new body back through the same
//! cacheability rules as a live miss.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode, header};
use futures::FutureExt;
use metrics::counter;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, warn};

use super::capture::{Captured, cacheable_payload};
use super::config::Route;
use super::keys::CacheKey;
use super::store::{CacheStore, StoreError, now_ms};
use super::{BYPASS_HEADER, METRIC_REFRESH_COMPLETED};

const MIN_WORKERS: usize = 2;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("origin answered {0}")]
    Status(StatusCode),
    #[error("failed to read origin body: {0}")]
    Body(#[source] axum::Error),
    #[error("origin response is not cacheable")]
    Uncacheable,
    #[error("refresh timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to build refresh request: {0}")]
    Request(#[from] axum::http::Error),
}

/// Concurrency-bounded executor for refresh tasks.
///
/// Failures are logged and never reach the request that scheduled them.
#[derive(Clone)]
pub struct RefreshPool {
    permits: Arc<Semaphore>,
}

impl RefreshPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(MIN_WORKERS))),
        }
    }

    pub fn spawn<F>(&self, key: String, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), RefreshError>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    counter!(METRIC_REFRESH_COMPLETED, "result" => "ok").increment(1);
                }
                Ok(Err(err)) => {
                    counter!(METRIC_REFRESH_COMPLETED, "result" => "failed").increment(1);
                    warn!(key = %key, error = %err, "Background refresh failed");
                }
                Err(panic) => {
                    counter!(METRIC_REFRESH_COMPLETED, "result" => "failed").increment(1);
                    warn!(
                        key = %key,
                        panic = panic_message(&*panic),
                        "Background refresh panicked"
                    );
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Bound on one refresh, origin call and write-back included.
    pub timeout: Duration,
    /// Age after which another refresh may steal a key's lock.
    pub lock_ttl: Duration,
    pub max_capture_bytes: usize,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            lock_ttl: Duration::from_secs(150),
            max_capture_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Issues refreshes against the un-cached origin router.
#[derive(Clone)]
pub struct Refresher {
    origin: Router,
    store: CacheStore,
    options: Arc<RefreshOptions>,
}

impl Refresher {
    pub fn new(origin: Router, store: CacheStore, options: RefreshOptions) -> Self {
        Self {
            origin,
            store,
            options: Arc::new(options),
        }
    }

    /// Schedule a refresh of `key` mirroring `request` and return immediately.
    pub fn schedule<B>(&self, route: &Route, key: &CacheKey, request: &Request<B>) -> JoinHandle<()> {
        let mut replay = Request::builder()
            .method(request.method().clone())
            .uri(request.uri().clone());
        if let Some(headers) = replay.headers_mut() {
            for (name, value) in request.headers() {
                if name != header::CONTENT_LENGTH {
                    headers.append(name.clone(), value.clone());
                }
            }
            headers.insert(BYPASS_HEADER, HeaderValue::from_static("1"));
        }

        let this = self.clone();
        let route = route.clone();
        let key_for_task = key.clone();
        self.store.refresh_async(key.as_str(), async move {
            let request = replay.body(Body::empty())?;
            this.run(route, key_for_task, request).await
        })
    }

    async fn run(
        self,
        route: Route,
        key: CacheKey,
        request: Request<Body>,
    ) -> Result<(), RefreshError> {
        if !self.store.acquire_lock(key.as_str(), self.options.lock_ttl).await? {
            debug!(key = %key, "Refresh already in flight");
            return Ok(());
        }

        let result = self.refresh_if_stale(&route, &key, request).await;

        if let Err(err) = self.store.release_lock(key.as_str()).await {
            warn!(key = %key, error = %err, "Failed to release refresh lock");
        }
        result
    }

    /// Fetch and store unless an earlier refresh already renewed the entry.
    async fn refresh_if_stale(
        &self,
        route: &Route,
        key: &CacheKey,
        request: Request<Body>,
    ) -> Result<(), RefreshError> {
        let current = self.store.get(key.as_str()).await?;
        if current.is_some_and(|entry| entry.is_fresh_at(now_ms())) {
            debug!(key = %key, "Entry already refreshed");
            return Ok(());
        }

        match tokio::time::timeout(
            self.options.timeout,
            self.fetch_and_store(route, key, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RefreshError::Timeout(self.options.timeout)),
        }
    }

    async fn fetch_and_store(
        &self,
        route: &Route,
        key: &CacheKey,
        request: Request<Body>,
    ) -> Result<(), RefreshError> {
        let response = match self.origin.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        if response.status() != StatusCode::OK {
            return Err(RefreshError::Status(response.status()));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), self.options.max_capture_bytes)
            .await
            .map_err(RefreshError::Body)?;

        let payload = cacheable_payload(route, content_type.as_deref(), &Captured::complete(bytes))
            .ok_or(RefreshError::Uncacheable)?;
        self.store
            .put(key.as_str(), &payload, route.freshness_for(key.scope()))
            .await?;
        debug!(key = %key, "Refreshed cache entry");
        Ok(())
    }
}
