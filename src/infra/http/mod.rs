//! HTTP surface: origin routes behind the revalidation layer, plus health.

mod middleware;

pub use middleware::{RequestContext, log_responses, set_request_context};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::application::error::ErrorReport;
use crate::cache::{
    CacheConfig, CacheState, CacheStore, RefreshOptions, Refresher, RouteTable, StoreError,
    revalidate_layer,
};
use crate::origin::{OriginState, origin_router};

/// Assemble the public router.
///
/// The refresher receives the origin router before the cache layer wraps
/// it, so background refreshes never pass through the cache.
pub fn build_router(
    origin: OriginState,
    routes: RouteTable,
    cache: &CacheConfig,
    store: CacheStore,
    refresh: RefreshOptions,
) -> Router {
    let origin = origin_router(origin, &routes);
    let refresher = Refresher::new(origin.clone(), store.clone(), refresh);
    let state = CacheState::new(cache, routes, store.clone(), refresher);

    let health = Router::new()
        .route("/_health/store", get(store_health))
        .with_state(store);

    origin
        .layer(from_fn_with_state(state, revalidate_layer))
        .merge(health)
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
}

async fn store_health(State(store): State<CacheStore>) -> Response {
    store_health_response(store.health_check().await)
}

fn store_health_response(result: Result<(), StoreError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::store_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
