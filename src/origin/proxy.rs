use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::application::error::HttpError;
use crate::cache::RouteTable;
use crate::infra::error::InfraError;

use super::session::{SessionRecord, SessionStore};

const SOURCE: &str = "origin::proxy";

/// Response header naming the session opened by a non-short-circuit route.
pub const SESSION_HEADER: HeaderName = HeaderName::from_static("x-session-id");

const FORWARDED_HEADERS: [HeaderName; 4] = [
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
    header::AUTHORIZATION,
    header::CONTENT_TYPE,
];

#[derive(Clone)]
pub struct OriginState {
    client: reqwest::Client,
    upstream: Arc<Url>,
    sessions: Arc<SessionStore>,
}

impl OriginState {
    pub fn new(
        upstream: Url,
        timeout: Duration,
        sessions: Arc<SessionStore>,
    ) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::upstream(err.to_string()))?;
        Ok(Self {
            client,
            upstream: Arc::new(upstream),
            sessions,
        })
    }

    fn upstream_url(&self, uri: &Uri) -> Result<Url, HttpError> {
        let mut url = self
            .upstream
            .join(uri.path().trim_start_matches('/'))
            .map_err(|err| {
                HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Invalid request path", &err)
            })?;
        url.set_query(uri.query());
        Ok(url)
    }

    /// Forward `request` upstream and stream the answer back.
    async fn forward(&self, request: Request<Body>) -> Result<Response, HttpError> {
        let url = self.upstream_url(request.uri())?;
        debug!(url = %url, "Forwarding to upstream");

        let mut upstream = self.client.request(request.method().clone(), url);
        for name in FORWARDED_HEADERS {
            if let Some(value) = request.headers().get(&name) {
                upstream = upstream.header(name, value.clone());
            }
        }

        let reply = upstream.send().await.map_err(|err| {
            HttpError::from_error(SOURCE, StatusCode::BAD_GATEWAY, "Upstream unavailable", &err)
        })?;

        let mut builder = Response::builder().status(reply.status());
        for name in [header::CONTENT_TYPE, header::CACHE_CONTROL] {
            if let Some(value) = reply.headers().get(&name) {
                builder = builder.header(name, value.clone());
            }
        }
        builder
            .body(Body::from_stream(reply.bytes_stream()))
            .map_err(|err| {
                HttpError::from_error(
                    SOURCE,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    &err,
                )
            })
    }
}

/// Router serving every guarded path from the upstream.
///
/// Paths whose route is not short-circuitable open a session before
/// forwarding; the session id travels back in [`SESSION_HEADER`].
pub fn origin_router(state: OriginState, routes: &RouteTable) -> Router {
    let mut router = Router::new();
    for route in routes.iter() {
        router = if route.short_circuit {
            router.route(&route.path, any(proxy_handler))
        } else {
            router.route(&route.path, any(session_handler))
        };
    }
    router
        .route("/api/session/{id}", get(session_lookup))
        .with_state(state)
}

async fn proxy_handler(State(state): State<OriginState>, request: Request<Body>) -> Response {
    match state.forward(request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn session_handler(State(state): State<OriginState>, request: Request<Body>) -> Response {
    let session = state
        .sessions
        .open(request.uri().path(), request.uri().query().unwrap_or(""));

    let mut response = match state.forward(request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    if !response.status().is_success() {
        state.sessions.remove(&session.id);
        return response;
    }

    if let Ok(value) = HeaderValue::from_str(&session.id.to_string()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn session_lookup(
    State(state): State<OriginState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionRecord>, HttpError> {
    state.sessions.get(&id).map(Json).ok_or_else(|| {
        HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Session not found",
            format!("session `{id}` is unknown or expired"),
        )
    })
}
