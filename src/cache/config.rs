//! Cache configuration.
//!
//! Describes which routes are guarded by the response cache, how their keys
//! are derived and how their responses are captured.

use std::collections::HashSet;

use axum::http::Method;
use serde::Deserialize;
use thiserror::Error;

use super::policy::{FreshnessWindow, freshness_for_scope};

// Default values for cache configuration
const DEFAULT_KEY_PREFIX: &str = "artist-http-cache";
const DEFAULT_MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_TERMINAL_MARKER: &str = "data:{\"status\": \"complete\",";

/// Cache configuration from `artcache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the response cache. When disabled every request goes to the origin.
    pub enabled: bool,
    /// Fixed prefix of every derived cache key.
    pub key_prefix: String,
    /// Maximum number of response bytes mirrored per request.
    pub max_capture_bytes: usize,
    /// Guarded routes.
    pub routes: Vec<RouteConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            routes: default_routes(),
        }
    }
}

/// How the origin's output is turned into a cache body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// The complete body is cached verbatim.
    #[default]
    Buffered,
    /// Only the terminal frame of an event stream is cached.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamKind {
    /// Free text such as a name or a title.
    Text,
    /// Comma-separated token list; order and casing are irrelevant.
    Tokens,
    /// Topic scope selecting the freshness window.
    Scope,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParamConfig {
    pub name: String,
    pub kind: ParamKind,
}

impl ParamConfig {
    pub fn new(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: Vec<ParamConfig>,
    #[serde(default)]
    pub capture: CaptureMode,
    /// `false` for routes whose origin has side effects later requests rely on.
    #[serde(default = "default_short_circuit")]
    pub short_circuit: bool,
    /// Window used when the route has no scope parameter.
    #[serde(default)]
    pub freshness: FreshnessWindow,
    #[serde(default = "default_terminal_marker")]
    pub terminal_marker: String,
}

fn default_method() -> String {
    Method::GET.as_str().to_string()
}

fn default_short_circuit() -> bool {
    true
}

fn default_terminal_marker() -> String {
    DEFAULT_TERMINAL_MARKER.to_string()
}

impl RouteConfig {
    fn get(path: &str, params: Vec<ParamConfig>, capture: CaptureMode) -> Self {
        Self {
            path: path.to_string(),
            method: default_method(),
            params,
            capture,
            short_circuit: true,
            freshness: FreshnessWindow::default(),
            terminal_marker: default_terminal_marker(),
        }
    }
}

/// Routes guarded when no configuration overrides them.
pub fn default_routes() -> Vec<RouteConfig> {
    use ParamKind::{Scope, Text, Tokens};

    let mut session = RouteConfig::get(
        "/api/agent/session",
        vec![
            ParamConfig::new("artistName", Text),
            ParamConfig::new("context", Tokens),
        ],
        CaptureMode::Streaming,
    );
    session.short_circuit = false;

    vec![
        RouteConfig::get(
            "/api/search",
            vec![ParamConfig::new("name", Text), ParamConfig::new("scope", Scope)],
            CaptureMode::Buffered,
        ),
        RouteConfig::get(
            "/api/artwork",
            vec![
                ParamConfig::new("artistName", Text),
                ParamConfig::new("context", Scope),
                ParamConfig::new("artworkTitle", Text),
            ],
            CaptureMode::Streaming,
        ),
        RouteConfig::get(
            "/api/agent",
            vec![
                ParamConfig::new("artistName", Text),
                ParamConfig::new("context", Tokens),
            ],
            CaptureMode::Streaming,
        ),
        session,
    ]
}

/// Reasons a configured route is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteConfigError {
    #[error("route path `{0}` must start with `/`")]
    RelativePath(String),
    #[error("route `{path}` has invalid method `{method}`")]
    InvalidMethod { path: String, method: String },
    #[error("route `{0}` cannot guard OPTIONS")]
    Options(String),
    #[error("route `{0}` declares more than one scope")]
    MultipleScopes(String),
    #[error("streaming route `{0}` needs a terminal marker")]
    MissingMarker(String),
    #[error("route `{0}` is configured twice")]
    Duplicate(String),
}

/// A validated guarded route.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    pub path: String,
    pub params: Vec<ParamConfig>,
    pub capture: CaptureMode,
    pub short_circuit: bool,
    pub freshness: FreshnessWindow,
    pub terminal_marker: String,
}

impl Route {
    pub fn has_scope(&self) -> bool {
        self.params.iter().any(|param| param.kind == ParamKind::Scope)
    }

    /// Window for a request whose normalized scope value is `scope`.
    pub fn freshness_for(&self, scope: Option<&str>) -> FreshnessWindow {
        match scope {
            Some(value) if self.has_scope() => freshness_for_scope(value),
            _ => self.freshness,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.capture {
            CaptureMode::Buffered => "application/json",
            CaptureMode::Streaming => "text/event-stream; charset=utf-8",
        }
    }
}

impl TryFrom<&RouteConfig> for Route {
    type Error = RouteConfigError;

    fn try_from(config: &RouteConfig) -> Result<Self, Self::Error> {
        if !config.path.starts_with('/') {
            return Err(RouteConfigError::RelativePath(config.path.clone()));
        }
        let method = Method::from_bytes(config.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| RouteConfigError::InvalidMethod {
                path: config.path.clone(),
                method: config.method.clone(),
            })?;
        if method == Method::OPTIONS {
            return Err(RouteConfigError::Options(config.path.clone()));
        }
        if config.params.iter().filter(|p| p.kind == ParamKind::Scope).count() > 1 {
            return Err(RouteConfigError::MultipleScopes(config.path.clone()));
        }
        if config.capture == CaptureMode::Streaming && config.terminal_marker.is_empty() {
            return Err(RouteConfigError::MissingMarker(config.path.clone()));
        }

        Ok(Self {
            method,
            path: config.path.clone(),
            params: config.params.clone(),
            capture: config.capture,
            short_circuit: config.short_circuit,
            freshness: config.freshness,
            terminal_marker: config.terminal_marker.clone(),
        })
    }
}

/// Lookup table of guarded routes, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_config(config: &CacheConfig) -> Result<Self, RouteConfigError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(config.routes.len());
        for raw in &config.routes {
            if !seen.insert(raw.path.as_str()) {
                return Err(RouteConfigError::Duplicate(raw.path.clone()));
            }
            routes.push(Route::try_from(raw)?);
        }
        Ok(Self { routes })
    }

    pub fn find(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
