//! Stale-while-revalidate response cache.
//!
//! Sits in front of slow origin routes and answers repeated lookups from a
//! local SQLite store:
//!
//! - **Fresh hit**: served from the store, origin untouched
//! - **Stale hit**: served from the store, one background refresh scheduled
//! - **Miss**: origin response streamed through while a copy is captured
//!
//! ## Configuration
//!
//! Guarded routes are declared in `artcache.toml`:
//!
//! ```toml
//! [[cache.routes]]
//! path = "/api/search"
//! capture = "buffered"
//! params = [
//!     { name = "name", kind = "text" },
//!     { name = "scope", kind = "scope" },
//! ]
//! ```

use axum::http::HeaderName;

mod capture;
mod config;
mod keys;
mod middleware;
mod policy;
mod refresh;
mod store;

pub use capture::{CaptureBody, CaptureOutcome, Captured, cacheable_payload, terminal_frame};
pub use config::{
    CacheConfig, CaptureMode, DEFAULT_TERMINAL_MARKER, ParamConfig, ParamKind, Route, RouteConfig,
    RouteConfigError, RouteTable, default_routes,
};
pub use keys::{CacheKey, KeyDeriver, query_params, slug, token_list};
pub use middleware::{CacheState, revalidate_layer};
pub use policy::{FreshnessWindow, Scope, freshness_for_scope};
pub use refresh::{RefreshError, RefreshOptions, RefreshPool, Refresher};
pub use store::{CacheEntry, CacheStore, PurgeReport, StoreError, StoreOptions, now_ms};

/// Request header that sends a guarded request straight to the origin.
pub const BYPASS_HEADER: HeaderName = HeaderName::from_static("x-bypass-cache");
/// Response header carrying `HIT` or `MISS`.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache");

pub const METRIC_CACHE_REQUESTS: &str = "artcache_cache_requests_total";
pub const METRIC_CACHE_WRITES: &str = "artcache_cache_writes_total";
pub const METRIC_REFRESH_SCHEDULED: &str = "artcache_refresh_scheduled_total";
pub const METRIC_REFRESH_COMPLETED: &str = "artcache_refresh_completed_total";
