//! artcache: a stale-while-revalidate response cache for slow lookup services.
//!
//! Guarded routes are answered from a local SQLite store when possible.
//! Stale answers are served immediately and refreshed in the background;
//! misses stream straight from the upstream while a copy is captured.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod origin;
