//! Freshness policy.
//!
//! TTLs depend on the route and, for scoped routes, on the `scope` parameter
//! value. Content never influences how long an entry stays fresh.

use serde::Deserialize;

const DAY_SECS: u64 = 86_400;

/// A (fresh, stale) pair in seconds.
///
/// An entry written at `T` is fresh until `T + fresh` and servable (stale)
/// until `T + fresh + stale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FreshnessWindow {
    pub fresh_seconds: u64,
    pub stale_seconds: u64,
}

impl FreshnessWindow {
    pub const fn new(fresh_seconds: u64, stale_seconds: u64) -> Self {
        Self {
            fresh_seconds,
            stale_seconds,
        }
    }

    pub const fn days(fresh: u64, stale: u64) -> Self {
        Self::new(fresh * DAY_SECS, stale * DAY_SECS)
    }
}

impl Default for FreshnessWindow {
    fn default() -> Self {
        Self::days(14, 30)
    }
}

/// Topic scope of a scoped lookup.
///
/// Slower-changing scopes stay fresh for longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    #[default]
    PoliticalEvents,
    ArtMovements,
    ArtistNetwork,
}

impl Scope {
    pub const ALL: [Scope; 3] = [
        Scope::PoliticalEvents,
        Scope::ArtMovements,
        Scope::ArtistNetwork,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::PoliticalEvents => "political-events",
            Scope::ArtMovements => "art-movements",
            Scope::ArtistNetwork => "artist-network",
        }
    }

    /// Parse an already-normalized scope value.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|scope| scope.as_str() == value)
    }

    pub fn freshness(self) -> FreshnessWindow {
        match self {
            Scope::PoliticalEvents => FreshnessWindow::days(2, 7),
            Scope::ArtMovements => FreshnessWindow::days(7, 21),
            Scope::ArtistNetwork => FreshnessWindow::days(14, 30),
        }
    }
}

/// Window for a scope value as it appears in a cache key.
///
/// Unrecognised values fall back to the default scope's window.
pub fn freshness_for_scope(value: &str) -> FreshnessWindow {
    Scope::parse(value).unwrap_or_default().freshness()
}
