//! SQLite-backed response store.
//!
//! Holds one row per cache key with its fresh and stale horizons, plus a
//! `locks` table used to keep at most one background refresh per key in
//! flight. Timestamps are epoch milliseconds.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use sqlx::FromRow;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::policy::FreshnessWindow;
use super::refresh::{RefreshError, RefreshPool};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("cannot prepare cache directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored response body with its horizons.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CacheEntry {
    pub key: String,
    pub body: String,
    pub fresh_until: i64,
    pub stale_until: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CacheEntry {
    pub fn is_fresh_at(&self, now_ms: i64) -> bool {
        now_ms < self.fresh_until
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// Concurrent background refreshes.
    pub refresh_workers: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            refresh_workers: 2,
        }
    }
}

/// Rows removed by [`CacheStore::purge_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeReport {
    pub entries: u64,
    pub locks: u64,
}

#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
    refresh: RefreshPool,
}

const SELECT_ENTRY: &str = "SELECT key, body, fresh_until, stale_until, created_at, updated_at \
     FROM cache WHERE key = ?";
const SELECT_SERVABLE: &str = "SELECT key, body, fresh_until, stale_until, created_at, updated_at \
     FROM cache WHERE key = ? AND stale_until > ?";

impl CacheStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn open(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(path = %path.display(), "Cache store ready");

        Ok(Self {
            pool,
            refresh: RefreshPool::new(options.refresh_workers),
        })
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Entry for `key` when it is still servable (fresh or stale).
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.get_at(key, now_ms()).await
    }

    pub async fn get_at(&self, key: &str, now_ms: i64) -> Result<Option<CacheEntry>, StoreError> {
        let entry = sqlx::query_as::<_, CacheEntry>(SELECT_SERVABLE)
            .bind(key)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Row for `key` regardless of its horizons.
    pub async fn peek(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entry = sqlx::query_as::<_, CacheEntry>(SELECT_ENTRY)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Insert or replace the body for `key`, resetting both horizons.
    ///
    /// `created_at` survives replacement.
    pub async fn put(
        &self,
        key: &str,
        body: &str,
        window: FreshnessWindow,
    ) -> Result<(), StoreError> {
        self.put_at(key, body, window, now_ms()).await
    }

    pub async fn put_at(
        &self,
        key: &str,
        body: &str,
        window: FreshnessWindow,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let fresh_until = now_ms.saturating_add(seconds_to_ms(window.fresh_seconds));
        let stale_until = fresh_until.saturating_add(seconds_to_ms(window.stale_seconds));

        sqlx::query(
            "INSERT INTO cache (key, body, fresh_until, stale_until, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET \
                body = excluded.body, \
                fresh_until = excluded.fresh_until, \
                stale_until = excluded.stale_until, \
                updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(body)
        .bind(fresh_until)
        .bind(stale_until)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        debug!(key, fresh_until, stale_until, "Cache entry written");
        Ok(())
    }

    /// Try to take the refresh lock for `key`.
    ///
    /// Succeeds when no lock exists or the existing one is older than `ttl`.
    /// The check and the write are a single statement, so two callers can
    /// never both succeed for the same lock generation.
    pub async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.acquire_lock_at(key, ttl, now_ms()).await
    }

    pub async fn acquire_lock_at(
        &self,
        key: &str,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "INSERT INTO locks (key, locked_at) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET locked_at = excluded.locked_at \
             WHERE excluded.locked_at - locks.locked_at > ?",
        )
        .bind(key)
        .bind(now_ms)
        .bind(ttl_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete the refresh lock for `key`. Deleting a missing lock is a no-op.
    pub async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM locks WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Run `task` on the background refresh pool and return immediately.
    pub fn refresh_async<F>(&self, key: &str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), RefreshError>> + Send + 'static,
    {
        self.refresh.spawn(key.to_string(), task)
    }

    /// Delete entries past their stale horizon and locks older than `lock_ttl`.
    pub async fn purge_expired(&self, lock_ttl: Duration) -> Result<PurgeReport, StoreError> {
        self.purge_expired_at(lock_ttl, now_ms()).await
    }

    pub async fn purge_expired_at(
        &self,
        lock_ttl: Duration,
        now_ms: i64,
    ) -> Result<PurgeReport, StoreError> {
        let lock_cutoff =
            now_ms.saturating_sub(i64::try_from(lock_ttl.as_millis()).unwrap_or(i64::MAX));

        let entries = sqlx::query("DELETE FROM cache WHERE stale_until <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let locks = sqlx::query("DELETE FROM locks WHERE locked_at < ?")
            .bind(lock_cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(PurgeReport { entries, locks })
    }

    /// Number of rows in the cache table.
    pub async fn entry_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

fn seconds_to_ms(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1_000)).unwrap_or(i64::MAX)
}
