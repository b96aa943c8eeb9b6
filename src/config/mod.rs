//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, RouteConfig, RouteTable};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "artcache";
const ENV_PREFIX: &str = "ARTCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORE_PATH: &str = "artist_http_cache.db";
const DEFAULT_STORE_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_STORE_BUSY_TIMEOUT_MS: u64 = 5_000;
const MIN_REFRESH_WORKERS: u32 = 2;
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 120;
const DEFAULT_REFRESH_LOCK_TTL_MS: u64 = 150_000;
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:8000/";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SESSION_TTL_SECS: u64 = 3_600;
const DEFAULT_SESSION_SWEEP_SECS: u64 = 300;

/// Command-line arguments for the artcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "artcache",
    version,
    about = "Stale-while-revalidate cache in front of the artist lookup services"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ARTCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Override the SQLite cache database path.
    #[arg(
        long = "store-path",
        env = "ARTIST_HTTP_CACHE_DB",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub store_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching HTTP server.
    Serve(Box<ServeArgs>),
    /// Delete closed cache entries and abandoned refresh locks.
    Sweep,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the upstream base URL.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Override the upstream request timeout.
    #[arg(long = "upstream-timeout-seconds", value_name = "SECONDS")]
    pub upstream_timeout_seconds: Option<u64>,

    /// Override the number of concurrent background refreshes.
    #[arg(long = "refresh-workers", value_name = "COUNT")]
    pub refresh_workers: Option<u32>,

    /// Override the per-refresh timeout.
    #[arg(long = "refresh-timeout-seconds", value_name = "SECONDS")]
    pub refresh_timeout_seconds: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub refresh: RefreshSettings,
    pub cache: CacheConfig,
    pub upstream: UpstreamSettings,
    pub session: SessionSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub path: PathBuf,
    pub max_connections: NonZeroU32,
    pub busy_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub workers: NonZeroU32,
    pub timeout: Duration,
    pub lock_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    if let Some(path) = cli.store_path.as_ref() {
        raw.store.path = Some(path.clone());
    }
    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sweep) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    refresh: RawRefreshSettings,
    cache: RawCacheSettings,
    upstream: RawUpstreamSettings,
    session: RawSessionSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.upstream_timeout_seconds {
            self.upstream.timeout_seconds = Some(seconds);
        }
        if let Some(workers) = overrides.refresh_workers {
            self.refresh.workers = Some(workers);
        }
        if let Some(seconds) = overrides.refresh_timeout_seconds {
            self.refresh.timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            refresh,
            cache,
            upstream,
            session,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            refresh: build_refresh_settings(refresh)?,
            cache: build_cache_settings(cache)?,
            upstream: build_upstream_settings(upstream)?,
            session: build_session_settings(session)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let path = store
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid("store.path", "path must not be empty"));
    }

    let max_connections = non_zero_u32(
        store
            .max_connections
            .unwrap_or(DEFAULT_STORE_MAX_CONNECTIONS)
            .into(),
        "store.max_connections",
    )?;

    Ok(StoreSettings {
        path,
        max_connections,
        busy_timeout: Duration::from_millis(
            store.busy_timeout_ms.unwrap_or(DEFAULT_STORE_BUSY_TIMEOUT_MS),
        ),
    })
}

fn build_refresh_settings(refresh: RawRefreshSettings) -> Result<RefreshSettings, LoadError> {
    let workers_value = refresh.workers.unwrap_or(MIN_REFRESH_WORKERS);
    if workers_value < MIN_REFRESH_WORKERS {
        return Err(LoadError::invalid(
            "refresh.workers",
            format!("must be at least {MIN_REFRESH_WORKERS}"),
        ));
    }
    let workers = non_zero_u32(workers_value.into(), "refresh.workers")?;

    let timeout_secs = refresh
        .timeout_seconds
        .unwrap_or(DEFAULT_REFRESH_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "refresh.timeout_seconds",
            "must be greater than zero",
        ));
    }
    let timeout = Duration::from_secs(timeout_secs);

    let lock_ttl = Duration::from_millis(refresh.lock_ttl_ms.unwrap_or(DEFAULT_REFRESH_LOCK_TTL_MS));
    if lock_ttl <= timeout {
        return Err(LoadError::invalid(
            "refresh.lock_ttl_ms",
            "must exceed refresh.timeout_seconds",
        ));
    }

    Ok(RefreshSettings {
        workers,
        timeout,
        lock_ttl,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let key_prefix = cache.key_prefix.unwrap_or(defaults.key_prefix);
    if key_prefix.trim().is_empty() {
        return Err(LoadError::invalid("cache.key_prefix", "must not be empty"));
    }

    let max_capture_bytes = match cache.max_capture_bytes {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.max_capture_bytes",
                "must be greater than zero",
            ));
        }
        Some(value) => usize::try_from(value).map_err(|_| {
            LoadError::invalid(
                "cache.max_capture_bytes",
                "value exceeds supported range for usize",
            )
        })?,
        None => defaults.max_capture_bytes,
    };

    let config = CacheConfig {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        key_prefix,
        max_capture_bytes,
        routes: cache.routes.unwrap_or(defaults.routes),
    };
    RouteTable::from_config(&config)
        .map_err(|err| LoadError::invalid("cache.routes", err.to_string()))?;

    Ok(config)
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .base_url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
    let mut base_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("upstream.base_url", format!("failed to parse: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.base_url",
            "scheme must be http or https",
        ));
    }
    // Relative joins replace the last segment unless the path ends with `/`.
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        base_url,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_session_settings(session: RawSessionSettings) -> Result<SessionSettings, LoadError> {
    let ttl_secs = session.ttl_seconds.unwrap_or(DEFAULT_SESSION_TTL_SECS);
    let sweep_secs = session
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_SESSION_SWEEP_SECS);
    if ttl_secs == 0 {
        return Err(LoadError::invalid(
            "session.ttl_seconds",
            "must be greater than zero",
        ));
    }
    if sweep_secs == 0 {
        return Err(LoadError::invalid(
            "session.sweep_interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(SessionSettings {
        ttl: Duration::from_secs(ttl_secs),
        sweep_interval: Duration::from_secs(sweep_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    path: Option<PathBuf>,
    max_connections: Option<u32>,
    busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRefreshSettings {
    workers: Option<u32>,
    timeout_seconds: Option<u64>,
    lock_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    key_prefix: Option<String>,
    max_capture_bytes: Option<u64>,
    routes: Option<Vec<RouteConfig>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSessionSettings {
    ttl_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.store.path, PathBuf::from("artist_http_cache.db"));
        assert_eq!(settings.refresh.workers.get(), 2);
        assert!(settings.refresh.lock_ttl > settings.refresh.timeout);
        assert_eq!(settings.upstream.base_url.as_str(), "http://127.0.0.1:8000/");
        assert_eq!(settings.cache.routes.len(), 4);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());

        let overrides = ServeOverrides {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn single_refresh_worker_rejected() {
        let mut raw = RawSettings::default();
        raw.refresh.workers = Some(1);
        let err = Settings::from_raw(raw).expect_err("one worker is too few");
        assert!(matches!(err, LoadError::Invalid { key: "refresh.workers", .. }));
    }

    #[test]
    fn lock_ttl_must_outlive_refresh_timeout() {
        let mut raw = RawSettings::default();
        raw.refresh.timeout_seconds = Some(60);
        raw.refresh.lock_ttl_ms = Some(60_000);
        let err = Settings::from_raw(raw).expect_err("lock would expire mid-refresh");
        assert!(matches!(err, LoadError::Invalid { key: "refresh.lock_ttl_ms", .. }));
    }

    #[test]
    fn upstream_path_gains_trailing_slash() {
        let mut raw = RawSettings::default();
        raw.upstream.base_url = Some("http://lookup.internal:9000/svc".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(
            settings.upstream.base_url.as_str(),
            "http://lookup.internal:9000/svc/"
        );
    }

    #[test]
    fn upstream_scheme_checked() {
        let mut raw = RawSettings::default();
        raw.upstream.base_url = Some("ftp://lookup.internal/".to_string());
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn invalid_routes_rejected() {
        let mut raw = RawSettings::default();
        let mut routes = crate::cache::default_routes();
        routes[0].path = "api/search".to_string();
        raw.cache.routes = Some(routes);
        let err = Settings::from_raw(raw).expect_err("relative path");
        assert!(matches!(err, LoadError::Invalid { key: "cache.routes", .. }));
    }

    #[test]
    fn zero_capture_limit_rejected() {
        let mut raw = RawSettings::default();
        raw.cache.max_capture_bytes = Some(0);
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["artcache"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "artcache",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--upstream-url",
            "http://lookup.internal:9000/",
            "--cache-enabled",
            "false",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(
                    serve.overrides.upstream_url.as_deref(),
                    Some("http://lookup.internal:9000/")
                );
                assert_eq!(serve.overrides.cache_enabled, Some(false));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    #[serial_test::serial]
    fn environment_layer_overrides_defaults() {
        // SAFETY: env-mutating tests are serialised.
        unsafe {
            std::env::set_var("ARTCACHE__STORE__PATH", "/tmp/artcache-env.db");
            std::env::set_var("ARTCACHE__REFRESH__WORKERS", "3");
        }
        let result = load(&CliArgs::parse_from(["artcache", "sweep"]));
        unsafe {
            std::env::remove_var("ARTCACHE__STORE__PATH");
            std::env::remove_var("ARTCACHE__REFRESH__WORKERS");
        }

        let settings = result.expect("valid settings");
        assert_eq!(settings.store.path, PathBuf::from("/tmp/artcache-env.db"));
        assert_eq!(settings.refresh.workers.get(), 3);
    }

    #[test]
    #[serial_test::serial]
    fn cli_store_path_beats_environment() {
        // SAFETY: env-mutating tests are serialised.
        unsafe {
            std::env::set_var("ARTCACHE__STORE__PATH", "/tmp/artcache-env.db");
        }
        let result = load(&CliArgs::parse_from([
            "artcache",
            "sweep",
            "--store-path",
            "/tmp/artcache-cli.db",
        ]));
        unsafe {
            std::env::remove_var("ARTCACHE__STORE__PATH");
        }

        let settings = result.expect("valid settings");
        assert_eq!(settings.store.path, PathBuf::from("/tmp/artcache-cli.db"));
    }

    #[test]
    fn parse_sweep_with_store_path() {
        let args = CliArgs::parse_from(["artcache", "sweep", "--store-path", "/tmp/cache.db"]);
        assert!(matches!(args.command, Some(Command::Sweep)));
        assert_eq!(args.store_path, Some(PathBuf::from("/tmp/cache.db")));
    }
}
