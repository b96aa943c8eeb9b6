use std::{future::IntoFuture, process, sync::Arc};

use artcache::{
    application::error::AppError,
    cache::{CacheStore, RefreshOptions, RouteTable, StoreOptions},
    config,
    infra::{error::InfraError, http, telemetry},
    origin::{OriginState, SessionStore},
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, debug, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Sweep => run_sweep(settings).await,
    }
}

async fn open_store(settings: &config::Settings) -> Result<CacheStore, AppError> {
    let options = StoreOptions {
        max_connections: settings.store.max_connections.get(),
        busy_timeout: settings.store.busy_timeout,
        refresh_workers: usize::try_from(settings.refresh.workers.get())
            .map_err(|err| AppError::validation(err.to_string()))?,
    };
    CacheStore::open(&settings.store.path, &options)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = open_store(&settings).await?;
    let routes = RouteTable::from_config(&settings.cache)
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;

    let sessions = Arc::new(SessionStore::new(settings.session.ttl));
    let origin = OriginState::new(
        settings.upstream.base_url.clone(),
        settings.upstream.timeout,
        Arc::clone(&sessions),
    )?;

    let refresh = RefreshOptions {
        timeout: settings.refresh.timeout,
        lock_ttl: settings.refresh.lock_ttl,
        max_capture_bytes: settings.cache.max_capture_bytes,
    };

    info!(
        target = "artcache::serve",
        routes = routes.len(),
        cache_enabled = settings.cache.enabled,
        upstream = %settings.upstream.base_url,
        store = %settings.store.path.display(),
        "Starting artcache"
    );

    let router = http::build_router(origin, routes, &settings.cache, store.clone(), refresh);

    let sweep_interval = settings.session.sweep_interval;
    let session_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let removed = sessions.purge_expired();
            if removed > 0 {
                debug!(removed, "Purged expired sessions");
            }
        }
    });

    let result = serve_http(&settings, router).await;

    session_handle.abort();
    let _ = session_handle.await;
    store.close().await;

    result
}

async fn run_sweep(settings: config::Settings) -> Result<(), AppError> {
    let store = open_store(&settings).await?;
    let report = store
        .purge_expired(settings.refresh.lock_ttl)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "artcache::sweep",
        entries = report.entries,
        locks = report.locks,
        "Sweep completed"
    );
    store.close().await;
    Ok(())
}

async fn serve_http(settings: &config::Settings, router: axum::Router) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target = "artcache::serve", addr = %settings.server.addr, "Listening");

    let shutdown = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown({
            let shutdown = Arc::clone(&shutdown);
            async move { shutdown.notified().await }
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
        }
        () = shutdown_signal() => {
            info!(target = "artcache::serve", "Shutdown requested, draining connections");
            shutdown.notify_one();
            match tokio::time::timeout(settings.server.graceful_shutdown, server).await {
                Ok(result) => {
                    result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
                }
                Err(_) => {
                    warn!(target = "artcache::serve", "Graceful shutdown timed out");
                    Ok(())
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
