use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_REQUESTS, METRIC_CACHE_WRITES, METRIC_REFRESH_COMPLETED, METRIC_REFRESH_SCHEDULED,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_REQUESTS,
            Unit::Count,
            "Guarded requests by outcome (hit, stale, miss, bypass, store_error)."
        );
        describe_counter!(
            METRIC_CACHE_WRITES,
            Unit::Count,
            "Captured responses by write-back result (stored, skipped, failed)."
        );
        describe_counter!(
            METRIC_REFRESH_SCHEDULED,
            Unit::Count,
            "Background refreshes scheduled by stale hits."
        );
        describe_counter!(
            METRIC_REFRESH_COMPLETED,
            Unit::Count,
            "Background refreshes finished, by result."
        );
    });
}
