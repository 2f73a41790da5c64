use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::*;
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

/// Register metric descriptions with the installed recorder. Runs once per process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_STORE_WRITE,
            Unit::Count,
            "Total number of pages written to the cache store."
        );
        describe_counter!(
            METRIC_STORE_WRITE_FAILED,
            Unit::Count,
            "Total number of cache store writes that failed and were skipped."
        );
        describe_counter!(
            METRIC_WRITE_SKIPPED_SECURE,
            Unit::Count,
            "Total number of secure requests not cached because of configuration."
        );
        describe_counter!(
            METRIC_INDEX_INSERT_FAILED,
            Unit::Count,
            "Total number of lookup index registrations that failed."
        );
        describe_counter!(
            METRIC_INVALIDATE_SINGLE,
            Unit::Count,
            "Total number of single-page invalidations."
        );
        describe_counter!(
            METRIC_INVALIDATE_BULK,
            Unit::Count,
            "Total number of bulk invalidations that deleted at least one page."
        );
        describe_counter!(
            METRIC_INVALIDATE_FAILED,
            Unit::Count,
            "Total number of invalidations aborted by a store or index failure."
        );
        describe_counter!(
            METRIC_LISTENER_FAILED,
            Unit::Count,
            "Total number of cache event listener failures, panics included."
        );
        describe_histogram!(
            METRIC_INVALIDATE_BULK_KEYS,
            Unit::Count,
            "Number of pages deleted per bulk invalidation."
        );
    });
}
