use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
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

/// Register descriptions for every metric the cache layer emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "respond_first_fresh_total",
            Unit::Count,
            "Requests answered from a fresh entry without running the handler."
        );
        describe_counter!(
            "respond_first_stale_total",
            Unit::Count,
            "Requests answered from a stale entry, followed by regeneration."
        );
        describe_counter!(
            "respond_first_miss_total",
            Unit::Count,
            "Eligible requests with no stored entry."
        );
        describe_counter!(
            "respond_first_bypass_total",
            Unit::Count,
            "Requests not eligible for caching; their entry is invalidated."
        );
        describe_counter!(
            "respond_first_commit_total",
            Unit::Count,
            "Captured responses written to the entry store."
        );
        describe_counter!(
            "respond_first_cancel_total",
            Unit::Count,
            "Captured responses discarded, labelled by reason."
        );
        describe_counter!(
            "respond_first_store_error_total",
            Unit::Count,
            "Entry store operations that failed, labelled by operation."
        );
        describe_histogram!(
            "respond_first_capture_ms",
            Unit::Milliseconds,
            "Time spent running the handler and buffering its output."
        );
    });
}
