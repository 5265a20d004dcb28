use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "abovefold_artifact_read_total",
            Unit::Count,
            "Artifact lookups by outcome (hit, miss, error)."
        );
        describe_counter!(
            "abovefold_artifact_write_total",
            Unit::Count,
            "Artifact writes by result."
        );
        describe_counter!(
            "abovefold_gate_decision_total",
            Unit::Count,
            "Inline decisions by outcome (bypass, passthrough, inline)."
        );
        describe_counter!(
            "abovefold_regeneration_jobs_total",
            Unit::Count,
            "Background regeneration jobs by result."
        );
        describe_gauge!(
            "abovefold_regeneration_pending",
            Unit::Count,
            "Regeneration jobs queued or running."
        );
        describe_histogram!(
            "abovefold_generate_ms",
            Unit::Milliseconds,
            "Critical CSS extraction latency per viewport in milliseconds."
        );
    });
}
