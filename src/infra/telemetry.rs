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
///
/// Logs go to stderr so command output on stdout stays machine-readable.
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
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
            "tagstash_cache_hit_total",
            Unit::Count,
            "Total number of entry reads served from the backend."
        );
        describe_counter!(
            "tagstash_cache_miss_total",
            Unit::Count,
            "Total number of entry reads that found nothing usable."
        );
        describe_counter!(
            "tagstash_cache_stale_drop_total",
            Unit::Count,
            "Total number of entries discarded on read as expired or invalidated."
        );
        describe_counter!(
            "tagstash_tag_index_flush_total",
            Unit::Count,
            "Total number of tag index batch writes, by result."
        );
        describe_histogram!(
            "tagstash_tag_index_flush_ms",
            Unit::Milliseconds,
            "Tag index batch write latency in milliseconds."
        );
        describe_gauge!(
            "tagstash_tag_index_pending",
            Unit::Count,
            "Current number of queued tag index mutations."
        );
        describe_counter!(
            "tagstash_purge_total",
            Unit::Count,
            "Total number of edge purge requests, by target kind and result."
        );
        describe_counter!(
            "tagstash_generation_wipe_total",
            Unit::Count,
            "Total number of durable wipes caused by a generation change."
        );
    });
}
