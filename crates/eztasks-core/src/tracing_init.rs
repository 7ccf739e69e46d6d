//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output.
//! With the `metrics` feature, spans can also be bridged to `OpenTelemetry`.

use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"eztasks_relay=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter(default_filter));
    install(registry, log_json);
}

/// Like [`init_tracing`], additionally exporting spans through `tracer`.
///
/// Call after [`crate::metrics::init_metrics`] with the tracer from its guard.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_otel(
    default_filter: &str,
    log_json: bool,
    tracer: opentelemetry_sdk::trace::Tracer,
) {
    let registry = tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(otel_layer(tracer));
    install(registry, log_json);
}

#[cfg(feature = "metrics")]
fn otel_layer<S>(
    tracer: opentelemetry_sdk::trace::Tracer,
) -> tracing_opentelemetry::OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_opentelemetry::layer().with_tracer(tracer)
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()))
}

fn install<S>(subscriber: S, log_json: bool)
where
    S: Subscriber + for<'span> LookupSpan<'span> + Send + Sync + 'static,
{
    if log_json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
