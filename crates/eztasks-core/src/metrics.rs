//! Shared `OpenTelemetry` metrics initialisation.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up the OTLP exporter for both traces and metrics, sending
//! telemetry to a configurable endpoint (e.g. an `OpenTelemetry` Collector),
//! and exposes the relay's counter set.

use std::sync::OnceLock;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracerProvider, Tracer};

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Opaque handle that keeps the `OpenTelemetry` providers alive.
///
/// When dropped, the providers are **not** shut down automatically -- call
/// [`MetricsGuard::shutdown`] for a graceful flush before exiting.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Tracer that feeds the OTLP span exporter, for the `tracing` bridge.
    pub fn tracer(&self) -> Tracer {
        self.tracer_provider.tracer("eztasks-relay")
    }

    /// Gracefully shut down both providers, flushing any buffered telemetry.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the `OpenTelemetry` OTLP pipeline for traces **and** metrics.
///
/// Spans only reach the exporter once the subscriber carries the layer from
/// [`crate::tracing_init::init_tracing_with_otel`].
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
///
/// Returns a [`MetricsGuard`] that must be kept alive for the lifetime of
/// the relay.
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Counters recorded by the relay.
pub struct RelayCounters {
    lines_forwarded: Counter<u64>,
    lines_dropped: Counter<u64>,
    evictions: Counter<u64>,
    rejections: Counter<u64>,
}

impl RelayCounters {
    fn new() -> Self {
        let meter = global::meter("eztasks-relay");
        Self {
            lines_forwarded: meter
                .u64_counter("relay.lines.forwarded")
                .with_description("Client lines written to the executor")
                .build(),
            lines_dropped: meter
                .u64_counter("relay.lines.dropped")
                .with_description("Client lines dropped because no executor was registered")
                .build(),
            evictions: meter
                .u64_counter("relay.executor.evictions")
                .with_description("Executor sessions removed from the registry")
                .build(),
            rejections: meter
                .u64_counter("relay.executor.rejections")
                .with_description("Executor registrations refused because the slot was taken")
                .build(),
        }
    }

    /// Process-wide counter set, created against the global meter on first use.
    pub fn global() -> &'static Self {
        static COUNTERS: OnceLock<RelayCounters> = OnceLock::new();
        COUNTERS.get_or_init(Self::new)
    }

    pub fn lines_forwarded(&self, n: u64) {
        self.lines_forwarded.add(n, &[]);
    }

    pub fn lines_dropped(&self, n: u64) {
        self.lines_dropped.add(n, &[]);
    }

    pub fn eviction(&self, reason: &'static str) {
        self.evictions.add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn rejection(&self) {
        self.rejections.add(1, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn init_metrics_does_not_panic() {
        // Dummy endpoint: the exporter only fails at send-time.
        let guard = init_metrics("http://localhost:4317").unwrap();
        RelayCounters::global().lines_forwarded(3);
        RelayCounters::global().eviction("heartbeat_timeout");
        guard.shutdown().unwrap();
    }
}
