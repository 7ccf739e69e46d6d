//! eztasks Relay Server
//!
//! Line relay that forwards client commands to a single registered executor.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use eztasks_core::config::load_config;
use eztasks_core::tracing_init::init_tracing;
use eztasks_relay::heartbeat::HeartbeatMonitor;
use eztasks_relay::registry::ExecutorRegistry;
use eztasks_relay::router::{RelayRouter, RouterSettings};
use eztasks_relay::server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "eztasks-relay")]
#[command(version, about = "eztasks relay server - forwards client commands to one executor")]
struct Args {
    /// Path to a JSON settings file.
    #[arg(long, env = "EZTASKS_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind to.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between heartbeat checks.
    #[arg(long)]
    heartbeat_tick_secs: Option<u64>,

    /// Seconds of executor silence before eviction.
    #[arg(long)]
    heartbeat_timeout_secs: Option<u64>,

    /// Maximum accepted line length in bytes.
    #[arg(long)]
    max_line_bytes: Option<usize>,

    /// Seconds a client connection has to send its batch (0 disables).
    #[arg(long)]
    client_read_timeout_secs: Option<u64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    /// OTLP endpoint for traces and metrics (e.g. `http://localhost:4317`).
    #[cfg(feature = "metrics")]
    #[arg(long, env = "EZTASKS_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

const DEFAULT_LOG_FILTER: &str = "eztasks_relay=info";

/// Start the OTLP pipeline when an endpoint is given, then the subscriber, so
/// spans reach the exporter from the first event.
#[cfg(feature = "metrics")]
fn init_telemetry(args: &Args) -> anyhow::Result<Option<eztasks_core::metrics::MetricsGuard>> {
    let Some(endpoint) = &args.otlp_endpoint else {
        init_tracing(DEFAULT_LOG_FILTER, args.log_json);
        return Ok(None);
    };
    let guard = eztasks_core::metrics::init_metrics(endpoint)?;
    eztasks_core::tracing_init::init_tracing_with_otel(
        DEFAULT_LOG_FILTER,
        args.log_json,
        guard.tracer(),
    );
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    #[cfg(feature = "metrics")]
    let metrics_guard = init_telemetry(&args)?;
    #[cfg(not(feature = "metrics"))]
    init_tracing(DEFAULT_LOG_FILTER, args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(tick) = args.heartbeat_tick_secs {
        config.heartbeat_tick_secs = tick;
    }
    if let Some(timeout) = args.heartbeat_timeout_secs {
        config.heartbeat_timeout_secs = timeout;
    }
    if let Some(max) = args.max_line_bytes {
        config.max_line_bytes = max;
    }
    if let Some(secs) = args.client_read_timeout_secs {
        config.client_read_timeout_secs = secs;
    }
    config.validate()?;

    let addr = config.listen_addr();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        heartbeat_tick_secs = config.heartbeat_tick_secs,
        heartbeat_timeout_secs = config.heartbeat_timeout_secs,
        max_line_bytes = config.max_line_bytes,
        client_read_timeout_secs = config.client_read_timeout_secs,
        "Starting eztasks-relay"
    );
    if config.client_read_timeout().is_none() {
        warn!("Client read deadline disabled; idle clients hold their task indefinitely");
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let registry = Arc::new(ExecutorRegistry::new());
    let router = Arc::new(RelayRouter::new(
        Arc::clone(&registry),
        RouterSettings::from_config(&config),
    ));
    let server = RelayServer::new(router);

    let shutdown = CancellationToken::new();
    let monitor = HeartbeatMonitor::new(
        Arc::clone(&registry),
        config.heartbeat_tick(),
        config.heartbeat_timeout(),
    )
    .spawn(shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received shutdown signal");
        signal_token.cancel();
    });

    server.serve(listener, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = monitor.await {
        warn!(error = %e, "Heartbeat monitor task failed");
    }

    #[cfg(feature = "metrics")]
    {
        if let Some(guard) = metrics_guard {
            guard.shutdown()?;
        }
    }

    info!("Relay stopped");
    Ok(())
}
