//! Configuration resolution for the eztasks relay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/eztasks/relay.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 20001;

/// Default heartbeat monitor tick period, in seconds.
pub const DEFAULT_HEARTBEAT_TICK_SECS: u64 = 5;

/// Default heartbeat timeout, in seconds (4x the tick period).
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 20;

/// Default maximum length of a single line, terminator excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Default time an ordinary client connection has to deliver its batch.
pub const DEFAULT_CLIENT_READ_TIMEOUT_SECS: u64 = 30;

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the listener binds to.
    pub bind_addr: IpAddr,
    pub port: u16,
    /// How often the heartbeat monitor checks the executor.
    pub heartbeat_tick_secs: u64,
    /// Silence after which the executor is evicted.
    pub heartbeat_timeout_secs: u64,
    pub max_line_bytes: usize,
    /// Deadline, from accept, for a client to send its whole batch. `0`
    /// disables it.
    pub client_read_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            heartbeat_tick_secs: DEFAULT_HEARTBEAT_TICK_SECS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            client_read_timeout_secs: DEFAULT_CLIENT_READ_TIMEOUT_SECS,
        }
    }
}

impl RelayConfig {
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub const fn heartbeat_tick(&self) -> Duration {
        Duration::from_secs(self.heartbeat_tick_secs)
    }

    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Client connection deadline, or `None` when clients may stay open
    /// indefinitely.
    pub const fn client_read_timeout(&self) -> Option<Duration> {
        if self.client_read_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.client_read_timeout_secs))
        }
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_tick_secs == 0 {
            return Err(Error::Config(
                "heartbeat_tick_secs must be greater than zero".into(),
            ));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_tick_secs {
            return Err(Error::Config(format!(
                "heartbeat_timeout_secs ({}) must exceed heartbeat_tick_secs ({})",
                self.heartbeat_timeout_secs, self.heartbeat_tick_secs
            )));
        }
        if self.max_line_bytes == 0 {
            return Err(Error::Config(
                "max_line_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// A settings file layer. Absent keys leave the lower layer untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigLayer {
    bind_addr: Option<IpAddr>,
    port: Option<u16>,
    heartbeat_tick_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
    max_line_bytes: Option<usize>,
    client_read_timeout_secs: Option<u64>,
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` must exist when given; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<RelayConfig> {
    let mut config = RelayConfig::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(path) = explicit {
        let layer = load_config_file(path)?;
        merge_config(&mut config, layer);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("eztasks").join("relay.json"))
}

fn load_config_file(path: &Path) -> Result<ConfigLayer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut RelayConfig, overlay: ConfigLayer) {
    if let Some(v) = overlay.bind_addr {
        base.bind_addr = v;
    }
    if let Some(v) = overlay.port {
        base.port = v;
    }
    if let Some(v) = overlay.heartbeat_tick_secs {
        base.heartbeat_tick_secs = v;
    }
    if let Some(v) = overlay.heartbeat_timeout_secs {
        base.heartbeat_timeout_secs = v;
    }
    if let Some(v) = overlay.max_line_bytes {
        base.max_line_bytes = v;
    }
    if let Some(v) = overlay.client_read_timeout_secs {
        base.client_read_timeout_secs = v;
    }
}

/// Apply `EZTASKS_*` overrides. Unparseable values are ignored with a warning.
fn apply_env_overrides(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
        let raw = raw?;
        raw.parse().map_or_else(
            |_| {
                tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
                None
            },
            Some,
        )
    }

    if let Some(v) = parse("EZTASKS_BIND", lookup("EZTASKS_BIND")) {
        config.bind_addr = v;
    }
    if let Some(v) = parse("EZTASKS_PORT", lookup("EZTASKS_PORT")) {
        config.port = v;
    }
    if let Some(v) = parse(
        "EZTASKS_HEARTBEAT_TICK_SECS",
        lookup("EZTASKS_HEARTBEAT_TICK_SECS"),
    ) {
        config.heartbeat_tick_secs = v;
    }
    if let Some(v) = parse(
        "EZTASKS_HEARTBEAT_TIMEOUT_SECS",
        lookup("EZTASKS_HEARTBEAT_TIMEOUT_SECS"),
    ) {
        config.heartbeat_timeout_secs = v;
    }
    if let Some(v) = parse("EZTASKS_MAX_LINE_BYTES", lookup("EZTASKS_MAX_LINE_BYTES")) {
        config.max_line_bytes = v;
    }
    if let Some(v) = parse(
        "EZTASKS_CLIENT_READ_TIMEOUT_SECS",
        lookup("EZTASKS_CLIENT_READ_TIMEOUT_SECS"),
    ) {
        config.client_read_timeout_secs = v;
    }
}
