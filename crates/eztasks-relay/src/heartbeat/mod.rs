//! Heartbeat-driven executor failure detection.

mod monitor;

pub use monitor::HeartbeatMonitor;
