//! eztasks Relay Server Library
//!
//! Core functionality for the eztasks relay:
//! - Executor registry enforcing a single executor at a time
//! - Relay router classifying connections and forwarding client lines
//! - Executor session read loop with heartbeat tracking
//! - Heartbeat monitor evicting silent executors
//! - TCP acceptor with supervised per-connection tasks

pub mod heartbeat;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
mod telemetry;
