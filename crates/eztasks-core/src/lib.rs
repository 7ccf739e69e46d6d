//! `eztasks` Core Library
//!
//! Shared functionality for `eztasks` components:
//! - Line framing for the relay's text protocol
//! - Wire-protocol record classification
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod line;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::RelayConfig;
pub use error::{Error, Result};
