//! Connection classification and client-to-executor forwarding.

pub mod forwarder;

pub use forwarder::{ConnectionOutcome, RelayRouter, RouterError, RouterSettings};
