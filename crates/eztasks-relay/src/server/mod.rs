//! TCP front end for the relay.

pub mod acceptor;

pub use acceptor::RelayServer;
