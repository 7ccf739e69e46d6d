//! Executor connection registry.

mod connection;

pub use connection::{
    EvictionReason, ExecutorRegistry, ExecutorSession, ExecutorWriter, RegistryGuard,
};
