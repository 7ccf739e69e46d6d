//! Executor session: the read loop of a promoted connection.

mod executor;

pub use executor::{SessionEnd, run_session};
