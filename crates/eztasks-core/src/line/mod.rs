//! Line-oriented wire protocol shared by the relay and its peers.
//!
//! Records are UTF-8 text terminated by `\n`, with an optional `\r` before
//! the terminator. [`LineFramer`] turns a byte stream into records and
//! [`protocol`] gives them meaning.

mod framer;
pub mod protocol;

pub use framer::{FrameError, LineFramer};
pub use protocol::{ExecutorRecord, Opening};
