//! Consumes the executor's line stream and tracks its liveness.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use eztasks_core::line::{ExecutorRecord, FrameError, LineFramer};

use crate::registry::{EvictionReason, ExecutorRegistry, ExecutorSession};

/// Why an executor session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection or a read failed.
    Disconnected,
    /// The peer sent a line over the configured limit.
    LineTooLong,
    /// The session was closed from outside, e.g. by the heartbeat monitor.
    Evicted,
}

/// Drive a registered executor session until its stream ends.
///
/// Heartbeat records refresh the session's liveness; every other record is
/// accepted and ignored. On exit the session is removed from `registry`
/// (a no-op if it was already evicted) and its write half is shut down.
pub async fn run_session<R>(
    session: Arc<ExecutorSession>,
    mut framer: LineFramer<R>,
    registry: Arc<ExecutorRegistry>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
{
    let session_id = session.id();
    let mut heartbeats = 0u64;

    let end = loop {
        let next = tokio::select! {
            biased;
            () = session.closed() => break SessionEnd::Evicted,
            next = framer.next_line() => next,
        };

        match next {
            Ok(Some(line)) => match ExecutorRecord::parse(&line) {
                ExecutorRecord::Heartbeat { .. } => {
                    heartbeats += 1;
                    session.touch_heartbeat(Instant::now());
                    debug!(session_id, heartbeats, "Executor heartbeat received");
                }
                ExecutorRecord::Other(text) => {
                    debug!(session_id, line = %text, "Received from executor (ignored)");
                }
            },
            Ok(None) => break SessionEnd::Disconnected,
            Err(FrameError::LineTooLong { limit }) => {
                warn!(session_id, limit, "Executor sent an oversized line, closing");
                break SessionEnd::LineTooLong;
            }
            Err(FrameError::Io(e)) => {
                debug!(session_id, error = %e, "Executor read failed");
                break SessionEnd::Disconnected;
            }
        }
    };

    info!(session_id, ?end, heartbeats, "Executor session ended");
    registry
        .evict_session(&session, EvictionReason::Disconnected)
        .await;
    session.shutdown_writer().await;
    end
}
