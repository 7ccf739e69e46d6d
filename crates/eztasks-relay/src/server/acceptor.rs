//! Accept loop that dispatches each connection to its own supervised task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::EvictionReason;
use crate::router::{ConnectionOutcome, RelayRouter};

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Owns the listener loop and the set of live connection tasks.
pub struct RelayServer {
    router: Arc<RelayRouter>,
}

impl RelayServer {
    pub const fn new(router: Arc<RelayRouter>) -> Self {
        Self { router }
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Every connection runs in its own task inside a [`JoinSet`]; finished
    /// tasks are reaped as they complete so panics surface in the log. On
    /// shutdown the executor is evicted and remaining tasks are aborted.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        let local = listener.local_addr().ok();
        info!(addr = ?local, "Relay accepting connections");

        let mut tasks: JoinSet<(SocketAddr, ConnectionOutcome)> = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, active = tasks.len(), "Accepted connection");
                        let router = Arc::clone(&self.router);
                        tasks.spawn(async move {
                            let outcome = router.handle_connection(stream, peer).await;
                            (peer, outcome)
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_finished(joined);
                }
            }
        }

        info!(active = tasks.len(), "Relay shutting down");
        self.router.registry().evict(EvictionReason::Shutdown).await;
        tasks.shutdown().await;
    }
}

fn log_finished(joined: Result<(SocketAddr, ConnectionOutcome), JoinError>) {
    match joined {
        Ok((peer, outcome)) => debug!(peer = %peer, ?outcome, "Connection closed"),
        Err(e) if e.is_panic() => error!(error = %e, "Connection task panicked"),
        Err(e) => debug!(error = %e, "Connection task cancelled"),
    }
}
