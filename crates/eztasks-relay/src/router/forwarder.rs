//! Relay router: classifies connections and forwards client batches to the
//! executor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, instrument, warn};

use eztasks_core::RelayConfig;
use eztasks_core::line::{FrameError, LineFramer, Opening};

use crate::registry::{EvictionReason, ExecutorRegistry, ExecutorSession};
use crate::session::{SessionEnd, run_session};
use crate::telemetry;

/// Tunables for connection handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    /// Longest accepted line, terminator excluded.
    pub max_line_bytes: usize,
    /// Time allowed, from accept, for a connection to send its opening line
    /// and, as a client, its whole batch. `None` waits indefinitely.
    pub client_read_timeout: Option<Duration>,
    /// Upper bound on a single write to the executor. A stalled executor
    /// would otherwise hold the registry lock and block its own eviction.
    pub executor_write_timeout: Duration,
}

impl RouterSettings {
    pub const fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_line_bytes: config.max_line_bytes,
            client_read_timeout: config.client_read_timeout(),
            executor_write_timeout: config.heartbeat_timeout(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// What happened to one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Closed before sending a complete line.
    Empty,
    /// Asked to become executor while one was registered.
    ExecutorRejected,
    /// Served as the executor until the session ended.
    ExecutorSession(SessionEnd),
    /// Client lines written to the executor.
    Forwarded(usize),
    /// Client lines discarded because no executor was registered.
    Dropped(usize),
    /// The connection broke the framing rules; nothing was forwarded.
    FramingFailed,
    /// Writing to the executor failed after this many lines; it was evicted.
    ForwardFailed(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Executor write failed after {forwarded} lines: {source}")]
    ExecutorWrite {
        forwarded: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Executor write timed out after {forwarded} lines")]
    ExecutorWriteTimeout { forwarded: usize },
}

impl RouterError {
    pub const fn forwarded(&self) -> usize {
        match self {
            Self::ExecutorWrite { forwarded, .. } | Self::ExecutorWriteTimeout { forwarded } => {
                *forwarded
            }
        }
    }
}

/// Routes each connection either into the executor slot or through it.
pub struct RelayRouter {
    registry: Arc<ExecutorRegistry>,
    settings: RouterSettings,
}

impl RelayRouter {
    pub const fn new(registry: Arc<ExecutorRegistry>, settings: RouterSettings) -> Self {
        Self { registry, settings }
    }

    pub const fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Handle an accepted TCP connection to completion.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> ConnectionOutcome {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        self.route(reader, writer, peer).await
    }

    /// Handle one connection given its two halves.
    ///
    /// The first line decides the role. Both halves are dropped, closing the
    /// connection, when this returns.
    pub async fn route<R, W>(&self, reader: R, writer: W, peer: SocketAddr) -> ConnectionOutcome
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut framer = LineFramer::new(reader, self.settings.max_line_bytes);
        let deadline = self
            .settings
            .client_read_timeout
            .and_then(|d| Instant::now().checked_add(d));

        let first = match read_client_line(&mut framer, deadline).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Connection closed without a complete line");
                return ConnectionOutcome::Empty;
            }
            Err(e) => {
                warn!(error = %e, "Closing connection after framing error");
                return ConnectionOutcome::FramingFailed;
            }
        };

        match Opening::classify(&first) {
            Opening::Executor => self.promote(framer, writer, peer).await,
            Opening::Client => {
                info!("Client connected");
                let batch = match drain_client(framer, first, deadline).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "Discarding client batch after framing error");
                        return ConnectionOutcome::FramingFailed;
                    }
                };
                match self.forward_batch(&batch).await {
                    Ok(outcome) => outcome,
                    Err(e) => ConnectionOutcome::ForwardFailed(e.forwarded()),
                }
            }
        }
    }

    /// Forward a client's batch under a single registry critical section.
    ///
    /// With no executor registered every line is dropped. The lock is held
    /// across all writes so the executor cannot be replaced or evicted
    /// mid-batch.
    pub async fn forward_batch(&self, lines: &[String]) -> Result<ConnectionOutcome, RouterError> {
        let mut slot = self.registry.lock().await;
        let Some(executor) = slot.as_ref().map(Arc::clone) else {
            for line in lines {
                warn!(line = %line, "Executor offline, dropping");
            }
            telemetry::lines_dropped(lines.len());
            return Ok(ConnectionOutcome::Dropped(lines.len()));
        };

        for (forwarded, line) in lines.iter().enumerate() {
            if let Err(e) = self.send_to_executor(&executor, line, forwarded).await {
                warn!(session_id = executor.id(), error = %e, "Evicting unwritable executor");
                telemetry::lines_forwarded(forwarded);
                ExecutorRegistry::evict_locked(&mut slot, EvictionReason::WriteFailed);
                return Err(e);
            }
            debug!(session_id = executor.id(), line = %line, "Forwarded client line to executor");
        }
        telemetry::lines_forwarded(lines.len());
        info!(session_id = executor.id(), lines = lines.len(), "Forwarded client batch");
        Ok(ConnectionOutcome::Forwarded(lines.len()))
    }

    async fn send_to_executor(
        &self,
        executor: &ExecutorSession,
        line: &str,
        forwarded: usize,
    ) -> Result<(), RouterError> {
        match timeout(self.settings.executor_write_timeout, executor.send_line(line)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(RouterError::ExecutorWrite { forwarded, source }),
            Err(_) => Err(RouterError::ExecutorWriteTimeout { forwarded }),
        }
    }

    async fn promote<R, W>(
        &self,
        framer: LineFramer<R>,
        writer: W,
        peer: SocketAddr,
    ) -> ConnectionOutcome
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = Arc::new(ExecutorSession::new(peer, Box::new(writer)));
        if !self.registry.try_register(Arc::clone(&session)).await {
            return ConnectionOutcome::ExecutorRejected;
        }
        let end = run_session(session, framer, Arc::clone(&self.registry)).await;
        ConnectionOutcome::ExecutorSession(end)
    }
}

/// Read every remaining client line. The stream ends on EOF, on a read error,
/// or when the connection deadline passes; all three keep what was read.
async fn drain_client<R>(
    mut framer: LineFramer<R>,
    first: String,
    deadline: Option<Instant>,
) -> Result<Vec<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = vec![first];
    loop {
        match read_client_line(&mut framer, deadline).await {
            Ok(Some(line)) => lines.push(line),
            Ok(None) => return Ok(lines),
            Err(FrameError::Io(e)) => {
                debug!(error = %e, lines = lines.len(), "Client read failed, treating as disconnect");
                return Ok(lines);
            }
            Err(e @ FrameError::LineTooLong { .. }) => return Err(e),
        }
    }
}

/// Read one line unless the connection deadline has passed. A deadline hit is
/// reported as end of stream.
async fn read_client_line<R>(
    framer: &mut LineFramer<R>,
    deadline: Option<Instant>,
) -> Result<Option<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let Some(deadline) = deadline else {
        return framer.next_line().await;
    };
    if let Ok(next) = timeout_at(deadline, framer.next_line()).await {
        next
    } else {
        debug!("Client connection deadline reached");
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    fn router_with(settings: RouterSettings) -> Arc<RelayRouter> {
        Arc::new(RelayRouter::new(Arc::new(ExecutorRegistry::new()), settings))
    }

    fn router() -> Arc<RelayRouter> {
        router_with(RouterSettings {
            max_line_bytes: 64,
            client_read_timeout: Some(Duration::from_secs(5)),
            executor_write_timeout: Duration::from_secs(5),
        })
    }

    /// Register an executor directly, returning the side the executor reads.
    async fn register_executor(router: &RelayRouter) -> (Arc<ExecutorSession>, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(1024);
        let session = Arc::new(ExecutorSession::new(peer(), Box::new(writer)));
        assert!(router.registry().try_register(Arc::clone(&session)).await);
        (session, reader)
    }

    async fn route_bytes(router: &RelayRouter, input: &[u8]) -> ConnectionOutcome {
        router.route(input, tokio::io::sink(), peer()).await
    }

    #[tokio::test]
    async fn forwards_client_lines_in_order() {
        let router = router();
        let (session, mut executor_rx) = register_executor(&router).await;

        let outcome = route_bytes(&router, b"a\r\nb\nc\n").await;
        assert_eq!(outcome, ConnectionOutcome::Forwarded(3));

        session.shutdown_writer().await;
        let mut received = String::new();
        executor_rx.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn drops_lines_without_executor() {
        let router = router();
        assert_eq!(
            route_bytes(&router, b"x\ny\n").await,
            ConnectionOutcome::Dropped(2)
        );

        // A later executor never sees the dropped lines.
        let (session, mut executor_rx) = register_executor(&router).await;
        assert_eq!(
            route_bytes(&router, b"z\n").await,
            ConnectionOutcome::Forwarded(1)
        );
        session.shutdown_writer().await;
        let mut received = String::new();
        executor_rx.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "z\n");
    }

    #[tokio::test]
    async fn empty_connection_is_noop() {
        let router = router();
        assert_eq!(route_bytes(&router, b"").await, ConnectionOutcome::Empty);
        assert_eq!(
            route_bytes(&router, b"no terminator").await,
            ConnectionOutcome::Empty
        );
    }

    #[tokio::test]
    async fn oversized_client_line_discards_batch() {
        let router = router();
        let (session, mut executor_rx) = register_executor(&router).await;

        let long = "y".repeat(100);
        let input = format!("ok\n{long}\n");
        assert_eq!(
            route_bytes(&router, input.as_bytes()).await,
            ConnectionOutcome::FramingFailed
        );

        session.shutdown_writer().await;
        let mut received = String::new();
        executor_rx.read_to_string(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn second_executor_is_rejected() {
        let router = router();
        let (first, _executor_rx) = register_executor(&router).await;

        let outcome = route_bytes(&router, b"executor\nheartbeat::1\n").await;
        assert_eq!(outcome, ConnectionOutcome::ExecutorRejected);
        assert_eq!(router.registry().current().await.unwrap().id(), first.id());
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn executor_handshake_promotes_until_disconnect() {
        let router = router();
        let (relay_read, mut peer_tx) = tokio::io::duplex(256);
        let (relay_write, _peer_rx) = tokio::io::duplex(256);

        let task = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.route(relay_read, relay_write, peer()).await })
        };

        peer_tx.write_all(b"executor\n").await.unwrap();
        while !router.registry().is_registered().await {
            tokio::task::yield_now().await;
        }

        drop(peer_tx);
        assert_eq!(
            task.await.unwrap(),
            ConnectionOutcome::ExecutorSession(SessionEnd::Disconnected)
        );
        assert!(!router.registry().is_registered().await);
    }

    #[tokio::test]
    async fn executor_with_trailing_space_is_a_client() {
        let router = router();
        assert_eq!(
            route_bytes(&router, b"executor \n").await,
            ConnectionOutcome::Dropped(1)
        );
        assert!(!router.registry().is_registered().await);
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_flushes_partial_batch() {
        let router = router();
        let (session, mut executor_rx) = register_executor(&router).await;
        let (relay_read, mut client_tx) = tokio::io::duplex(256);

        client_tx.write_all(b"first\nsecond\n").await.unwrap();
        // Client stays connected but silent; the deadline ends its stream.
        let outcome = router.route(relay_read, tokio::io::sink(), peer()).await;
        assert_eq!(outcome, ConnectionOutcome::Forwarded(2));

        session.shutdown_writer().await;
        let mut received = String::new();
        executor_rx.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "first\nsecond\n");
        drop(client_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_bounds_the_whole_client_connection() {
        let router = router();
        let (relay_read, mut client_tx) = tokio::io::duplex(256);

        // One short line every 4s never idles past the 5s deadline.
        let feeder = tokio::spawn(async move {
            for i in 0u32.. {
                if client_tx.write_all(format!("l{i}\n").as_bytes()).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(4)).await;
            }
        });

        let started = Instant::now();
        let outcome = router.route(relay_read, tokio::io::sink(), peer()).await;
        assert_eq!(outcome, ConnectionOutcome::Dropped(2));
        assert!(started.elapsed() < Duration::from_secs(6));
        feeder.abort();
    }

    #[tokio::test]
    async fn broken_executor_is_evicted_on_write_failure() {
        let router = router();
        let (session, executor_rx) = register_executor(&router).await;
        drop(executor_rx);

        let outcome = route_bytes(&router, b"a\nb\n").await;
        assert_eq!(outcome, ConnectionOutcome::ForwardFailed(0));
        assert!(session.is_closed());
        assert!(!router.registry().is_registered().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_executor_write_times_out() {
        let router = router();
        // Tiny pipe that nobody drains.
        let (writer, _executor_rx) = tokio::io::duplex(4);
        let session = Arc::new(ExecutorSession::new(peer(), Box::new(writer)));
        assert!(router.registry().try_register(Arc::clone(&session)).await);

        let outcome = route_bytes(&router, b"a long command line\n").await;
        assert_eq!(outcome, ConnectionOutcome::ForwardFailed(0));
        assert!(!router.registry().is_registered().await);
    }
}
