//! In-memory registry for the single executor connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use eztasks_core::line::protocol::encode_line;

use crate::telemetry;

/// Write half of a promoted connection.
pub type ExecutorWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Why an executor left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    HeartbeatTimeout,
    Disconnected,
    WriteFailed,
    Shutdown,
}

impl EvictionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Disconnected => "disconnected",
            Self::WriteFailed => "write_failed",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection that has been promoted to executor.
///
/// The liveness timestamp is written only by the session's own reader and
/// read by the heartbeat monitor, so it is kept lock-free as a millisecond
/// offset from registration.
pub struct ExecutorSession {
    id: u64,
    peer: SocketAddr,
    registered_at: Instant,
    last_heartbeat_ms: AtomicU64,
    writer: Mutex<ExecutorWriter>,
    closed: CancellationToken,
}

impl ExecutorSession {
    pub fn new(peer: SocketAddr, writer: ExecutorWriter) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            registered_at: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Instant of the last heartbeat, or of registration if none arrived yet.
    pub fn last_heartbeat(&self) -> Instant {
        self.registered_at + Duration::from_millis(self.last_heartbeat_ms.load(Ordering::Acquire))
    }

    /// Record a heartbeat received at `now`. Never moves the timestamp back.
    pub fn touch_heartbeat(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.registered_at).as_millis();
        let offset = u64::try_from(offset).unwrap_or(u64::MAX);
        self.last_heartbeat_ms.fetch_max(offset, Ordering::AcqRel);
    }

    /// Whether the executor has been silent for longer than `timeout`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat()) > timeout
    }

    /// Write one record, re-terminated with `\n`, to the executor.
    pub async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&encode_line(line)).await?;
        writer.flush().await
    }

    /// Signal the session's reader to stop. The reader then shuts the write
    /// half down and drops the connection.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Flush and shut down the write half. Errors are irrelevant at this
    /// point; the peer may already be gone.
    pub async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(session_id = self.id, error = %e, "Executor write half already closed");
        }
    }
}

/// Guard over the executor slot. Holding it freezes the executor's identity.
pub type RegistryGuard<'a> = MutexGuard<'a, Option<Arc<ExecutorSession>>>;

/// Thread-safe holder of the current executor, if any.
pub struct ExecutorRegistry {
    slot: Mutex<Option<Arc<ExecutorSession>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Register `session` as the executor iff the slot is empty.
    ///
    /// On `false` the caller owns the rejected connection and must close it.
    pub async fn try_register(&self, session: Arc<ExecutorSession>) -> bool {
        let mut slot = self.slot.lock().await;
        if let Some(current) = slot.as_ref() {
            warn!(
                current_id = current.id(),
                current_peer = %current.peer(),
                rejected_peer = %session.peer(),
                "Executor already connected, rejecting registration"
            );
            telemetry::executor_rejected();
            return false;
        }
        info!(session_id = session.id(), peer = %session.peer(), "Executor registered");
        *slot = Some(session);
        true
    }

    /// Snapshot of the current executor.
    pub async fn current(&self) -> Option<Arc<ExecutorSession>> {
        self.slot.lock().await.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Lock the slot for a multi-step operation such as a batch forward.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        self.slot.lock().await
    }

    /// Clear the registration and close the executor's connection.
    ///
    /// Idempotent: an empty registry is a no-op returning `None`.
    pub async fn evict(&self, reason: EvictionReason) -> Option<Arc<ExecutorSession>> {
        let mut slot = self.slot.lock().await;
        Self::evict_locked(&mut slot, reason)
    }

    /// [`evict`](Self::evict) for a caller already holding the lock.
    pub fn evict_locked(
        slot: &mut RegistryGuard<'_>,
        reason: EvictionReason,
    ) -> Option<Arc<ExecutorSession>> {
        let session = slot.take()?;
        session.close();
        info!(
            session_id = session.id(),
            peer = %session.peer(),
            reason = %reason,
            "Executor evicted"
        );
        telemetry::executor_evicted(reason);
        Some(session)
    }

    /// Clear the slot only if it still holds session `id`.
    ///
    /// The session is closed either way. Returns whether the slot was cleared;
    /// `false` means it was already evicted and possibly replaced.
    pub async fn evict_session(&self, session: &ExecutorSession, reason: EvictionReason) -> bool {
        session.close();
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|current| current.id() == session.id()) {
            Self::evict_locked(&mut slot, reason).is_some()
        } else {
            debug!(session_id = session.id(), "Executor already removed from registry");
            false
        }
    }

    /// Evict the executor if it has been silent for longer than `timeout`.
    pub async fn evict_if_stale(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> Option<Arc<ExecutorSession>> {
        let mut slot = self.slot.lock().await;
        let stale = slot.as_ref().is_some_and(|s| s.is_stale(now, timeout));
        if stale {
            Self::evict_locked(&mut slot, EvictionReason::HeartbeatTimeout)
        } else {
            None
        }
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
