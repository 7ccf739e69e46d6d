//! Periodic task that evicts an executor whose heartbeats have stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ExecutorRegistry;

/// Polls the registry every `tick` and evicts the executor once it has been
/// silent for longer than `timeout`.
///
/// Eviction latency is bounded by the tick period: an executor that goes
/// quiet is removed on the first tick after the timeout elapses.
pub struct HeartbeatMonitor {
    registry: Arc<ExecutorRegistry>,
    tick: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub const fn new(registry: Arc<ExecutorRegistry>, tick: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            tick,
            timeout,
        }
    }

    /// Run one check. Returns the evicted session's id, if any.
    pub async fn check(&self) -> Option<u64> {
        let evicted = self
            .registry
            .evict_if_stale(Instant::now(), self.timeout)
            .await?;
        warn!(
            session_id = evicted.id(),
            peer = %evicted.peer(),
            timeout_secs = self.timeout.as_secs(),
            "Executor heartbeat timeout, disconnecting"
        );
        Some(evicted.id())
    }

    /// Tick until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut timer = tokio::time::interval(self.tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        info!(
            tick_secs = self.tick.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "Heartbeat monitor started"
        );
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if self.check().await.is_none() {
                        debug!("Heartbeat check passed");
                    }
                }
                () = shutdown.cancelled() => {
                    info!("Heartbeat monitor shutting down");
                    return;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
