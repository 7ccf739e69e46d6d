//! Relay counters. No-ops unless the `metrics` feature is enabled.

#[cfg(feature = "metrics")]
use eztasks_core::metrics::RelayCounters;

use crate::registry::EvictionReason;

pub fn lines_forwarded(n: usize) {
    #[cfg(feature = "metrics")]
    RelayCounters::global().lines_forwarded(u64::try_from(n).unwrap_or(u64::MAX));
    #[cfg(not(feature = "metrics"))]
    let _ = n;
}

pub fn lines_dropped(n: usize) {
    #[cfg(feature = "metrics")]
    RelayCounters::global().lines_dropped(u64::try_from(n).unwrap_or(u64::MAX));
    #[cfg(not(feature = "metrics"))]
    let _ = n;
}

pub fn executor_evicted(reason: EvictionReason) {
    #[cfg(feature = "metrics")]
    RelayCounters::global().eviction(reason.as_str());
    #[cfg(not(feature = "metrics"))]
    let _ = reason;
}

pub fn executor_rejected() {
    #[cfg(feature = "metrics")]
    RelayCounters::global().rejection();
}
