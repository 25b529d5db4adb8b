use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide gateway counters. All updates are `Relaxed`; readers only
/// need eventually consistent totals.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub connections_accepted: AtomicU64,
    pub connections_refused: AtomicU64,
    pub connections_active: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub identify_accepted: AtomicU64,
    pub identify_rejected: AtomicU64,
    pub zombie_evictions: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub heartbeats: AtomicU64,
    pub forced_closes: AtomicU64,
    pub events_dispatched: AtomicU64,
    pub events_delivered: AtomicU64,
    pub events_dropped: AtomicU64,
    /// Skipped because the session lacks the event's intent.
    pub events_filtered: AtomicU64,
    pub bytes_flushed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub connections_active: u64,
    pub handshake_failures: u64,
    pub identify_accepted: u64,
    pub identify_rejected: u64,
    pub zombie_evictions: u64,
    pub heartbeat_timeouts: u64,
    pub heartbeats: u64,
    pub forced_closes: u64,
    pub events_dispatched: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub events_filtered: u64,
    pub bytes_flushed: u64,
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

pub(crate) fn decr(counter: &AtomicU64) {
    // Saturate at zero; a mismatched decrement must not wrap.
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_accepted: get(&self.connections_accepted),
            connections_refused: get(&self.connections_refused),
            connections_active: get(&self.connections_active),
            handshake_failures: get(&self.handshake_failures),
            identify_accepted: get(&self.identify_accepted),
            identify_rejected: get(&self.identify_rejected),
            zombie_evictions: get(&self.zombie_evictions),
            heartbeat_timeouts: get(&self.heartbeat_timeouts),
            heartbeats: get(&self.heartbeats),
            forced_closes: get(&self.forced_closes),
            events_dispatched: get(&self.events_dispatched),
            events_delivered: get(&self.events_delivered),
            events_dropped: get(&self.events_dropped),
            events_filtered: get(&self.events_filtered),
            bytes_flushed: get(&self.bytes_flushed),
        }
    }
}
