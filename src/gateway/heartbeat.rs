// =============================================================================
// Heartbeat watchdog: one timer task per session.
//
// A session that sends nothing (no HEARTBEAT, no other frame) for longer than
// `timeout` is flagged as a zombie, which makes its registry slot evictable,
// and its driver is asked to close with 4009.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::warn;

use super::frame::CLOSE_SESSION_TIMED_OUT;
use super::metrics::{GatewayMetrics, incr};
use super::session::GatewaySession;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatWatchdog {
    check_every: Duration,
    timeout: Duration,
}

impl HeartbeatWatchdog {
    pub fn new(check_every: Duration, timeout: Duration) -> Self {
        Self {
            check_every,
            timeout,
        }
    }

    /// Runs until the session is cancelled or declared dead.
    /// Returns `true` when the session timed out.
    pub async fn watch(self, session: Arc<GatewaySession>, metrics: Arc<GatewayMetrics>) -> bool {
        let mut ticker = tokio::time::interval(self.check_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let timeout_ms = self.timeout.as_millis() as u64;
        let cancel = session.cancel_token().clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let silent_ms = session.millis_since_heartbeat();
                    if silent_ms > timeout_ms {
                        warn!(
                            conn_id = session.connection_id(),
                            shard = ?session.identity(),
                            silent_ms,
                            "heartbeat timeout, session is a zombie"
                        );
                        session.mark_zombie();
                        session.request_close(CLOSE_SESSION_TIMED_OUT);
                        incr(&metrics.heartbeat_timeouts);
                        return true;
                    }
                }
                () = cancel.cancelled() => return false,
            }
        }
    }
}
