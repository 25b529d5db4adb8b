use std::fmt;
use std::time::Duration;

use super::buffer::BufferMonitor;

/// Why a session is being dropped for not keeping up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvictReason {
    /// Refused writes plus high-watermark hits exceeded the threshold.
    Lagging { lag: u64 },
    /// Buffer occupancy reached the force-close level.
    BufferFull { usage_percent: f64 },
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lagging { lag } => write!(f, "lag {lag} over threshold"),
            Self::BufferFull { usage_percent } => write!(f, "buffer {usage_percent:.1}% full"),
        }
    }
}

/// Eviction rule applied to every open session on each flush tick.
#[derive(Debug, Clone, Copy)]
pub struct BackpressurePolicy {
    pub lag_threshold: u64,
    pub force_close_percent: f64,
    pub grace: Duration,
}

impl BackpressurePolicy {
    /// `age` is the time since the session was accepted; younger sessions
    /// are never evicted.
    pub fn check(&self, age: Duration, buffer: &BufferMonitor) -> Option<EvictReason> {
        if age < self.grace {
            return None;
        }
        let lag = buffer.lag_counter() + buffer.watermark_hits();
        if lag > self.lag_threshold {
            return Some(EvictReason::Lagging { lag });
        }
        let usage_percent = buffer.usage_percent();
        if usage_percent >= self.force_close_percent {
            return Some(EvictReason::BufferFull { usage_percent });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::buffer::ConnectionBuffer;

    fn policy() -> BackpressurePolicy {
        BackpressurePolicy {
            lag_threshold: 3,
            force_close_percent: 95.0,
            grace: Duration::from_secs(8),
        }
    }

    #[test]
    fn test_grace_period_protects_new_sessions() {
        let (mut tx, _rx) = ConnectionBuffer::with_capacity(16).unwrap().split();
        let monitor = tx.monitor();
        for _ in 0..10 {
            tx.try_write(&[0u8; 32]);
        }
        assert_eq!(monitor.lag_counter(), 10);
        assert_eq!(policy().check(Duration::from_secs(7), &monitor), None);
        assert_eq!(
            policy().check(Duration::from_secs(8), &monitor),
            Some(EvictReason::Lagging { lag: 10 })
        );
    }

    #[test]
    fn test_lag_must_exceed_threshold() {
        let (mut tx, _rx) = ConnectionBuffer::with_capacity(16).unwrap().split();
        let monitor = tx.monitor();
        for _ in 0..3 {
            tx.try_write(&[0u8; 32]);
        }
        assert_eq!(policy().check(Duration::from_secs(60), &monitor), None);
        tx.try_write(&[0u8; 32]);
        assert!(matches!(
            policy().check(Duration::from_secs(60), &monitor),
            Some(EvictReason::Lagging { lag: 4 })
        ));
    }

    #[test]
    fn test_watermark_hits_count_toward_lag() {
        let (mut tx, mut rx) = ConnectionBuffer::with_capacity(16).unwrap().split();
        let monitor = tx.monitor();
        for _ in 0..4 {
            assert!(tx.try_write(&[0u8; 14]));
            rx.read(16);
        }
        assert_eq!(monitor.lag_counter(), 0);
        assert_eq!(monitor.watermark_hits(), 4);
        assert!(matches!(
            policy().check(Duration::from_secs(60), &monitor),
            Some(EvictReason::Lagging { lag: 4 })
        ));
    }

    #[test]
    fn test_full_buffer_triggers() {
        let (mut tx, _rx) = ConnectionBuffer::with_capacity(64).unwrap().split();
        let monitor = tx.monitor();
        let strict = BackpressurePolicy {
            lag_threshold: 100,
            force_close_percent: 50.0,
            ..policy()
        };
        assert!(tx.try_write(&[1u8; 31]));
        assert_eq!(strict.check(Duration::from_secs(9), &monitor), None);
        assert!(tx.try_write(&[1u8; 1]));
        assert_eq!(
            strict.check(Duration::from_secs(9), &monitor),
            Some(EvictReason::BufferFull { usage_percent: 50.0 })
        );
    }
}
