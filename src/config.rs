use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::gateway::buffer::{DEFAULT_CAPACITY, DEFAULT_HIGH_WATERMARK};
use crate::gateway::frame::DEFAULT_MAX_PAYLOAD;
use crate::gateway::handshake::DEFAULT_MAX_REQUEST_BYTES;
use crate::gateway::payload::DEFAULT_MAX_SHARDS;
use crate::telemetry::LogFormat;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 41_250;
/// 41.25s * 1.1 ~= 45s before a silent session is a zombie.
pub const DEFAULT_HEARTBEAT_GRACE: f64 = 1.1;
pub const DEFAULT_WATCHDOG_TICK_MS: u64 = 1_000;
pub const DEFAULT_IDENTIFY_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10;
pub const DEFAULT_FLUSH_MAX_BYTES: usize = 4_096;
pub const DEFAULT_LAG_THRESHOLD: u64 = 3;
pub const DEFAULT_FORCE_CLOSE_PERCENT: f64 = 95.0;
pub const DEFAULT_EVICTION_GRACE_MS: u64 = 8_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("buffer_capacity must be a non-zero power of two, got {0}")]
    BufferCapacity(usize),
    #[error("{name} must be in {range}, got {value}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f64,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub max_frame_payload: usize,
    pub max_handshake_bytes: usize,
    pub heartbeat_interval: Duration,
    /// Multiplier on `heartbeat_interval` before a silent session is dead.
    pub heartbeat_grace: f64,
    pub watchdog_tick: Duration,
    pub identify_timeout: Duration,
    pub buffer_capacity: usize,
    pub high_watermark: f64,
    pub flush_interval: Duration,
    /// Bytes drained per connection per flush tick.
    pub flush_max_bytes: usize,
    /// Eviction triggers once refusals plus watermark hits exceed this.
    pub lag_threshold: u64,
    pub force_close_percent: f64,
    /// New sessions are exempt from backpressure eviction for this long.
    pub eviction_grace: Duration,
    pub write_timeout: Duration,
    pub max_shards: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
            max_handshake_bytes: DEFAULT_MAX_REQUEST_BYTES,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
            watchdog_tick: Duration::from_millis(DEFAULT_WATCHDOG_TICK_MS),
            identify_timeout: Duration::from_millis(DEFAULT_IDENTIFY_TIMEOUT_MS),
            buffer_capacity: DEFAULT_CAPACITY,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            flush_max_bytes: DEFAULT_FLUSH_MAX_BYTES,
            lag_threshold: DEFAULT_LAG_THRESHOLD,
            force_close_percent: DEFAULT_FORCE_CLOSE_PERCENT,
            eviction_grace: Duration::from_millis(DEFAULT_EVICTION_GRACE_MS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            max_shards: DEFAULT_MAX_SHARDS,
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval.mul_f64(self.heartbeat_grace)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 || !self.buffer_capacity.is_power_of_two() {
            return Err(ConfigError::BufferCapacity(self.buffer_capacity));
        }
        if !(self.high_watermark > 0.0 && self.high_watermark <= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "high_watermark",
                range: "(0, 1]",
                value: self.high_watermark,
            });
        }
        if !(self.force_close_percent > 0.0 && self.force_close_percent <= 100.0) {
            return Err(ConfigError::OutOfRange {
                name: "force_close_percent",
                range: "(0, 100]",
                value: self.force_close_percent,
            });
        }
        if !(self.heartbeat_grace >= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "heartbeat_grace",
                range: "[1, inf)",
                value: self.heartbeat_grace,
            });
        }
        let nonzero = [
            ("max_connections", self.max_connections == 0),
            ("max_frame_payload", self.max_frame_payload == 0),
            ("max_handshake_bytes", self.max_handshake_bytes == 0),
            ("flush_max_bytes", self.flush_max_bytes == 0),
            ("max_shards", self.max_shards == 0),
            ("heartbeat_interval", self.heartbeat_interval.is_zero()),
            ("watchdog_tick", self.watchdog_tick.is_zero()),
            ("identify_timeout", self.identify_timeout.is_zero()),
            ("flush_interval", self.flush_interval.is_zero()),
            ("write_timeout", self.write_timeout.is_zero()),
        ];
        if let Some((name, _)) = nonzero.into_iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Zero(name));
        }
        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "shardgate", about = "Sharded WebSocket gateway")]
pub struct Cli {
    /// Listen address
    #[arg(long, env = "SHARDGATE_BIND", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// Connections beyond this are closed right after accept
    #[arg(long, env = "SHARDGATE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Largest accepted frame payload in bytes
    #[arg(long, env = "SHARDGATE_MAX_FRAME_PAYLOAD", default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_frame_payload: usize,

    /// Largest accepted upgrade request head in bytes
    #[arg(long, env = "SHARDGATE_MAX_HANDSHAKE_BYTES", default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    pub max_handshake_bytes: usize,

    /// Heartbeat interval announced in HELLO (ms)
    #[arg(long, env = "SHARDGATE_HEARTBEAT_INTERVAL_MS", default_value_t = DEFAULT_HEARTBEAT_INTERVAL_MS)]
    pub heartbeat_interval_ms: u64,

    /// Multiplier on the heartbeat interval before a session is a zombie
    #[arg(long, env = "SHARDGATE_HEARTBEAT_GRACE", default_value_t = DEFAULT_HEARTBEAT_GRACE)]
    pub heartbeat_grace: f64,

    /// Time allowed between HELLO and IDENTIFY (ms)
    #[arg(long, env = "SHARDGATE_IDENTIFY_TIMEOUT_MS", default_value_t = DEFAULT_IDENTIFY_TIMEOUT_MS)]
    pub identify_timeout_ms: u64,

    /// Per-connection outbound buffer size (power of two)
    #[arg(long, env = "SHARDGATE_BUFFER_CAPACITY", default_value_t = DEFAULT_CAPACITY)]
    pub buffer_capacity: usize,

    /// Buffer fraction that raises the early-warning signal
    #[arg(long, env = "SHARDGATE_HIGH_WATERMARK", default_value_t = DEFAULT_HIGH_WATERMARK)]
    pub high_watermark: f64,

    /// Flush cycle period (ms)
    #[arg(long, env = "SHARDGATE_FLUSH_INTERVAL_MS", default_value_t = DEFAULT_FLUSH_INTERVAL_MS)]
    pub flush_interval_ms: u64,

    /// Bytes drained per connection per flush
    #[arg(long, env = "SHARDGATE_FLUSH_MAX_BYTES", default_value_t = DEFAULT_FLUSH_MAX_BYTES)]
    pub flush_max_bytes: usize,

    /// Lag above which a session is force-closed
    #[arg(long, env = "SHARDGATE_LAG_THRESHOLD", default_value_t = DEFAULT_LAG_THRESHOLD)]
    pub lag_threshold: u64,

    /// Buffer usage (percent) that force-closes a session
    #[arg(long, env = "SHARDGATE_FORCE_CLOSE_PERCENT", default_value_t = DEFAULT_FORCE_CLOSE_PERCENT)]
    pub force_close_percent: f64,

    /// Age before a session is subject to backpressure eviction (ms)
    #[arg(long, env = "SHARDGATE_EVICTION_GRACE_MS", default_value_t = DEFAULT_EVICTION_GRACE_MS)]
    pub eviction_grace_ms: u64,

    /// Deadline for a blocking socket write (ms)
    #[arg(long, env = "SHARDGATE_WRITE_TIMEOUT_MS", default_value_t = DEFAULT_WRITE_TIMEOUT_MS)]
    pub write_timeout_ms: u64,

    /// Highest num_shards a client may identify with
    #[arg(long, env = "SHARDGATE_MAX_SHARDS", default_value_t = DEFAULT_MAX_SHARDS)]
    pub max_shards: u32,

    /// Log output format
    #[arg(long, env = "SHARDGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn into_config(self) -> Result<GatewayConfig, ConfigError> {
        let config = GatewayConfig {
            bind_addr: self.bind,
            max_connections: self.max_connections,
            max_frame_payload: self.max_frame_payload,
            max_handshake_bytes: self.max_handshake_bytes,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_grace: self.heartbeat_grace,
            identify_timeout: Duration::from_millis(self.identify_timeout_ms),
            buffer_capacity: self.buffer_capacity,
            high_watermark: self.high_watermark,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            flush_max_bytes: self.flush_max_bytes,
            lag_threshold: self.lag_threshold,
            force_close_percent: self.force_close_percent,
            eviction_grace: Duration::from_millis(self.eviction_grace_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            max_shards: self.max_shards,
            ..GatewayConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
