//! Sharded WebSocket gateway.
//!
//! Clients upgrade over RFC 6455, IDENTIFY as one `[shard_id, num_shards]`
//! slot and then receive the events routed to that shard. At most one live
//! session holds a slot at a time; a session that stops heartbeating is
//! evicted, and one that cannot drain its outbound buffer is force-closed.

pub mod config;
pub mod gateway;
pub mod telemetry;

pub use config::{Cli, GatewayConfig};
pub use gateway::fanout::DispatchEvent;
pub use gateway::registry::ShardRegistry;
pub use gateway::server::{GatewayHandle, GatewayServer, ServerError};
pub use gateway::shard::ShardIdentity;
