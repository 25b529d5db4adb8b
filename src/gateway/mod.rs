pub mod backpressure;
pub mod buffer;
pub mod fanout;
pub mod frame;
pub mod handshake;
pub mod heartbeat;
pub mod intents;
pub mod metrics;
pub mod payload;
pub mod registry;
pub mod server;
pub mod session;
pub mod shard;
