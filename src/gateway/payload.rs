//! Gateway JSON payloads carried in text frames.
//!
//! Every payload has the envelope `{"op": <u8>, "d": <data>}`; dispatches add
//! `"t"` (event name) and `"s"` (sequence).

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

use super::shard::{ShardError, ShardIdentity};

pub const DEFAULT_MAX_SHARDS: u32 = 4096;
pub const GATEWAY_VERSION: u8 = 10;
pub const TOKEN_PATTERN: &str = r"^Bot [A-Za-z0-9._-]{20,}$";

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(TOKEN_PATTERN).expect("token pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GatewayOpcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl GatewayOpcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid payload json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown gateway opcode {0}")]
    UnknownOpcode(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum IdentifyError {
    #[error("token does not match the expected format")]
    InvalidToken,
    #[error("num_shards {num_shards} exceeds maximum of {max}")]
    TooManyShards { num_shards: i64, max: u32 },
    #[error("invalid shard pair: {0}")]
    InvalidShard(#[from] ShardError),
    #[error("shard pair [{0}, {1}] is out of range")]
    ShardOutOfRange(i64, i64),
    #[error("intents must be non-negative, got {0}")]
    NegativeIntents(i64),
}

fn default_shard() -> [i64; 2] {
    [0, 1]
}

/// IDENTIFY body as sent by the client, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    #[serde(default)]
    pub intents: i64,
    #[serde(default = "default_shard")]
    pub shard: [i64; 2],
}

/// Payloads a client may send.
#[derive(Debug, Clone)]
pub enum ClientPayload {
    Heartbeat { last_sequence: Option<u64> },
    Identify(IdentifyPayload),
    /// Known opcode the gateway does not act on.
    Unhandled(GatewayOpcode),
}

#[derive(Deserialize)]
struct Envelope {
    op: u8,
    #[serde(default)]
    d: Value,
}

pub fn parse_client_payload(text: &str) -> Result<ClientPayload, PayloadError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let op = GatewayOpcode::from_u8(envelope.op).ok_or(PayloadError::UnknownOpcode(envelope.op))?;
    Ok(match op {
        GatewayOpcode::Heartbeat => ClientPayload::Heartbeat {
            last_sequence: envelope.d.as_u64(),
        },
        GatewayOpcode::Identify => ClientPayload::Identify(serde_json::from_value(envelope.d)?),
        other => ClientPayload::Unhandled(other),
    })
}

/// IDENTIFY that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedIdentify {
    pub identity: ShardIdentity,
    pub intents: u64,
}

/// Token format, shard bounds and intents checks for IDENTIFY.
#[derive(Debug, Clone, Copy)]
pub struct IdentifyValidator {
    max_shards: u32,
}

impl IdentifyValidator {
    pub fn new(max_shards: u32) -> Self {
        Self { max_shards }
    }

    pub fn validate(&self, identify: &IdentifyPayload) -> Result<ValidatedIdentify, IdentifyError> {
        if !TOKEN_RE.is_match(&identify.token) {
            return Err(IdentifyError::InvalidToken);
        }
        let [shard_id, num_shards] = identify.shard;
        if num_shards > i64::from(self.max_shards) {
            return Err(IdentifyError::TooManyShards {
                num_shards,
                max: self.max_shards,
            });
        }
        let (Ok(id), Ok(n)) = (u32::try_from(shard_id), u32::try_from(num_shards)) else {
            return Err(IdentifyError::ShardOutOfRange(shard_id, num_shards));
        };
        let identity = ShardIdentity::new(id, n)?;
        if identify.intents < 0 {
            return Err(IdentifyError::NegativeIntents(identify.intents));
        }
        Ok(ValidatedIdentify {
            identity,
            intents: identify.intents as u64,
        })
    }
}

impl Default for IdentifyValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SHARDS)
    }
}

// ---------------------------------------------------------------------------
// Server payloads
// ---------------------------------------------------------------------------

pub fn hello(heartbeat_interval_ms: u64) -> String {
    json!({
        "op": GatewayOpcode::Hello as u8,
        "d": { "heartbeat_interval": heartbeat_interval_ms },
    })
    .to_string()
}

pub fn ready(session_id: &str, identity: ShardIdentity, evicted: bool) -> String {
    json!({
        "op": GatewayOpcode::Dispatch as u8,
        "t": "READY",
        "d": {
            "v": GATEWAY_VERSION,
            "session_id": session_id,
            "shard": identity,
            "evicted": evicted,
        },
    })
    .to_string()
}

pub fn invalid_session(resumable: bool) -> String {
    json!({ "op": GatewayOpcode::InvalidSession as u8, "d": resumable }).to_string()
}

pub fn heartbeat_ack() -> String {
    json!({ "op": GatewayOpcode::HeartbeatAck as u8 }).to_string()
}

/// DISPATCH envelope whose event name and data are serialized once. Only
/// the sequence number differs between sessions.
#[derive(Debug, Clone)]
pub struct DispatchTemplate {
    name: String,
    data: String,
}

impl DispatchTemplate {
    pub fn new(event: &str, data: &Value) -> serde_json::Result<Self> {
        Ok(Self {
            name: serde_json::to_string(event)?,
            data: serde_json::to_string(data)?,
        })
    }

    pub fn render(&self, sequence: u64) -> String {
        format!(
            r#"{{"op":{},"t":{},"s":{sequence},"d":{}}}"#,
            GatewayOpcode::Dispatch as u8,
            self.name,
            self.data
        )
    }
}

// ---------------------------------------------------------------------------
// Client payloads (used by clients and tests)
// ---------------------------------------------------------------------------

pub fn heartbeat(last_sequence: Option<u64>) -> String {
    json!({ "op": GatewayOpcode::Heartbeat as u8, "d": last_sequence }).to_string()
}

pub fn identify(token: &str, intents: u64, shard_id: u32, num_shards: u32) -> String {
    json!({
        "op": GatewayOpcode::Identify as u8,
        "d": {
            "token": token,
            "intents": intents,
            "shard": [shard_id, num_shards],
        },
    })
    .to_string()
}
