use std::fmt;

use serde::{Deserialize, Serialize};

/// Bits of an entity id below the timestamp portion; routing ignores them.
pub const ENTITY_ID_SHIFT: u32 = 22;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardError {
    #[error("num_shards must be at least 1")]
    ZeroShards,
    #[error("shard id {shard_id} out of range for {num_shards} shards")]
    OutOfRange { shard_id: u32, num_shards: u32 },
}

/// One slot in a sharded deployment: `(shard_id, num_shards)`.
///
/// Always satisfies `shard_id < num_shards` and `num_shards >= 1`. Two
/// identities are equal only when both numbers match, so `[0, 1]` and `[0, 2]`
/// are different slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "[u32; 2]")]
pub struct ShardIdentity {
    shard_id: u32,
    num_shards: u32,
}

impl ShardIdentity {
    pub fn new(shard_id: u32, num_shards: u32) -> Result<Self, ShardError> {
        if num_shards == 0 {
            return Err(ShardError::ZeroShards);
        }
        if shard_id >= num_shards {
            return Err(ShardError::OutOfRange {
                shard_id,
                num_shards,
            });
        }
        Ok(Self {
            shard_id,
            num_shards,
        })
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Whether events for `entity_id` belong to this shard.
    pub fn is_responsible_for(&self, entity_id: u64) -> bool {
        shard_for(entity_id, self.num_shards) == self.shard_id
    }
}

/// Shard index that owns `entity_id` in a deployment of `num_shards`.
pub fn shard_for(entity_id: u64, num_shards: u32) -> u32 {
    ((entity_id >> ENTITY_ID_SHIFT) % u64::from(num_shards.max(1))) as u32
}

impl From<ShardIdentity> for [u32; 2] {
    fn from(id: ShardIdentity) -> Self {
        [id.shard_id, id.num_shards]
    }
}

impl TryFrom<[u32; 2]> for ShardIdentity {
    type Error = ShardError;

    fn try_from([shard_id, num_shards]: [u32; 2]) -> Result<Self, ShardError> {
        Self::new(shard_id, num_shards)
    }
}

impl<'de> Deserialize<'de> for ShardIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let pair = <[u32; 2]>::deserialize(de)?;
        Self::try_from(pair).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ShardIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.shard_id, self.num_shards)
    }
}
