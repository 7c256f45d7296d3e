//! Shard routing.
//!
//! The mapping is load-independent: numeric user ids go to `id mod N`
//! (the same rule the roster query uses to select a shard's users), any
//! other id goes to `djb2(id) mod N`. A user therefore never moves between
//! shards while the shard count stays the same.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::user::UserId;

/// Index of a shard, in `[0, shard_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps users to shards for a fixed shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    pub fn new(shard_count: u32) -> Result<Self, HubError> {
        if shard_count == 0 {
            return Err(HubError::InvalidRequest(
                "shard count must be at least 1".to_string(),
            ));
        }
        Ok(ShardRouter { shard_count })
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard owning `user`. Pure and total.
    pub fn shard_of(&self, user: &UserId) -> ShardId {
        let n = u64::from(self.shard_count);
        let slot = match user {
            UserId::Numeric(id) => id % n,
            UserId::Named(name) => u64::from(djb2_hash(name.as_bytes())) % n,
        };
        ShardId(slot as u32)
    }

    /// Whether `shard` is a valid index for this router.
    pub fn contains(&self, shard: ShardId) -> bool {
        shard.0 < self.shard_count
    }

    /// All shard ids, in order.
    pub fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.shard_count).map(ShardId)
    }
}

fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(b));
    }
    hash
}
