//! User roster pushed to workers when their control channel opens.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use hub_core::{HubError, ShardId, ShardRouter, UserRecord};

/// Source of the users a shard owns.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn users_for_shard(&self, shard: ShardId) -> Result<Vec<UserRecord>, HubError>;
}

/// In-memory roster, split over shards with the router.
#[derive(Debug, Clone)]
pub struct StaticRoster {
    router: ShardRouter,
    users: Vec<UserRecord>,
}

impl StaticRoster {
    pub fn new(router: ShardRouter, users: Vec<UserRecord>) -> Self {
        StaticRoster { router, users }
    }

    pub fn empty(router: ShardRouter) -> Self {
        StaticRoster::new(router, Vec::new())
    }

    /// Load a JSON array of user records.
    pub fn from_file(router: ShardRouter, path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading roster {}", path.display()))?;
        let users: Vec<UserRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing roster {}", path.display()))?;
        Ok(StaticRoster::new(router, users))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for StaticRoster {
    async fn users_for_shard(&self, shard: ShardId) -> Result<Vec<UserRecord>, HubError> {
        Ok(self
            .users
            .iter()
            .filter(|u| self.router.shard_of(&u.id) == shard)
            .cloned()
            .collect())
    }
}
