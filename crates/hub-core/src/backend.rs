//! Shard worker descriptors as announced to the control plane.

use serde::{Deserialize, Serialize};

use crate::shard::ShardId;

/// Where a shard worker can be reached.
///
/// - `url`: address of the worker's control socket (`host:port`, an
///   optional `tcp://` prefix is accepted).
/// - `engine_url`: address front ends use for direct engine connections
///   to users on this shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub shard_id: ShardId,
    pub url: String,
    #[serde(default)]
    pub engine_url: String,
}

impl BackendDescriptor {
    /// Socket address part of `url`.
    pub fn socket_addr(&self) -> &str {
        strip_scheme(&self.url)
    }
}

/// Strip a leading `tcp://` from an address.
pub fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}
