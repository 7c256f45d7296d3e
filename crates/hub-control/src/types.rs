//! Shared types for the control server.
//!
//! - registration outcomes returned by the control plane
//! - lifecycle events of backend control channels
//! - request/response bodies of the HTTP API

use std::time::Duration;

use hub_core::{BackendDescriptor, ShardId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RegisterOutcome {
    Registered,
    /// A backend for this shard is registered or still connecting.
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeregisterOutcome {
    Deregistered,
    NotRegistered,
}

/// Lifecycle of one shard's control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Handshake completed; the channel accepts calls.
    Ready { shard_id: ShardId },

    /// The channel closed. `expected` is set when it was closed on purpose
    /// (deregistration or shutdown) and no reconnect follows.
    Closed { shard_id: ShardId, expected: bool },

    /// A connect attempt failed or the channel was severed; the next
    /// attempt runs after `delay`.
    ReconnectScheduled { shard_id: ShardId, delay: Duration },
}

impl BackendEvent {
    pub fn shard_id(&self) -> ShardId {
        match self {
            BackendEvent::Ready { shard_id }
            | BackendEvent::Closed { shard_id, .. }
            | BackendEvent::ReconnectScheduled { shard_id, .. } => *shard_id,
        }
    }
}

/// Body of `POST /registerBackend`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub backend: BackendDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendState {
    Connecting,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    #[serde(flatten)]
    pub descriptor: BackendDescriptor,
    pub state: BackendState,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub shard_count: u32,
    pub backends: Vec<BackendStatus>,
}
