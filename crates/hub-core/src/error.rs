//! Error type shared by the connection manager and the control plane.
//!
//! Every variant carries a stable machine-readable code so the HTTP
//! boundary can pick a status without looking at message text.

use thiserror::Error;

use crate::shard::ShardId;
use crate::user::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The shard owning the request has no live control channel.
    #[error("control channel to shard {0} unavailable")]
    Unavailable(ShardId),

    #[error("user {0} not found")]
    NotFound(UserId),

    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed or unexpected message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote side refused a handshake (`{error, code}` frame).
    #[error("{message}")]
    Handshake {
        message: String,
        code: Option<String>,
    },

    /// Connect failure, reset, or socket closed under a pending request.
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote method call failed on the other side.
    #[error("{message}")]
    Remote {
        message: String,
        code: Option<String>,
    },

    #[error("shutting down")]
    ShuttingDown,
}

impl HubError {
    pub fn code(&self) -> &str {
        match self {
            HubError::Unavailable(_) => "E_UNAVAILABLE",
            HubError::NotFound(_) => "E_NOT_FOUND",
            HubError::Forbidden(_) => "E_FORBIDDEN",
            HubError::InvalidRequest(_) => "E_INVALID",
            HubError::Protocol(_) => "E_PROTOCOL",
            HubError::Handshake { code, .. } => code.as_deref().unwrap_or("E_HANDSHAKE"),
            HubError::Transport(_) => "E_TRANSPORT",
            HubError::Remote { code, .. } => code.as_deref().unwrap_or("E_REMOTE"),
            HubError::ShuttingDown => "E_SHUTDOWN",
        }
    }
}
