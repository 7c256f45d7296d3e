//! RPC-level errors.

use hub_core::HubError;
use hub_protocol::{ProtocolError, RpcId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The connection closed before (or while) the call completed.
    #[error("socket closed")]
    SocketClosed,

    #[error("invalid object id {0}")]
    InvalidObject(RpcId),

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(String),

    /// The remote implementation returned an error.
    #[error("{message}")]
    Remote {
        message: String,
        code: Option<String>,
    },
}

impl RpcError {
    /// Shorthand for errors raised by local service implementations.
    pub fn remote(message: impl Into<String>) -> Self {
        RpcError::Remote {
            message: message.into(),
            code: None,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            RpcError::SocketClosed => "ERR_SOCKET_CLOSED",
            RpcError::InvalidObject(_) => "ENXIO",
            RpcError::UnknownMethod(_) => "ENOSYS",
            RpcError::InvalidArgument(_) => "EINVAL",
            RpcError::Protocol(_) => "E_PROTOCOL",
            RpcError::Io(_) => "EIO",
            RpcError::Remote { code, .. } => code.as_deref().unwrap_or("E_REMOTE"),
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        RpcError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(e.to_string())
    }
}

impl From<RpcError> for HubError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::SocketClosed | RpcError::Io(_) => HubError::Transport(e.to_string()),
            RpcError::Protocol(msg) => HubError::Protocol(msg),
            RpcError::Remote { message, code } => HubError::Remote { message, code },
            other => HubError::Remote {
                message: other.to_string(),
                code: Some(other.code().to_string()),
            },
        }
    }
}
