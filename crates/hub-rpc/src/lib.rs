//! hub-rpc
//!
//! Remote-object RPC between the front end, the control plane and shard
//! workers.
//!
//! - [`socket`]    : one framed connection carrying calls both ways
//! - [`object`]    : exported objects and proxies to remote ones
//! - [`services`]  : statically declared interfaces with their
//!   skeleton (server) and proxy (client) halves
//! - [`handshake`] : client side of the `master` / `direct` handshakes
//! - [`acceptor`]  : worker side of the same handshakes

pub mod acceptor;
pub mod error;
pub mod handshake;
pub mod object;
pub mod services;
pub mod socket;

pub use acceptor::{EngineExports, EngineHost, WorkerAcceptor};
pub use error::RpcError;
pub use handshake::{open_direct, open_master, MasterChannel};
pub use object::{RemoteObject, RpcObject};
pub use services::{
    ConnectionEndpoint, ConnectionFactory, ConnectionProxy, ControlProxy, ControlService,
    DelegateProxy, DelegateService, EngineHandle, WebhookProxy, WebhookRequest, WebhookResult,
};
pub use socket::RpcSocket;
