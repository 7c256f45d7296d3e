//! Capabilities handed over by a worker when a direct connection is ready.

use hub_protocol::ObjectRef;
use serde_json::Value;

use crate::error::RpcError;
use crate::object::RemoteObject;
use crate::services::connection::ConnectionFactory;
use crate::services::webhook::WebhookProxy;
use crate::socket::RpcSocket;

/// Order of the capability references in a direct-connection `ready` call.
pub const READY_PARAMS: [&str; 6] = ["engine", "devices", "apps", "assistant", "websocket", "webhook"];

/// Capabilities of one user's engine, obtained over a direct connection.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    engine: RemoteObject,
    devices: RemoteObject,
    apps: RemoteObject,
    assistant: ConnectionFactory,
    websocket: ConnectionFactory,
    webhook: WebhookProxy,
}

impl EngineHandle {
    /// Build from the positional params of a `ready` call.
    pub fn from_ready(socket: &RpcSocket, params: &[Value]) -> Result<Self, RpcError> {
        let mut refs = Vec::with_capacity(READY_PARAMS.len());
        for (index, name) in READY_PARAMS.iter().enumerate() {
            let r = params
                .get(index)
                .and_then(ObjectRef::from_value)
                .ok_or_else(|| RpcError::InvalidArgument(format!("{name}: expected an object reference")))?;
            refs.push(socket.proxy(r.id));
        }

        let mut refs = refs.into_iter();
        let mut next = || refs.next().ok_or_else(|| RpcError::Protocol("short ready".into()));
        Ok(EngineHandle {
            engine: next()?,
            devices: next()?,
            apps: next()?,
            assistant: ConnectionFactory::new(next()?),
            websocket: ConnectionFactory::new(next()?),
            webhook: WebhookProxy::new(next()?),
        })
    }

    pub fn engine(&self) -> &RemoteObject {
        &self.engine
    }

    pub fn devices(&self) -> &RemoteObject {
        &self.devices
    }

    pub fn apps(&self) -> &RemoteObject {
        &self.apps
    }

    pub fn assistant(&self) -> &ConnectionFactory {
        &self.assistant
    }

    pub fn websocket(&self) -> &ConnectionFactory {
        &self.websocket
    }

    pub fn webhook(&self) -> &WebhookProxy {
        &self.webhook
    }

    pub fn socket(&self) -> &RpcSocket {
        self.engine.socket()
    }

    pub fn is_connected(&self) -> bool {
        !self.socket().is_closed()
    }

    /// Resolves when the underlying connection closes.
    pub async fn closed(&self) {
        self.socket().closed().await
    }

    /// Close the connection to the worker.
    pub fn close(&self) {
        self.socket().end()
    }
}
