//! Exported objects and proxies.
//!
//! An [`RpcObject`] is the server half of an interface: a fixed list of
//! method names and a dispatch function. A [`RemoteObject`] is the untyped
//! client half; typed proxies in [`crate::services`] wrap it.

use std::sync::Arc;

use async_trait::async_trait;
use hub_protocol::{ControlFrame, ObjectRef, RpcId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::RpcError;
use crate::socket::RpcSocket;

/// An object that can be exported on a socket.
#[async_trait]
pub trait RpcObject: Send + Sync + 'static {
    /// Methods the peer may call. Anything else is rejected before
    /// [`RpcObject::invoke`] runs.
    fn methods(&self) -> &'static [&'static str];

    async fn invoke(
        &self,
        socket: &RpcSocket,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError>;
}

/// Proxy to an object exported by the peer.
#[derive(Clone, Debug)]
pub struct RemoteObject {
    socket: RpcSocket,
    id: RpcId,
}

impl RemoteObject {
    pub fn new(socket: RpcSocket, id: RpcId) -> Self {
        RemoteObject { socket, id }
    }

    pub fn id(&self) -> RpcId {
        self.id
    }

    pub fn socket(&self) -> &RpcSocket {
        &self.socket
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.socket.call(self.id, method, params).await
    }

    /// Call and deserialize the reply.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("bad reply to {method}: {e}")))
    }

    /// Tell the peer this proxy is no longer used. Best effort.
    pub fn release(&self) {
        let _ = self.socket.send_frame(ControlFrame::Free { obj: self.id });
    }
}

/// Export `object` on `socket` and return the reference to pass in params.
pub fn export(socket: &RpcSocket, object: Arc<dyn RpcObject>) -> Value {
    ObjectRef::new(socket.add_object(object)).to_value()
}

/// Deserialize positional argument `index`. Missing arguments read as null.
pub fn arg<T: DeserializeOwned>(params: &[Value], index: usize, name: &str) -> Result<T, RpcError> {
    let value = params.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| RpcError::InvalidArgument(format!("{name}: {e}")))
}

/// Positional argument `index` as a proxy to a peer object.
pub fn object_arg(
    socket: &RpcSocket,
    params: &[Value],
    index: usize,
    name: &str,
) -> Result<RemoteObject, RpcError> {
    params
        .get(index)
        .and_then(ObjectRef::from_value)
        .map(|r| socket.proxy(r.id))
        .ok_or_else(|| RpcError::InvalidArgument(format!("{name}: expected an object reference")))
}

/// Reply value as a proxy to a peer object.
pub fn object_reply(socket: &RpcSocket, value: &Value) -> Result<RemoteObject, RpcError> {
    ObjectRef::from_value(value)
        .map(|r| socket.proxy(r.id))
        .ok_or_else(|| RpcError::Protocol("expected an object reference in reply".to_string()))
}

/// Serialize a reply value.
pub fn reply<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Protocol(e.to_string()))
}
