//! Relayed connections.
//!
//! The front end asks a worker's connection factory (`websocket` or
//! `assistant`) for a new connection, passing a delegate the worker uses
//! to talk back to the client. The worker answers with an endpoint the
//! front end forwards client events to.

use std::sync::Arc;

use async_trait::async_trait;
use hub_protocol::{ObjectRef, RpcId};
use serde_json::Value;

use crate::error::RpcError;
use crate::object::{arg, export, object_arg, object_reply, RemoteObject, RpcObject};
use crate::socket::RpcSocket;

pub const CONNECTION_METHODS: &[&str] = &["onMessage", "onPing", "onPong", "onClose"];
pub const DELEGATE_METHODS: &[&str] = &["send", "ping", "pong", "terminate"];
pub const FACTORY_METHODS: &[&str] = &["newConnection"];

/// Events flowing from the client towards the engine.
#[async_trait]
pub trait ConnectionEndpoint: Send + Sync + 'static {
    async fn on_message(&self, data: String) -> Result<(), RpcError>;

    async fn on_ping(&self) -> Result<(), RpcError>;

    async fn on_pong(&self) -> Result<(), RpcError>;

    async fn on_close(&self, code: Option<u16>) -> Result<(), RpcError>;

    /// Drop whatever the endpoint holds on the peer. No-op by default.
    fn release(&self) {}
}

/// Commands flowing from the engine back to the client.
#[async_trait]
pub trait DelegateService: Send + Sync + 'static {
    async fn send(&self, data: String) -> Result<(), RpcError>;

    async fn ping(&self) -> Result<(), RpcError>;

    async fn pong(&self) -> Result<(), RpcError>;

    async fn terminate(&self) -> Result<(), RpcError>;
}

/// Worker side of a connection factory.
#[async_trait]
pub trait ConnectionFactoryService: Send + Sync + 'static {
    async fn new_connection(
        &self,
        delegate: DelegateProxy,
    ) -> Result<Arc<dyn ConnectionEndpoint>, RpcError>;
}

pub struct ConnectionSkeleton<E: ?Sized> {
    endpoint: Arc<E>,
}

impl<E: ConnectionEndpoint + ?Sized> ConnectionSkeleton<E> {
    pub fn new(endpoint: Arc<E>) -> Arc<Self> {
        Arc::new(ConnectionSkeleton { endpoint })
    }
}

#[async_trait]
impl<E: ConnectionEndpoint + ?Sized> RpcObject for ConnectionSkeleton<E> {
    fn methods(&self) -> &'static [&'static str] {
        CONNECTION_METHODS
    }

    async fn invoke(
        &self,
        _socket: &RpcSocket,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            "onMessage" => {
                let data: String = arg(&params, 0, "data")?;
                self.endpoint.on_message(data).await?;
            }
            "onPing" => self.endpoint.on_ping().await?,
            "onPong" => self.endpoint.on_pong().await?,
            "onClose" => {
                let code: Option<u16> = arg(&params, 0, "code")?;
                self.endpoint.on_close(code).await?;
            }
            other => return Err(RpcError::UnknownMethod(other.to_string())),
        }
        Ok(Value::Null)
    }
}

/// Front-end handle to a worker-side connection.
///
/// Owns the delegate exported for this connection: [`release`] frees the
/// remote endpoint and drops the delegate from the local object table.
///
/// [`release`]: ConnectionEndpoint::release
#[derive(Clone, Debug)]
pub struct ConnectionProxy {
    remote: RemoteObject,
    delegate: Option<RpcId>,
}

impl ConnectionProxy {
    pub fn new(remote: RemoteObject) -> Self {
        ConnectionProxy {
            remote,
            delegate: None,
        }
    }

    pub fn socket(&self) -> &RpcSocket {
        self.remote.socket()
    }
}

#[async_trait]
impl ConnectionEndpoint for ConnectionProxy {
    async fn on_message(&self, data: String) -> Result<(), RpcError> {
        self.remote
            .call("onMessage", vec![Value::String(data)])
            .await
            .map(|_| ())
    }

    async fn on_ping(&self) -> Result<(), RpcError> {
        self.remote.call("onPing", Vec::new()).await.map(|_| ())
    }

    async fn on_pong(&self) -> Result<(), RpcError> {
        self.remote.call("onPong", Vec::new()).await.map(|_| ())
    }

    async fn on_close(&self, code: Option<u16>) -> Result<(), RpcError> {
        let code = code.map(Value::from).unwrap_or(Value::Null);
        self.remote.call("onClose", vec![code]).await.map(|_| ())
    }

    fn release(&self) {
        self.remote.release();
        if let Some(id) = self.delegate {
            self.remote.socket().remove_object(id);
        }
    }
}

pub struct DelegateSkeleton<D: ?Sized> {
    delegate: Arc<D>,
}

impl<D: DelegateService + ?Sized> DelegateSkeleton<D> {
    pub fn new(delegate: Arc<D>) -> Arc<Self> {
        Arc::new(DelegateSkeleton { delegate })
    }
}

#[async_trait]
impl<D: DelegateService + ?Sized> RpcObject for DelegateSkeleton<D> {
    fn methods(&self) -> &'static [&'static str] {
        DELEGATE_METHODS
    }

    async fn invoke(
        &self,
        _socket: &RpcSocket,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            "send" => {
                let data: String = arg(&params, 0, "data")?;
                self.delegate.send(data).await?;
            }
            "ping" => self.delegate.ping().await?,
            "pong" => self.delegate.pong().await?,
            "terminate" => self.delegate.terminate().await?,
            other => return Err(RpcError::UnknownMethod(other.to_string())),
        }
        Ok(Value::Null)
    }
}

/// Worker-side handle to the front end's delegate.
#[derive(Clone, Debug)]
pub struct DelegateProxy {
    remote: RemoteObject,
}

impl DelegateProxy {
    pub fn new(remote: RemoteObject) -> Self {
        DelegateProxy { remote }
    }

    pub fn release(&self) {
        self.remote.release();
    }
}

#[async_trait]
impl DelegateService for DelegateProxy {
    async fn send(&self, data: String) -> Result<(), RpcError> {
        self.remote
            .call("send", vec![Value::String(data)])
            .await
            .map(|_| ())
    }

    async fn ping(&self) -> Result<(), RpcError> {
        self.remote.call("ping", Vec::new()).await.map(|_| ())
    }

    async fn pong(&self) -> Result<(), RpcError> {
        self.remote.call("pong", Vec::new()).await.map(|_| ())
    }

    async fn terminate(&self) -> Result<(), RpcError> {
        self.remote.call("terminate", Vec::new()).await.map(|_| ())
    }
}

pub struct FactorySkeleton<F: ?Sized> {
    factory: Arc<F>,
}

impl<F: ConnectionFactoryService + ?Sized> FactorySkeleton<F> {
    pub fn new(factory: Arc<F>) -> Arc<Self> {
        Arc::new(FactorySkeleton { factory })
    }
}

#[async_trait]
impl<F: ConnectionFactoryService + ?Sized> RpcObject for FactorySkeleton<F> {
    fn methods(&self) -> &'static [&'static str] {
        FACTORY_METHODS
    }

    async fn invoke(
        &self,
        socket: &RpcSocket,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        if method != "newConnection" {
            return Err(RpcError::UnknownMethod(method.to_string()));
        }
        let delegate = DelegateProxy::new(object_arg(socket, &params, 0, "delegate")?);
        let endpoint = self.factory.new_connection(delegate).await?;
        Ok(export(socket, ConnectionSkeleton::new(endpoint)))
    }
}

/// Front-end handle to a worker's connection factory.
#[derive(Clone, Debug)]
pub struct ConnectionFactory {
    remote: RemoteObject,
}

impl ConnectionFactory {
    pub fn new(remote: RemoteObject) -> Self {
        ConnectionFactory { remote }
    }

    pub fn remote(&self) -> &RemoteObject {
        &self.remote
    }

    /// Export `delegate` and open a connection on the worker.
    ///
    /// The delegate stays exported until the returned proxy is released
    /// (or the socket closes); on failure it is removed right away.
    pub async fn new_connection(
        &self,
        delegate: Arc<dyn RpcObject>,
    ) -> Result<ConnectionProxy, RpcError> {
        let socket = self.remote.socket();
        let delegate_id = socket.add_object(delegate);

        let res = self
            .remote
            .call("newConnection", vec![ObjectRef::new(delegate_id).to_value()])
            .await
            .and_then(|value| object_reply(socket, &value));

        match res {
            Ok(remote) => Ok(ConnectionProxy {
                remote,
                delegate: Some(delegate_id),
            }),
            Err(e) => {
                socket.remove_object(delegate_id);
                Err(e)
            }
        }
    }
}
