//! Worker side of the handshakes.
//!
//! The hub does not run engines itself; this is what a shard worker (or a
//! test double of one) embeds to answer `master` and `direct` requests.

use std::sync::Arc;

use async_trait::async_trait;
use hub_core::{HubError, UserId};
use hub_protocol::{ControlFrame, ErrorFrame, Frame};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::object::{export, RpcObject};
use crate::socket::{HandshakeRx, RpcSocket};

/// Capabilities exported for one user's engine, in `ready` order.
pub struct EngineExports {
    pub engine: Arc<dyn RpcObject>,
    pub devices: Arc<dyn RpcObject>,
    pub apps: Arc<dyn RpcObject>,
    pub assistant: Arc<dyn RpcObject>,
    pub websocket: Arc<dyn RpcObject>,
    pub webhook: Arc<dyn RpcObject>,
}

impl EngineExports {
    fn export(self, socket: &RpcSocket) -> Vec<Value> {
        [
            self.engine,
            self.devices,
            self.apps,
            self.assistant,
            self.websocket,
            self.webhook,
        ]
        .into_iter()
        .map(|object| export(socket, object))
        .collect()
    }
}

/// What a worker serves.
#[async_trait]
pub trait EngineHost: Send + Sync + 'static {
    /// Engine manager exported on `master` connections.
    fn control(&self) -> Arc<dyn RpcObject>;

    /// Engine for `user`, started if needed.
    async fn open_engine(&self, user: &UserId) -> Result<EngineExports, HubError>;
}

/// Accepts front-end and control-plane connections for an [`EngineHost`].
#[derive(Clone)]
pub struct WorkerAcceptor {
    host: Arc<dyn EngineHost>,
    auth: Option<String>,
}

impl WorkerAcceptor {
    pub fn new(host: Arc<dyn EngineHost>) -> Self {
        WorkerAcceptor { host, auth: None }
    }

    /// Require peers to send `{"control":"auth","token":...}` first.
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }

    /// Accept connections until `shutdown` fires, then close every socket
    /// accepted so far.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "worker listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let _ = stream.set_nodelay(true);
            let socket = self.attach(stream, peer.to_string());
            let token = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => socket.end(),
                    _ = socket.closed() => {}
                }
            });
        }

        info!("worker stopped accepting");
        Ok(())
    }

    /// Run the handshake on an already-connected stream.
    pub fn attach<S>(&self, stream: S, label: impl Into<String>) -> RpcSocket
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (socket, rx) = RpcSocket::new(stream, label);
        let this = self.clone();
        let conn = socket.clone();
        tokio::spawn(async move { this.handshake(conn, rx).await });
        socket
    }

    async fn handshake(self, socket: RpcSocket, mut rx: HandshakeRx) {
        let mut authed = self.auth.is_none();

        while let Some(frame) = rx.recv().await {
            let frame = match frame {
                Frame::Control(frame) => frame,
                Frame::Error(e) => {
                    debug!(socket = %socket.label(), error = %e.error, "peer reported error");
                    continue;
                }
            };

            match frame {
                ControlFrame::Auth { token } => {
                    if self.auth.as_deref().map_or(true, |expected| expected == token) {
                        authed = true;
                    } else {
                        reject(&socket, "invalid authentication token", "E_FORBIDDEN");
                        return;
                    }
                }
                _ if !authed => {
                    reject(&socket, "expected authentication", "E_FORBIDDEN");
                    return;
                }
                ControlFrame::Master => {
                    let rpc_id = socket.add_object(self.host.control());
                    debug!(socket = %socket.label(), rpc_id, "master channel open");
                    let _ = socket.send_frame(ControlFrame::Ready { rpc_id });
                }
                ControlFrame::Direct { target, reply_id } => {
                    let reply = socket.proxy(reply_id);
                    let res = match self.host.open_engine(&target).await {
                        Ok(exports) => reply.call("ready", exports.export(&socket)).await,
                        Err(e) => {
                            debug!(socket = %socket.label(), user = %target, error = %e, "engine unavailable");
                            reply
                                .call("error", vec![json!(e.to_string()), json!(e.code())])
                                .await
                        }
                    };
                    if let Err(e) = res {
                        debug!(socket = %socket.label(), user = %target, error = %e, "direct reply failed");
                    }
                }
                other => {
                    warn!(socket = %socket.label(), ?other, "unexpected handshake frame");
                    reject(&socket, "invalid initialization message", "E_PROTOCOL");
                    return;
                }
            }
        }
    }
}

fn reject(socket: &RpcSocket, message: &str, code: &str) {
    let _ = socket.send_frame(ErrorFrame {
        error: message.to_string(),
        code: Some(code.to_string()),
    });
    socket.end();
}
