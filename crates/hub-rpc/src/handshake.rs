//! Client side of the worker handshakes.
//!
//! - `master`: the worker answers `ready` with the id of its engine
//!   manager, which becomes a [`ControlProxy`].
//! - `direct`: the front end exports a one-shot reply object; the worker
//!   calls `ready(engine, devices, apps, assistant, websocket, webhook)`
//!   or `error(message, code)` on it.
//!
//! Either side may answer with an `{error, code}` frame instead, which is
//! surfaced as [`HubError::Handshake`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hub_core::backend::strip_scheme;
use hub_core::{HubError, UserId};
use hub_protocol::{ControlFrame, ErrorFrame, Frame, RpcId};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::RpcError;
use crate::object::{arg, RpcObject};
use crate::services::{ControlProxy, EngineHandle};
use crate::socket::{HandshakeRx, RpcSocket};

/// An open control channel to one worker's engine manager.
#[derive(Clone, Debug)]
pub struct MasterChannel {
    socket: RpcSocket,
    control: ControlProxy,
}

impl MasterChannel {
    pub fn socket(&self) -> &RpcSocket {
        &self.socket
    }

    pub fn control(&self) -> &ControlProxy {
        &self.control
    }

    pub fn is_connected(&self) -> bool {
        !self.socket.is_closed()
    }

    pub async fn closed(&self) {
        self.socket.closed().await
    }

    pub fn close(&self) {
        self.socket.end()
    }
}

async fn connect(addr: &str) -> Result<(RpcSocket, HandshakeRx), HubError> {
    let target = strip_scheme(addr);
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| HubError::Transport(format!("connect {target}: {e}")))?;
    let _ = stream.set_nodelay(true);
    Ok(RpcSocket::new(stream, target))
}

fn handshake_error(frame: ErrorFrame) -> HubError {
    HubError::Handshake {
        message: frame.error,
        code: frame.code,
    }
}

fn closed_during_handshake() -> HubError {
    HubError::Transport("connection closed during handshake".to_string())
}

fn send_auth(socket: &RpcSocket, auth: Option<&str>) -> Result<(), RpcError> {
    match auth {
        Some(token) => socket.send_frame(ControlFrame::Auth {
            token: token.to_string(),
        }),
        None => Ok(()),
    }
}

/// Open a control channel to the worker at `addr`.
pub async fn open_master(addr: &str, auth: Option<&str>) -> Result<MasterChannel, HubError> {
    let (socket, rx) = connect(addr).await?;
    match master_handshake(&socket, rx, auth).await {
        Ok(control) => Ok(MasterChannel { socket, control }),
        Err(e) => {
            socket.end();
            Err(e)
        }
    }
}

async fn master_handshake(
    socket: &RpcSocket,
    mut rx: HandshakeRx,
    auth: Option<&str>,
) -> Result<ControlProxy, HubError> {
    send_auth(socket, auth)?;
    socket.send_frame(ControlFrame::Master)?;

    loop {
        match rx.recv().await {
            Some(Frame::Control(ControlFrame::Ready { rpc_id })) => {
                return Ok(ControlProxy::new(socket.proxy(rpc_id)));
            }
            Some(Frame::Error(e)) => return Err(handshake_error(e)),
            Some(other) => {
                debug!(socket = %socket.label(), ?other, "ignoring frame during master handshake")
            }
            None => return Err(closed_during_handshake()),
        }
    }
}

type ReadyTx = oneshot::Sender<Result<EngineHandle, HubError>>;

/// One-shot object the worker answers a `direct` request on.
struct ReadyReply {
    tx: Mutex<Option<ReadyTx>>,
}

impl ReadyReply {
    fn complete(&self, result: Result<EngineHandle, HubError>) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl RpcObject for ReadyReply {
    fn methods(&self) -> &'static [&'static str] {
        &["ready", "error"]
    }

    async fn invoke(
        &self,
        socket: &RpcSocket,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            "ready" => match EngineHandle::from_ready(socket, &params) {
                Ok(handle) => {
                    self.complete(Ok(handle));
                    Ok(Value::Null)
                }
                Err(e) => {
                    self.complete(Err(e.clone().into()));
                    Err(e)
                }
            },
            "error" => {
                let message: Option<String> = arg(&params, 0, "message")?;
                let code: Option<String> = arg(&params, 1, "code")?;
                self.complete(Err(HubError::Handshake {
                    message: message.unwrap_or_else(|| "engine unavailable".to_string()),
                    code,
                }));
                Ok(Value::Null)
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

/// Open a direct connection to `user`'s engine on the worker at `addr`.
pub async fn open_direct(
    addr: &str,
    auth: Option<&str>,
    user: &UserId,
) -> Result<EngineHandle, HubError> {
    let (socket, rx) = connect(addr).await?;
    match direct_handshake(&socket, rx, auth, user).await {
        Ok(handle) => Ok(handle),
        Err(e) => {
            socket.end();
            Err(e)
        }
    }
}

async fn direct_handshake(
    socket: &RpcSocket,
    rx: HandshakeRx,
    auth: Option<&str>,
    user: &UserId,
) -> Result<EngineHandle, HubError> {
    let (tx, ready_rx) = oneshot::channel();
    let reply_id = socket.add_object(Arc::new(ReadyReply {
        tx: Mutex::new(Some(tx)),
    }));

    let outcome = await_ready(socket, rx, ready_rx, auth, user, reply_id).await;
    socket.remove_object(reply_id);
    outcome
}

async fn await_ready(
    socket: &RpcSocket,
    mut rx: HandshakeRx,
    mut ready_rx: oneshot::Receiver<Result<EngineHandle, HubError>>,
    auth: Option<&str>,
    user: &UserId,
    reply_id: RpcId,
) -> Result<EngineHandle, HubError> {
    send_auth(socket, auth)?;
    socket.send_frame(ControlFrame::Direct {
        target: user.clone(),
        reply_id,
    })?;

    loop {
        tokio::select! {
            res = &mut ready_rx => {
                return res.unwrap_or_else(|_| Err(closed_during_handshake()));
            }
            frame = rx.recv() => match frame {
                Some(Frame::Error(e)) => return Err(handshake_error(e)),
                Some(other) => {
                    debug!(socket = %socket.label(), ?other, "ignoring frame during direct handshake")
                }
                // The reply may have landed just before the close.
                None => {
                    return ready_rx
                        .try_recv()
                        .unwrap_or_else(|_| Err(closed_during_handshake()));
                }
            },
        }
    }
}
