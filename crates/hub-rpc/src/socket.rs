//! One RPC connection.
//!
//! A socket owns three tasks:
//! - a writer draining the outbound frame queue onto the stream,
//! - a reader routing inbound frames (replies complete pending calls,
//!   calls go to the dispatcher, everything else is a handshake frame),
//! - a dispatcher invoking local objects one call at a time, so calls are
//!   handled in the order they were received.
//!
//! Handshake frames are handed back to the owner through the receiver
//! returned by [`RpcSocket::new`]; once the handshake is over the owner can
//! drop it and stray handshake frames are discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hub_protocol::{decode_frame, encode_frame, frame_len, CallId, ControlFrame, Frame, RpcId};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::RpcError;
use crate::object::{RemoteObject, RpcObject};

/// Frames that are not part of the RPC layer (handshake and error frames).
pub type HandshakeRx = mpsc::UnboundedReceiver<Frame>;

type PendingReply = oneshot::Sender<Result<Value, RpcError>>;

struct IncomingCall {
    id: CallId,
    obj: RpcId,
    method: String,
    params: Vec<Value>,
}

struct SocketState {
    label: String,
    out_tx: mpsc::UnboundedSender<Frame>,
    objects: DashMap<RpcId, Arc<dyn RpcObject>>,
    pending: DashMap<CallId, PendingReply>,
    next_object: AtomicU64,
    next_call: AtomicU64,
    closed_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

/// Handle to an RPC connection. Cheap to clone; all clones share the
/// same connection.
#[derive(Clone)]
pub struct RpcSocket {
    state: Arc<SocketState>,
}

impl std::fmt::Debug for RpcSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSocket")
            .field("label", &self.state.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcSocket {
    /// Wrap `stream` and start the socket's tasks.
    ///
    /// `label` only shows up in logs (usually the peer address).
    pub fn new<S>(stream: S, label: impl Into<String>) -> (RpcSocket, HandshakeRx)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let socket = RpcSocket {
            state: Arc::new(SocketState {
                label: label.into(),
                out_tx,
                objects: DashMap::new(),
                pending: DashMap::new(),
                next_object: AtomicU64::new(1),
                next_call: AtomicU64::new(1),
                closed_tx,
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(write_loop(
            socket.state.label.clone(),
            write_half,
            out_rx,
            socket.state.cancel.clone(),
        ));
        tokio::spawn(socket.clone().read_loop(read_half, handshake_tx, call_tx));
        tokio::spawn(socket.clone().dispatch_loop(call_rx));

        (socket, handshake_rx)
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    pub fn is_closed(&self) -> bool {
        *self.state.closed_tx.borrow()
    }

    /// Resolves once the connection is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.state.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the connection. Frames queued before this call are still
    /// written; pending calls fail with [`RpcError::SocketClosed`].
    pub fn end(&self) {
        self.state.cancel.cancel();
    }

    /// Queue a raw frame (handshake frames, mostly).
    pub fn send_frame(&self, frame: impl Into<Frame>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::SocketClosed);
        }
        self.state
            .out_tx
            .send(frame.into())
            .map_err(|_| RpcError::SocketClosed)
    }

    /// Export `object` so the peer can call it; returns its id.
    pub fn add_object(&self, object: Arc<dyn RpcObject>) -> RpcId {
        let id = self.state.next_object.fetch_add(1, Ordering::Relaxed);
        self.state.objects.insert(id, object);
        id
    }

    pub fn remove_object(&self, id: RpcId) {
        self.state.objects.remove(&id);
    }

    pub fn has_object(&self, id: RpcId) -> bool {
        self.state.objects.contains_key(&id)
    }

    /// Proxy for the peer's object `id`.
    pub fn proxy(&self, id: RpcId) -> RemoteObject {
        RemoteObject::new(self.clone(), id)
    }

    /// Call `method` on the peer's object `obj` and wait for the reply.
    pub async fn call(
        &self,
        obj: RpcId,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::SocketClosed);
        }

        let id = self.state.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.state.pending.insert(id, tx);

        // shutdown() may have drained the table between the check above and
        // the insert.
        if self.is_closed() {
            self.state.pending.remove(&id);
            return Err(RpcError::SocketClosed);
        }

        let frame = ControlFrame::Call {
            id,
            obj,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send_frame(frame) {
            self.state.pending.remove(&id);
            return Err(e);
        }

        trace!(socket = %self.state.label, call = id, obj, method, "call sent");
        rx.await.unwrap_or(Err(RpcError::SocketClosed))
    }

    async fn read_loop<S>(
        self,
        mut reader: ReadHalf<S>,
        handshake_tx: mpsc::UnboundedSender<Frame>,
        call_tx: mpsc::UnboundedSender<IncomingCall>,
    ) where
        S: AsyncRead + Send,
    {
        let cancel = self.state.cancel.clone();

        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                res = read_payload(&mut reader) => res,
            };

            match payload {
                Ok(Some(bytes)) => match decode_frame(&bytes) {
                    Ok(frame) => self.route(frame, &handshake_tx, &call_tx),
                    Err(e) => {
                        // Framing is intact, so only this message is lost.
                        warn!(socket = %self.state.label, error = %e, "dropping malformed frame");
                    }
                },
                Ok(None) => {
                    debug!(socket = %self.state.label, "peer closed connection");
                    break;
                }
                Err(e) => {
                    debug!(socket = %self.state.label, error = %e, "read failed");
                    break;
                }
            }
        }

        self.shutdown();
    }

    fn route(
        &self,
        frame: Frame,
        handshake_tx: &mpsc::UnboundedSender<Frame>,
        call_tx: &mpsc::UnboundedSender<IncomingCall>,
    ) {
        match frame {
            Frame::Control(ControlFrame::Call {
                id,
                obj,
                method,
                params,
            }) => {
                let _ = call_tx.send(IncomingCall {
                    id,
                    obj,
                    method,
                    params,
                });
            }
            Frame::Control(ControlFrame::Reply {
                id,
                reply,
                error,
                code,
            }) => match self.state.pending.remove(&id) {
                Some((_, tx)) => {
                    let result = match error {
                        Some(message) => Err(RpcError::Remote { message, code }),
                        None => Ok(reply.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(result);
                }
                None => debug!(socket = %self.state.label, call = id, "reply for unknown call"),
            },
            Frame::Control(ControlFrame::Free { obj }) => {
                self.state.objects.remove(&obj);
            }
            other => {
                let _ = handshake_tx.send(other);
            }
        }
    }

    async fn dispatch_loop(self, mut call_rx: mpsc::UnboundedReceiver<IncomingCall>) {
        while let Some(call) = call_rx.recv().await {
            let IncomingCall {
                id,
                obj,
                method,
                params,
            } = call;

            let reply = match self.invoke_local(obj, &method, params).await {
                Ok(value) => ControlFrame::Reply {
                    id,
                    reply: Some(value),
                    error: None,
                    code: None,
                },
                Err(e) => {
                    debug!(socket = %self.state.label, obj, method = %method, error = %e, "local call failed");
                    ControlFrame::Reply {
                        id,
                        reply: None,
                        error: Some(e.to_string()),
                        code: Some(e.code().to_string()),
                    }
                }
            };

            if self.send_frame(reply).is_err() {
                break;
            }
        }
    }

    async fn invoke_local(
        &self,
        obj: RpcId,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let target = self
            .state
            .objects
            .get(&obj)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RpcError::InvalidObject(obj))?;

        if !target.methods().contains(&method) {
            return Err(RpcError::UnknownMethod(method.to_string()));
        }

        target.invoke(self, method, params).await
    }

    fn shutdown(&self) {
        self.state.cancel.cancel();
        if self.state.closed_tx.send_replace(true) {
            return;
        }

        let ids: Vec<CallId> = self.state.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.state.pending.remove(&id) {
                let _ = tx.send(Err(RpcError::SocketClosed));
            }
        }

        // Exported objects may hold proxies back to this socket.
        self.state.objects.clear();
        debug!(socket = %self.state.label, "rpc socket closed");
    }
}

async fn write_loop<S>(
    label: String,
    mut writer: WriteHalf<S>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) where
    S: AsyncWrite + Send,
{
    let mut buf = Vec::with_capacity(1024);

    loop {
        // Biased so frames queued before end() still go out.
        let frame = tokio::select! {
            biased;
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        buf.clear();
        if let Err(e) = encode_frame(&frame, &mut buf) {
            warn!(socket = %label, error = %e, "failed to encode frame");
            continue;
        }

        let res = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = res {
            debug!(socket = %label, error = %e, "write failed");
            cancel.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Read one length-prefixed payload. `Ok(None)` on clean EOF.
async fn read_payload<R>(reader: &mut R) -> Result<Option<Vec<u8>>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header).await {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e.into())
        };
    }

    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
