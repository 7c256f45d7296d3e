//! Bridges a client WebSocket to a connection on the user's engine.
//!
//! The local side is exported to the worker as a delegate (`send`, `ping`,
//! `pong`, `terminate`); the remote side is whatever endpoint the engine's
//! connection factory hands back. A relay goes Unbound -> Bound -> Closed:
//! - while Unbound, local frames are buffered and replayed in order once the
//!   endpoint is known,
//! - a failed forward, a `terminate` from the worker, or the loss of the
//!   engine connection closes the local socket,
//! - binary frames are refused with close code 1003,
//! - on close the endpoint is told (`on_close`) and released; both are best
//!   effort.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use hub_rpc::services::DelegateSkeleton;
use hub_rpc::{DelegateService, RpcError, RpcObject};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use hub_rpc::ConnectionEndpoint as RemoteEndpoint;

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close(Option<u16>),
}

/// Why a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client closed (or dropped) its socket.
    LocalClosed,
    /// The worker asked to terminate the connection.
    Terminated,
    /// The user's engine connection went away.
    EngineClosed,
    /// The engine refused to open the connection.
    BindFailed,
    /// Forwarding a client frame to the engine failed.
    ForwardFailed,
    /// The client sent a binary frame; engines only take text.
    Unsupported,
}

/// Close code for a frame type the engine does not accept.
pub const CLOSE_UNSUPPORTED: u16 = 1003;

#[derive(Debug)]
enum DelegateCommand {
    Send(String),
    Ping,
    Pong,
    Terminate,
}

/// Local socket as seen by the worker.
pub struct WebSocketDelegate {
    tx: mpsc::UnboundedSender<DelegateCommand>,
}

impl WebSocketDelegate {
    fn push(&self, command: DelegateCommand) -> Result<(), RpcError> {
        self.tx
            .send(command)
            .map_err(|_| RpcError::remote("websocket is closed"))
    }
}

#[async_trait]
impl DelegateService for WebSocketDelegate {
    async fn send(&self, data: String) -> Result<(), RpcError> {
        self.push(DelegateCommand::Send(data))
    }

    async fn ping(&self) -> Result<(), RpcError> {
        self.push(DelegateCommand::Ping)
    }

    async fn pong(&self) -> Result<(), RpcError> {
        self.push(DelegateCommand::Pong)
    }

    async fn terminate(&self) -> Result<(), RpcError> {
        self.push(DelegateCommand::Terminate)
    }
}

async fn forward<EP: RemoteEndpoint>(endpoint: &EP, frame: LocalFrame) -> Result<(), RpcError> {
    match frame {
        LocalFrame::Text(text) => endpoint.on_message(text).await,
        LocalFrame::Ping => endpoint.on_ping().await,
        LocalFrame::Pong => endpoint.on_pong().await,
        LocalFrame::Close(_) | LocalFrame::Binary(_) => Ok(()),
    }
}

async fn replay<EP: RemoteEndpoint>(endpoint: &EP, pending: &mut VecDeque<LocalFrame>) -> Result<(), RpcError> {
    while let Some(frame) = pending.pop_front() {
        forward(endpoint, frame).await?;
    }
    Ok(())
}

/// Run a relay until either side closes.
///
/// `bind` receives the delegate to export and opens the remote endpoint
/// (typically `factory.new_connection(delegate)`). `engine_closed` resolves
/// when the user's engine connection is lost.
pub async fn relay<In, Out, E, EP, B, BFut, C>(
    incoming: In,
    outgoing: Out,
    bind: B,
    engine_closed: C,
) -> RelayEnd
where
    In: Stream<Item = Result<LocalFrame, E>>,
    Out: Sink<LocalFrame>,
    E: Display,
    EP: RemoteEndpoint,
    B: FnOnce(Arc<dyn RpcObject>) -> BFut,
    BFut: Future<Output = Result<EP, RpcError>>,
    C: Future<Output = ()>,
{
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let delegate: Arc<dyn RpcObject> =
        DelegateSkeleton::new(Arc::new(WebSocketDelegate { tx: cmd_tx }));
    // The worker may free its reference at any time; the command channel
    // stays open until the relay itself ends.
    let bind = bind(delegate.clone());
    tokio::pin!(incoming, outgoing, bind, engine_closed);

    let mut remote: Option<EP> = None;
    let mut bind_done = false;
    let mut pending = VecDeque::new();
    let mut close_code = None;

    let end = loop {
        tokio::select! {
            res = &mut bind, if !bind_done => {
                bind_done = true;
                match res {
                    Ok(endpoint) => {
                        let replayed = replay(&endpoint, &mut pending).await;
                        remote = Some(endpoint);
                        if let Err(e) = replayed {
                            warn!(error = %e, "failed to replay buffered frames");
                            break RelayEnd::ForwardFailed;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "engine refused connection");
                        break RelayEnd::BindFailed;
                    }
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(LocalFrame::Close(code))) => {
                    close_code = code;
                    break RelayEnd::LocalClosed;
                }
                Some(Ok(LocalFrame::Binary(data))) => {
                    debug!(len = data.len(), "rejecting binary frame");
                    close_code = Some(CLOSE_UNSUPPORTED);
                    break RelayEnd::Unsupported;
                }
                Some(Ok(frame)) => match &remote {
                    Some(endpoint) => {
                        if let Err(e) = forward(endpoint, frame).await {
                            warn!(error = %e, "failed to forward frame");
                            break RelayEnd::ForwardFailed;
                        }
                    }
                    None => pending.push_back(frame),
                },
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    break RelayEnd::LocalClosed;
                }
                None => break RelayEnd::LocalClosed,
            },
            command = cmd_rx.recv() => match command {
                Some(DelegateCommand::Send(text)) => {
                    if outgoing.send(LocalFrame::Text(text)).await.is_err() {
                        break RelayEnd::LocalClosed;
                    }
                }
                Some(DelegateCommand::Ping) => {
                    if outgoing.send(LocalFrame::Ping).await.is_err() {
                        break RelayEnd::LocalClosed;
                    }
                }
                Some(DelegateCommand::Pong) => {
                    if outgoing.send(LocalFrame::Pong).await.is_err() {
                        break RelayEnd::LocalClosed;
                    }
                }
                Some(DelegateCommand::Terminate) => break RelayEnd::Terminated,
                None => break RelayEnd::EngineClosed,
            },
            _ = &mut engine_closed => break RelayEnd::EngineClosed,
        }
    };

    debug!(?end, "relay closing");
    match end {
        RelayEnd::LocalClosed => {}
        RelayEnd::Unsupported => {
            let _ = outgoing.send(LocalFrame::Close(Some(CLOSE_UNSUPPORTED))).await;
        }
        _ => {
            let _ = outgoing.send(LocalFrame::Close(None)).await;
        }
    }
    let _ = outgoing.close().await;

    if !bind_done {
        // Closed before the engine answered: finish binding so the remote
        // side learns about the close.
        match bind.await {
            Ok(endpoint) => {
                if matches!(end, RelayEnd::LocalClosed | RelayEnd::Unsupported) {
                    if let Err(e) = replay(&endpoint, &mut pending).await {
                        debug!(error = %e, "dropping buffered frames");
                    }
                }
                remote = Some(endpoint);
            }
            Err(e) => debug!(error = %e, "late bind failed"),
        }
    }

    if let Some(endpoint) = remote {
        if let Err(e) = endpoint.on_close(close_code).await {
            debug!(error = %e, "onClose failed");
        }
        endpoint.release();
    }

    drop(delegate);
    end
}
