//! Public HTTP surface of the front end.
//!
//! - `GET /ws/sync/{userId}`: WebSocket relayed to the engine's sync
//!   connection factory
//! - `GET /ws/assistant/{userId}`: WebSocket relayed to the assistant
//! - `ANY /webhook/{userId}/{id}`: forwarded to the engine's webhook handler
//! - `GET /health`

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::{future, SinkExt, StreamExt};
use hub_core::{ShardId, UserId};
use hub_rpc::{ConnectionFactory, EngineHandle, WebhookRequest};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::manager::{ControlStatus, EngineManagerClient, WebhookResponse};
use crate::relay::{relay, LocalFrame};

/// Close code sent when the engine cannot be reached.
const CLOSE_ENGINE_UNAVAILABLE: u16 = 1011;

pub fn router(manager: Arc<EngineManagerClient>) -> Router {
    Router::new()
        .route("/ws/sync/{user_id}", get(sync_socket))
        .route("/ws/assistant/{user_id}", get(assistant_socket))
        .route("/webhook/{user_id}/{id}", any(webhook))
        .route("/health", get(health))
        .with_state(manager)
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Sync,
    Assistant,
}

impl Channel {
    fn factory(self, engine: &EngineHandle) -> &ConnectionFactory {
        match self {
            Channel::Sync => engine.websocket(),
            Channel::Assistant => engine.assistant(),
        }
    }
}

async fn sync_socket(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<EngineManagerClient>>,
    Path(user): Path<String>,
) -> impl IntoResponse {
    let user = UserId::from(user.as_str());
    ws.on_upgrade(move |socket| serve_socket(socket, manager, user, Channel::Sync))
}

async fn assistant_socket(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<EngineManagerClient>>,
    Path(user): Path<String>,
) -> impl IntoResponse {
    let user = UserId::from(user.as_str());
    ws.on_upgrade(move |socket| serve_socket(socket, manager, user, Channel::Assistant))
}

fn into_local(msg: Message) -> LocalFrame {
    match msg {
        Message::Text(text) => LocalFrame::Text(text.as_str().to_string()),
        Message::Binary(data) => LocalFrame::Binary(data.to_vec()),
        Message::Ping(_) => LocalFrame::Ping,
        Message::Pong(_) => LocalFrame::Pong,
        Message::Close(frame) => LocalFrame::Close(frame.map(|f| f.code)),
    }
}

fn into_message(frame: LocalFrame) -> Message {
    match frame {
        LocalFrame::Text(text) => Message::Text(text.into()),
        LocalFrame::Binary(data) => Message::Binary(data.into()),
        LocalFrame::Ping => Message::Ping(Bytes::new()),
        LocalFrame::Pong => Message::Pong(Bytes::new()),
        LocalFrame::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code,
            reason: Utf8Bytes::from_static(""),
        })),
    }
}

async fn serve_socket(
    mut socket: WebSocket,
    manager: Arc<EngineManagerClient>,
    user: UserId,
    channel: Channel,
) {
    // Subscribe first so a loss during binding is not missed.
    let closed = manager.subscribe_closed();

    let engine = match manager.get_engine(&user).await {
        Ok(engine) => engine,
        Err(e) => {
            warn!(user = %user, ?channel, error = %e, "cannot open engine for websocket");
            let reason: String = e.to_string().chars().take(120).collect();
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_ENGINE_UNAVAILABLE,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    info!(user = %user, ?channel, "websocket connected");
    let factory = channel.factory(&engine).clone();
    let (sink, stream) = socket.split();
    let incoming = stream.map(|msg| msg.map(into_local));
    let outgoing = sink.with(|frame: LocalFrame| future::ready(Ok::<_, axum::Error>(into_message(frame))));

    let watched = user.clone();
    let end = relay(
        incoming,
        outgoing,
        move |delegate| async move { factory.new_connection(delegate).await },
        async move { closed.until_lost(&watched, &engine).await },
    )
    .await;
    info!(user = %user, ?channel, ?end, "websocket closed");
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

/// JSON if it parses, the raw text otherwise, null when empty.
fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn webhook_reply(res: WebhookResponse) -> Response {
    let status = StatusCode::from_u16(res.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match (res.content_type, res.body) {
        (Some(content_type), Value::String(text)) => {
            (status, [(header::CONTENT_TYPE, content_type)], text).into_response()
        }
        (Some(content_type), body) => {
            (status, [(header::CONTENT_TYPE, content_type)], body.to_string()).into_response()
        }
        (None, body) => (status, Json(body)).into_response(),
    }
}

async fn webhook(
    State(manager): State<Arc<EngineManagerClient>>,
    Path((user, id)): Path<(String, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user = UserId::from(user.as_str());
    let request = WebhookRequest {
        id,
        method: method.as_str().to_string(),
        query: query.into_iter().map(|(k, v)| (k, Value::String(v))).collect::<Map<_, _>>(),
        headers: header_map(&headers),
        body: parse_body(&body),
    };

    webhook_reply(manager.dispatch_webhook(&user, request).await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShardHealth {
    shard_id: ShardId,
    control: ControlStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    shards: Vec<ShardHealth>,
    cached_engines: usize,
}

async fn health(State(manager): State<Arc<EngineManagerClient>>) -> Json<HealthReport> {
    let shards = manager
        .router()
        .shards()
        .map(|shard_id| ShardHealth {
            shard_id,
            control: manager.control_state(shard_id),
        })
        .collect();
    Json(HealthReport {
        shards,
        cached_engines: manager.cached_engines(),
    })
}
