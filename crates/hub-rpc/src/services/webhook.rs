//! Webhook callbacks forwarded to a user's engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RpcError;
use crate::object::{arg, reply, RemoteObject, RpcObject};
use crate::socket::RpcSocket;

pub const WEBHOOK_METHODS: &[&str] = &["handleCallback"];

/// One inbound HTTP request on `/webhook/{userId}/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub id: String,
    pub method: String,
    pub query: Map<String, Value>,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// What the engine wants sent back. A service answering `None` leaves the
/// reply to the caller (the front end sends 200 `{"result":"ok"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResult {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub response: Value,
}

#[async_trait]
pub trait WebhookService: Send + Sync + 'static {
    async fn handle_callback(
        &self,
        request: WebhookRequest,
    ) -> Result<Option<WebhookResult>, RpcError>;
}

pub struct WebhookSkeleton<S: ?Sized> {
    service: Arc<S>,
}

impl<S: WebhookService + ?Sized> WebhookSkeleton<S> {
    pub fn new(service: Arc<S>) -> Arc<Self> {
        Arc::new(WebhookSkeleton { service })
    }
}

#[async_trait]
impl<S: WebhookService + ?Sized> RpcObject for WebhookSkeleton<S> {
    fn methods(&self) -> &'static [&'static str] {
        WEBHOOK_METHODS
    }

    async fn invoke(
        &self,
        _socket: &RpcSocket,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        if method != "handleCallback" {
            return Err(RpcError::UnknownMethod(method.to_string()));
        }
        let request = WebhookRequest {
            id: arg(&params, 0, "id")?,
            method: arg(&params, 1, "method")?,
            query: arg::<Option<_>>(&params, 2, "query")?.unwrap_or_default(),
            headers: arg::<Option<_>>(&params, 3, "headers")?.unwrap_or_default(),
            body: params.get(4).cloned().unwrap_or(Value::Null),
        };
        reply(self.service.handle_callback(request).await?)
    }
}

#[derive(Clone, Debug)]
pub struct WebhookProxy {
    remote: RemoteObject,
}

impl WebhookProxy {
    pub fn new(remote: RemoteObject) -> Self {
        WebhookProxy { remote }
    }
}

#[async_trait]
impl WebhookService for WebhookProxy {
    async fn handle_callback(
        &self,
        request: WebhookRequest,
    ) -> Result<Option<WebhookResult>, RpcError> {
        let WebhookRequest {
            id,
            method,
            query,
            headers,
            body,
        } = request;
        let params = vec![
            Value::String(id),
            Value::String(method),
            Value::Object(query),
            reply(headers)?,
            body,
        ];

        let value = self.remote.call("handleCallback", params).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RpcError::Protocol(format!("bad webhook result: {e}")))
    }
}
