//! Front-end client of the shard workers.
//!
//! One [`EngineManagerClient`] per process owns:
//! - a control channel per shard, kept open by a reconnect loop,
//! - the cache of direct engine connections, one per user,
//! - the socket-closed broadcast that relays listen on.
//!
//! Engine connections are opened on demand through [`get_engine`]. The first
//! caller for a user installs the pending connection in the cache; everyone
//! else awaits the same one. Failed handshakes are evicted so the next call
//! retries, and a lost connection is evicted and announced exactly once.
//!
//! [`get_engine`]: EngineManagerClient::get_engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{join_all, FutureExt};
use hub_core::{HubError, ProcessId, ShardId, ShardRouter, UserId};
use hub_rpc::services::WebhookService;
use hub_rpc::{open_direct, open_master, ControlProxy, ControlService, EngineHandle, MasterChannel, WebhookRequest};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FrontendConfig;
use crate::events::ClosedSubscription;
use crate::single_flight::{Flight, SingleFlight};

enum ControlState {
    Disconnected,
    Connecting,
    Ready(MasterChannel),
}

/// Observable state of a shard's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlStatus {
    Disconnected,
    Connecting,
    Ready,
}

/// HTTP answer to a webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Value,
}

type EngineResult = Result<EngineHandle, HubError>;

pub struct EngineManagerClient {
    router: ShardRouter,
    shards: Vec<String>,
    auth: Option<String>,
    reconnect_delay: Duration,
    controls: DashMap<ShardId, ControlState>,
    engines: SingleFlight<UserId, EngineResult>,
    closed_tx: broadcast::Sender<UserId>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl EngineManagerClient {
    pub fn new(config: &FrontendConfig) -> Result<Self, HubError> {
        let shard_count = u32::try_from(config.shards.len())
            .map_err(|_| HubError::InvalidRequest("too many shards".to_string()))?;
        let router = ShardRouter::new(shard_count)?;
        let (closed_tx, _) = broadcast::channel(config.closed_event_capacity.max(1));

        Ok(EngineManagerClient {
            router,
            shards: config.shards.clone(),
            auth: config.manager_auth.clone(),
            reconnect_delay: config.reconnect_delay(),
            controls: router.shards().map(|s| (s, ControlState::Disconnected)).collect(),
            engines: SingleFlight::new(),
            closed_tx,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    /// Spawn the control loop of every shard. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for shard_id in self.router.shards() {
            tokio::spawn(self.clone().control_loop(shard_id));
        }
    }

    fn shard_addr(&self, shard_id: ShardId) -> &str {
        // The router only yields ids below shards.len().
        &self.shards[shard_id.0 as usize]
    }

    fn set_control(&self, shard_id: ShardId, state: ControlState) {
        self.controls.insert(shard_id, state);
    }

    async fn control_loop(self: Arc<Self>, shard_id: ShardId) {
        let addr = self.shard_addr(shard_id).to_string();

        loop {
            self.set_control(shard_id, ControlState::Connecting);
            let res = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = open_master(&addr, self.auth.as_deref()) => res,
            };

            match res {
                Ok(channel) => {
                    if self.shutdown.is_cancelled() {
                        channel.close();
                        break;
                    }
                    info!(shard = %shard_id, addr = %addr, "control channel ready");
                    self.set_control(shard_id, ControlState::Ready(channel.clone()));

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            channel.close();
                            break;
                        }
                        _ = channel.closed() => {}
                    }
                    warn!(shard = %shard_id, addr = %addr, "control channel closed");
                }
                Err(e) => {
                    warn!(shard = %shard_id, addr = %addr, error = %e, "failed to open control channel");
                }
            }

            self.set_control(shard_id, ControlState::Disconnected);
            debug!(shard = %shard_id, delay_secs = self.reconnect_delay.as_secs_f64(), "reconnecting");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        self.set_control(shard_id, ControlState::Disconnected);
    }

    pub fn control_state(&self, shard_id: ShardId) -> ControlStatus {
        match self.controls.get(&shard_id).as_deref() {
            Some(ControlState::Ready(channel)) if channel.is_connected() => ControlStatus::Ready,
            Some(ControlState::Connecting) => ControlStatus::Connecting,
            _ => ControlStatus::Disconnected,
        }
    }

    fn control_for_shard(&self, shard_id: ShardId) -> Option<ControlProxy> {
        match self.controls.get(&shard_id).as_deref() {
            Some(ControlState::Ready(channel)) if channel.is_connected() => {
                Some(channel.control().clone())
            }
            _ => None,
        }
    }

    fn control(&self, user: &UserId) -> Result<ControlProxy, HubError> {
        let shard_id = self.router.shard_of(user);
        self.control_for_shard(shard_id).ok_or_else(|| {
            warn!(user = %user, shard = %shard_id, "control channel not ready");
            HubError::Unavailable(shard_id)
        })
    }

    /// Direct connection to `user`'s engine, opened on first use.
    pub async fn get_engine(self: &Arc<Self>, user: &UserId) -> Result<EngineHandle, HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }

        let this = self.clone();
        let key = user.clone();
        let flight = self.engines.get_or_start(user.clone(), move |generation| {
            // Spawned so the handshake completes even if every caller goes away.
            let task = tokio::spawn(this.open_engine(key, generation));
            async move {
                task.await
                    .unwrap_or_else(|e| Err(HubError::Transport(format!("engine task failed: {e}"))))
            }
            .boxed()
        });
        flight.await
    }

    async fn open_engine(self: Arc<Self>, user: UserId, generation: u64) -> EngineResult {
        let shard_id = self.router.shard_of(&user);
        let addr = self.shard_addr(shard_id);
        info!(user = %user, shard = %shard_id, "connecting to engine");

        match open_direct(addr, self.auth.as_deref(), &user).await {
            Ok(handle) => {
                if self.shutdown.is_cancelled() {
                    handle.close();
                    self.engines.remove_if_current(&user, generation);
                    return Err(HubError::ShuttingDown);
                }
                tokio::spawn(self.clone().watch_engine(user, generation, handle.clone()));
                Ok(handle)
            }
            Err(e) => {
                warn!(user = %user, shard = %shard_id, error = %e, "failed to connect to engine");
                self.engines.remove_if_current(&user, generation);
                Err(e)
            }
        }
    }

    async fn watch_engine(self: Arc<Self>, user: UserId, generation: u64, handle: EngineHandle) {
        handle.closed().await;
        if self.shutdown.is_cancelled() {
            return;
        }

        let evicted = self.engines.remove_if_current(&user, generation);
        info!(user = %user, evicted, "engine connection closed");
        // No subscribers is fine.
        let _ = self.closed_tx.send(user);
    }

    /// Evict `user`'s cached connection and close it.
    fn drop_cached(&self, user: &UserId) {
        if let Some(flight) = self.engines.take(user) {
            debug!(user = %user, "dropped cached engine connection");
            close_flight(flight);
        }
    }

    pub fn cached_engines(&self) -> usize {
        self.engines.len()
    }

    pub fn subscribe_closed(&self) -> ClosedSubscription {
        ClosedSubscription::new(self.closed_tx.subscribe())
    }

    /// False when the shard's control channel is not ready.
    pub async fn is_running(&self, user: &UserId) -> Result<bool, HubError> {
        match self.control_for_shard(self.router.shard_of(user)) {
            Some(control) => Ok(control.is_running(user).await?),
            None => Ok(false),
        }
    }

    /// `None` when the shard's control channel is not ready.
    pub async fn get_process_id(&self, user: &UserId) -> Result<Option<ProcessId>, HubError> {
        match self.control_for_shard(self.router.shard_of(user)) {
            Some(control) => Ok(control.get_process_id(user).await?),
            None => Ok(None),
        }
    }

    pub async fn start_user(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "starting user");
        Ok(self.control(user)?.start_user(user).await?)
    }

    pub async fn kill_user(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "killing user");
        let control = self.control(user)?;
        self.drop_cached(user);
        Ok(control.kill_user(user).await?)
    }

    pub async fn delete_user(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "deleting user");
        let control = self.control(user)?;
        self.drop_cached(user);
        Ok(control.delete_user(user).await?)
    }

    pub async fn clear_cache(&self, user: &UserId) -> Result<(), HubError> {
        let control = self.control(user)?;
        self.drop_cached(user);
        Ok(control.clear_cache(user).await?)
    }

    pub async fn restart_user(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "restarting user");
        let control = self.control(user)?;
        self.drop_cached(user);
        Ok(control.restart_user(user).await?)
    }

    pub async fn restart_user_without_cache(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "restarting user without cache");
        let control = self.control(user)?;
        self.drop_cached(user);
        Ok(control.restart_user_without_cache(user).await?)
    }

    /// Kill every user on every shard. False if any shard is not ready or
    /// fails; the other shards are still called.
    pub async fn kill_all_users(&self) -> bool {
        let calls = self.router.shards().map(|shard_id| async move {
            let Some(control) = self.control_for_shard(shard_id) else {
                warn!(shard = %shard_id, "skipping shard in killAllUsers");
                return false;
            };
            match control.kill_all_users().await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(shard = %shard_id, error = %e, "killAllUsers failed");
                    false
                }
            }
        });

        join_all(calls).await.into_iter().all(|ok| ok)
    }

    /// Forward a webhook to `user`'s engine.
    pub async fn dispatch_webhook(
        self: &Arc<Self>,
        user: &UserId,
        request: WebhookRequest,
    ) -> WebhookResponse {
        let id = request.id.clone();
        let res = async {
            let engine = self.get_engine(user).await?;
            Ok::<_, HubError>(engine.webhook().handle_callback(request).await?)
        }
        .await;

        match res {
            Ok(None) => WebhookResponse {
                status: 200,
                content_type: None,
                body: json!({ "result": "ok" }),
            },
            Ok(Some(result)) => WebhookResponse {
                status: result.code,
                content_type: result.content_type,
                body: result.response,
            },
            Err(e) => {
                warn!(user = %user, webhook = %id, error = %e, "webhook failed");
                WebhookResponse {
                    status: 400,
                    content_type: None,
                    body: json!({ "error": e.to_string() }),
                }
            }
        }
    }

    /// Close every engine and control connection and stop reconnecting.
    pub fn stop(&self) {
        info!("stopping engine manager");
        self.shutdown.cancel();

        for flight in self.engines.drain() {
            close_flight(flight);
        }

        for mut entry in self.controls.iter_mut() {
            if let ControlState::Ready(channel) = entry.value() {
                channel.close();
            }
            *entry.value_mut() = ControlState::Disconnected;
        }
    }
}

/// Close the connection behind `flight`, now or once it is established.
fn close_flight(flight: Flight<EngineResult>) {
    match flight.peek() {
        Some(Ok(handle)) => handle.close(),
        Some(Err(_)) => {}
        None => {
            tokio::spawn(async move {
                if let Ok(handle) = flight.await {
                    handle.close();
                }
            });
        }
    }
}
