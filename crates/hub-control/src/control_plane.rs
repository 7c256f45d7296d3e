//! Backend registry and per-shard control channels.
//!
//! Every registered backend gets one task that owns its control channel:
//! - connect and run the `master` handshake,
//! - push the shard's roster through `start(users)`,
//! - wait for the channel to close,
//! - unless the close was requested, wait the reconnect delay and start
//!   over.
//!
//! The slot for a shard exists from the moment registration is accepted
//! until the backend is deregistered, so a second registration for the same
//! shard is rejected even while the first one is still connecting or
//! waiting to reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use hub_core::{BackendDescriptor, HubError, ProcessId, ShardId, ShardRouter, UserId};
use hub_rpc::{open_master, ControlProxy, ControlService, MasterChannel};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::roster::UserDirectory;
use crate::types::{
    BackendEvent, BackendState, BackendStatus, DeregisterOutcome, HealthReport, RegisterOutcome,
};

const EVENT_CAPACITY: usize = 64;

struct Slot {
    generation: u64,
    descriptor: BackendDescriptor,
    channel: Option<MasterChannel>,
    cancel: CancellationToken,
}

struct Inner {
    router: ShardRouter,
    reconnect_delay: Duration,
    auth: Option<String>,
    roster: Arc<dyn UserDirectory>,
    slots: DashMap<ShardId, Slot>,
    next_generation: AtomicU64,
    events: broadcast::Sender<BackendEvent>,
    shutdown: CancellationToken,
}

/// Handle to the control plane. Cheap to clone.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<Inner>,
}

impl ControlPlane {
    pub fn new(router: ShardRouter, roster: Arc<dyn UserDirectory>) -> Self {
        ControlPlane::with_options(router, roster, Duration::from_secs(10), None)
    }

    /// `auth` is sent in the `auth` frame of every control handshake.
    pub fn with_options(
        router: ShardRouter,
        roster: Arc<dyn UserDirectory>,
        reconnect_delay: Duration,
        auth: Option<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ControlPlane {
            inner: Arc::new(Inner {
                router,
                reconnect_delay,
                auth,
                roster,
                slots: DashMap::new(),
                next_generation: AtomicU64::new(1),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn router(&self) -> ShardRouter {
        self.inner.router
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.events.subscribe()
    }

    /// Accept `descriptor` as the backend of its shard and start connecting.
    ///
    /// Returns before the connection is established.
    pub fn register_backend(
        &self,
        descriptor: BackendDescriptor,
    ) -> Result<RegisterOutcome, HubError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }
        let shard_id = descriptor.shard_id;
        if !self.inner.router.contains(shard_id) {
            return Err(HubError::InvalidRequest(format!(
                "shard {shard_id} out of range (shard count {})",
                self.inner.router.shard_count()
            )));
        }

        let (generation, cancel) = match self.inner.slots.entry(shard_id) {
            Entry::Occupied(existing) => {
                info!(shard = %shard_id, url = %descriptor.url, registered = %existing.get().descriptor.url, "backend already connected");
                return Ok(RegisterOutcome::AlreadyRegistered);
            }
            Entry::Vacant(vacant) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let cancel = self.inner.shutdown.child_token();
                vacant.insert(Slot {
                    generation,
                    descriptor: descriptor.clone(),
                    channel: None,
                    cancel: cancel.clone(),
                });
                (generation, cancel)
            }
        };

        info!(shard = %shard_id, url = %descriptor.url, engine_url = %descriptor.engine_url, "registering backend");
        tokio::spawn(self.clone().run_backend(descriptor, generation, cancel));
        Ok(RegisterOutcome::Registered)
    }

    /// Close the shard's control channel without reconnecting.
    pub fn deregister_backend(&self, descriptor: &BackendDescriptor) -> DeregisterOutcome {
        let Some((_, slot)) = self.inner.slots.remove(&descriptor.shard_id) else {
            info!(shard = %descriptor.shard_id, url = %descriptor.url, "backend already deregistered");
            return DeregisterOutcome::NotRegistered;
        };

        info!(shard = %descriptor.shard_id, url = %slot.descriptor.url, "deregistering backend");
        slot.cancel.cancel();
        if let Some(channel) = slot.channel {
            channel.close();
        }
        DeregisterOutcome::Deregistered
    }

    async fn run_backend(self, descriptor: BackendDescriptor, generation: u64, cancel: CancellationToken) {
        let shard_id = descriptor.shard_id;
        let auth = self.inner.auth.clone();

        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => break,
                res = open_master(&descriptor.url, auth.as_deref()) => res,
            };

            match res {
                Ok(channel) => {
                    if !self.attach_channel(shard_id, generation, &channel) {
                        channel.close();
                        break;
                    }
                    info!(shard = %shard_id, url = %descriptor.url, "channel to backend ready");
                    self.emit(BackendEvent::Ready { shard_id });

                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = self.start_backend(shard_id, channel.control()) => {}
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => channel.close(),
                        _ = channel.closed() => {}
                    }
                    self.detach_channel(shard_id, generation);

                    let expected = cancel.is_cancelled();
                    self.emit(BackendEvent::Closed { shard_id, expected });
                    if expected {
                        debug!(shard = %shard_id, url = %descriptor.url, "channel to backend closed");
                        break;
                    }
                    warn!(shard = %shard_id, url = %descriptor.url, "control channel to backend severed");
                }
                Err(e) => {
                    warn!(shard = %shard_id, url = %descriptor.url, error = %e, "failed to connect to backend");
                }
            }

            let delay = self.inner.reconnect_delay;
            info!(shard = %shard_id, delay_secs = delay.as_secs_f64(), "reconnecting");
            self.emit(BackendEvent::ReconnectScheduled { shard_id, delay });
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn start_backend(&self, shard_id: ShardId, control: &ControlProxy) {
        let users = match self.inner.roster.users_for_shard(shard_id).await {
            Ok(users) => users,
            Err(e) => {
                warn!(shard = %shard_id, error = %e, "failed to load roster");
                return;
            }
        };

        info!(shard = %shard_id, users = users.len(), "starting backend");
        if let Err(e) = control.start(users).await {
            warn!(shard = %shard_id, error = %e, "backend start failed");
        }
    }

    /// Store `channel` in the shard's slot if the slot still belongs to this
    /// registration.
    fn attach_channel(&self, shard_id: ShardId, generation: u64, channel: &MasterChannel) -> bool {
        match self.inner.slots.get_mut(&shard_id) {
            Some(mut slot) if slot.generation == generation => {
                slot.channel = Some(channel.clone());
                true
            }
            _ => false,
        }
    }

    fn detach_channel(&self, shard_id: ShardId, generation: u64) {
        if let Some(mut slot) = self.inner.slots.get_mut(&shard_id) {
            if slot.generation == generation {
                slot.channel = None;
            }
        }
    }

    fn emit(&self, event: BackendEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn control_for_shard(&self, shard_id: ShardId) -> Result<ControlProxy, HubError> {
        self.inner
            .slots
            .get(&shard_id)
            .and_then(|slot| slot.channel.as_ref().filter(|c| c.is_connected()).cloned())
            .map(|channel| channel.control().clone())
            .ok_or(HubError::Unavailable(shard_id))
    }

    fn control(&self, user: &UserId) -> Result<ControlProxy, HubError> {
        let shard_id = self.inner.router.shard_of(user);
        self.control_for_shard(shard_id).inspect_err(|_| {
            warn!(user = %user, shard = %shard_id, "cannot find backend for user");
        })
    }

    /// Descriptor of the backend owning `user`.
    pub fn backend_for(&self, user: &UserId) -> Result<BackendDescriptor, HubError> {
        let shard_id = self.inner.router.shard_of(user);
        self.inner
            .slots
            .get(&shard_id)
            .map(|slot| slot.descriptor.clone())
            .ok_or(HubError::Unavailable(shard_id))
    }

    pub fn engine_url(&self, user: &UserId) -> Result<String, HubError> {
        self.backend_for(user).map(|d| d.engine_url)
    }

    pub async fn is_running(&self, user: &UserId) -> Result<bool, HubError> {
        Ok(self.control(user)?.is_running(user).await?)
    }

    pub async fn get_process_id(&self, user: &UserId) -> Result<Option<ProcessId>, HubError> {
        Ok(self.control(user)?.get_process_id(user).await?)
    }

    pub async fn start_user(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "starting user");
        Ok(self.control(user)?.start_user(user).await?)
    }

    pub async fn kill_user(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "killing user");
        Ok(self.control(user)?.kill_user(user).await?)
    }

    pub async fn delete_user(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "deleting user");
        Ok(self.control(user)?.delete_user(user).await?)
    }

    pub async fn clear_cache(&self, user: &UserId) -> Result<(), HubError> {
        Ok(self.control(user)?.clear_cache(user).await?)
    }

    pub async fn restart_user(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "restarting user");
        Ok(self.control(user)?.restart_user(user).await?)
    }

    pub async fn restart_user_without_cache(&self, user: &UserId) -> Result<(), HubError> {
        info!(user = %user, "restarting user without cache");
        Ok(self.control(user)?.restart_user_without_cache(user).await?)
    }

    /// Kill every user on every shard. False if any shard is missing or
    /// fails; the other shards are still called.
    pub async fn kill_all_users(&self) -> bool {
        let calls = self.inner.router.shards().map(|shard_id| async move {
            let control = match self.control_for_shard(shard_id) {
                Ok(control) => control,
                Err(e) => {
                    warn!(shard = %shard_id, error = %e, "skipping shard in killAllUsers");
                    return false;
                }
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

    pub fn health(&self) -> HealthReport {
        let mut backends: Vec<BackendStatus> = self
            .inner
            .slots
            .iter()
            .map(|slot| BackendStatus {
                descriptor: slot.descriptor.clone(),
                state: match &slot.channel {
                    Some(c) if c.is_connected() => BackendState::Ready,
                    _ => BackendState::Connecting,
                },
            })
            .collect();
        backends.sort_by_key(|b| b.descriptor.shard_id);

        HealthReport {
            shard_count: self.inner.router.shard_count(),
            backends,
        }
    }

    /// Close every control channel and stop all reconnects.
    pub fn shutdown(&self) {
        info!("stopping control plane");
        self.inner.shutdown.cancel();

        let shards: Vec<ShardId> = self.inner.slots.iter().map(|s| *s.key()).collect();
        for shard_id in shards {
            if let Some((_, slot)) = self.inner.slots.remove(&shard_id) {
                if let Some(channel) = slot.channel {
                    channel.close();
                }
            }
        }
    }
}
