//! Engine-manager control interface exposed by each shard worker.

use std::sync::Arc;

use async_trait::async_trait;
use hub_core::{ProcessId, UserId, UserRecord};
use serde_json::Value;

use crate::error::RpcError;
use crate::object::{arg, reply, RemoteObject, RpcObject};
use crate::socket::RpcSocket;

pub const CONTROL_METHODS: &[&str] = &[
    "start",
    "killAllUsers",
    "isRunning",
    "getProcessId",
    "startUser",
    "killUser",
    "deleteUser",
    "clearCache",
    "restartUser",
    "restartUserWithoutCache",
];

/// Lifecycle operations on the engines a worker owns.
#[async_trait]
pub trait ControlService: Send + Sync + 'static {
    /// Take ownership of `users` (the shard's full roster).
    async fn start(&self, users: Vec<UserRecord>) -> Result<(), RpcError>;

    async fn kill_all_users(&self) -> Result<bool, RpcError>;

    async fn is_running(&self, user: &UserId) -> Result<bool, RpcError>;

    async fn get_process_id(&self, user: &UserId) -> Result<Option<ProcessId>, RpcError>;

    async fn start_user(&self, user: &UserId) -> Result<(), RpcError>;

    async fn kill_user(&self, user: &UserId) -> Result<(), RpcError>;

    async fn delete_user(&self, user: &UserId) -> Result<(), RpcError>;

    async fn clear_cache(&self, user: &UserId) -> Result<(), RpcError>;

    async fn restart_user(&self, user: &UserId) -> Result<(), RpcError>;

    async fn restart_user_without_cache(&self, user: &UserId) -> Result<(), RpcError>;
}

/// Exports a [`ControlService`] implementation.
pub struct ControlSkeleton<S: ?Sized> {
    service: Arc<S>,
}

impl<S: ControlService + ?Sized> ControlSkeleton<S> {
    pub fn new(service: Arc<S>) -> Arc<Self> {
        Arc::new(ControlSkeleton { service })
    }
}

#[async_trait]
impl<S: ControlService + ?Sized> RpcObject for ControlSkeleton<S> {
    fn methods(&self) -> &'static [&'static str] {
        CONTROL_METHODS
    }

    async fn invoke(
        &self,
        _socket: &RpcSocket,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        if method == "start" {
            let users: Vec<UserRecord> = arg(&params, 0, "users")?;
            self.service.start(users).await?;
            return Ok(Value::Null);
        }
        if method == "killAllUsers" {
            return reply(self.service.kill_all_users().await?);
        }

        let user: UserId = arg(&params, 0, "userId")?;
        let svc = &self.service;
        match method {
            "isRunning" => reply(svc.is_running(&user).await?),
            "getProcessId" => reply(svc.get_process_id(&user).await?),
            "startUser" => svc.start_user(&user).await.map(|_| Value::Null),
            "killUser" => svc.kill_user(&user).await.map(|_| Value::Null),
            "deleteUser" => svc.delete_user(&user).await.map(|_| Value::Null),
            "clearCache" => svc.clear_cache(&user).await.map(|_| Value::Null),
            "restartUser" => svc.restart_user(&user).await.map(|_| Value::Null),
            "restartUserWithoutCache" => svc
                .restart_user_without_cache(&user)
                .await
                .map(|_| Value::Null),
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

/// Client half of [`ControlService`].
#[derive(Clone, Debug)]
pub struct ControlProxy {
    remote: RemoteObject,
}

impl ControlProxy {
    pub fn new(remote: RemoteObject) -> Self {
        ControlProxy { remote }
    }

    pub fn socket(&self) -> &RpcSocket {
        self.remote.socket()
    }

    async fn user_call(&self, method: &str, user: &UserId) -> Result<Value, RpcError> {
        self.remote.call(method, vec![reply(user)?]).await
    }
}

#[async_trait]
impl ControlService for ControlProxy {
    async fn start(&self, users: Vec<UserRecord>) -> Result<(), RpcError> {
        self.remote.call("start", vec![reply(users)?]).await?;
        Ok(())
    }

    async fn kill_all_users(&self) -> Result<bool, RpcError> {
        // Workers that return nothing are treated as having failed.
        let value = self.remote.call("killAllUsers", Vec::new()).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn is_running(&self, user: &UserId) -> Result<bool, RpcError> {
        let value = self.user_call("isRunning", user).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn get_process_id(&self, user: &UserId) -> Result<Option<ProcessId>, RpcError> {
        let value = self.user_call("getProcessId", user).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RpcError::Protocol(format!("bad process id: {e}")))
    }

    async fn start_user(&self, user: &UserId) -> Result<(), RpcError> {
        self.user_call("startUser", user).await.map(|_| ())
    }

    async fn kill_user(&self, user: &UserId) -> Result<(), RpcError> {
        self.user_call("killUser", user).await.map(|_| ())
    }

    async fn delete_user(&self, user: &UserId) -> Result<(), RpcError> {
        self.user_call("deleteUser", user).await.map(|_| ())
    }

    async fn clear_cache(&self, user: &UserId) -> Result<(), RpcError> {
        self.user_call("clearCache", user).await.map(|_| ())
    }

    async fn restart_user(&self, user: &UserId) -> Result<(), RpcError> {
        self.user_call("restartUser", user).await.map(|_| ())
    }

    async fn restart_user_without_cache(&self, user: &UserId) -> Result<(), RpcError> {
        self.user_call("restartUserWithoutCache", user)
            .await
            .map(|_| ())
    }
}
