// End-to-end handshakes against an in-process worker over TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hub_core::{HubError, ProcessId, UserId, UserRecord};
use hub_rpc::services::{
    ConnectionFactoryService, DelegateSkeleton, FactorySkeleton, WebhookService,
    WebhookSkeleton,
};
use hub_rpc::{
    open_direct, open_master, ConnectionEndpoint, ControlService, DelegateProxy,
    DelegateService, EngineExports, EngineHost, RpcError, RpcObject, RpcSocket,
    WebhookRequest, WebhookResult, WorkerAcceptor,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Control {
    started: AtomicUsize,
}

#[async_trait]
impl ControlService for Control {
    async fn start(&self, users: Vec<UserRecord>) -> Result<(), RpcError> {
        self.started.fetch_add(users.len(), Ordering::SeqCst);
        Ok(())
    }
    async fn kill_all_users(&self) -> Result<bool, RpcError> {
        Ok(true)
    }
    async fn is_running(&self, user: &UserId) -> Result<bool, RpcError> {
        Ok(*user == UserId::Numeric(1))
    }
    async fn get_process_id(&self, _user: &UserId) -> Result<Option<ProcessId>, RpcError> {
        Ok(Some(ProcessId::Pid(4242)))
    }
    async fn start_user(&self, _user: &UserId) -> Result<(), RpcError> {
        Ok(())
    }
    async fn kill_user(&self, user: &UserId) -> Result<(), RpcError> {
        Err(RpcError::Remote {
            message: format!("{user} is not running"),
            code: Some("ENOENT".into()),
        })
    }
    async fn delete_user(&self, _user: &UserId) -> Result<(), RpcError> {
        Ok(())
    }
    async fn clear_cache(&self, _user: &UserId) -> Result<(), RpcError> {
        Ok(())
    }
    async fn restart_user(&self, _user: &UserId) -> Result<(), RpcError> {
        Ok(())
    }
    async fn restart_user_without_cache(&self, _user: &UserId) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Stand-in for the engine, devices and apps capabilities.
struct Named(&'static str);

#[async_trait]
impl RpcObject for Named {
    fn methods(&self) -> &'static [&'static str] {
        &["name"]
    }
    async fn invoke(&self, _s: &RpcSocket, _m: &str, _p: Vec<Value>) -> Result<Value, RpcError> {
        Ok(json!(self.0))
    }
}

struct Upper {
    delegate: DelegateProxy,
}

#[async_trait]
impl ConnectionEndpoint for Upper {
    async fn on_message(&self, data: String) -> Result<(), RpcError> {
        self.delegate.send(data.to_uppercase()).await
    }
    async fn on_ping(&self) -> Result<(), RpcError> {
        Ok(())
    }
    async fn on_pong(&self) -> Result<(), RpcError> {
        Ok(())
    }
    async fn on_close(&self, _code: Option<u16>) -> Result<(), RpcError> {
        self.delegate.terminate().await
    }
}

struct UpperFactory;

#[async_trait]
impl ConnectionFactoryService for UpperFactory {
    async fn new_connection(
        &self,
        delegate: DelegateProxy,
    ) -> Result<Arc<dyn ConnectionEndpoint>, RpcError> {
        Ok(Arc::new(Upper { delegate }))
    }
}

struct NoHooks;

#[async_trait]
impl WebhookService for NoHooks {
    async fn handle_callback(
        &self,
        _request: WebhookRequest,
    ) -> Result<Option<WebhookResult>, RpcError> {
        Ok(None)
    }
}

struct Host {
    control: Arc<Control>,
}

#[async_trait]
impl EngineHost for Host {
    fn control(&self) -> Arc<dyn RpcObject> {
        hub_rpc::services::ControlSkeleton::new(self.control.clone())
    }

    async fn open_engine(&self, user: &UserId) -> Result<EngineExports, HubError> {
        if *user == UserId::from("ghost") {
            return Err(HubError::NotFound(user.clone()));
        }
        Ok(EngineExports {
            engine: Arc::new(Named("engine")),
            devices: Arc::new(Named("devices")),
            apps: Arc::new(Named("apps")),
            assistant: FactorySkeleton::new(Arc::new(UpperFactory)),
            websocket: FactorySkeleton::new(Arc::new(UpperFactory)),
            webhook: WebhookSkeleton::new(Arc::new(NoHooks)),
        })
    }
}

async fn spawn_worker(auth: Option<&str>) -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut acceptor = WorkerAcceptor::new(Arc::new(Host {
        control: Arc::new(Control {
            started: AtomicUsize::new(0),
        }),
    }));
    if let Some(token) = auth {
        acceptor = acceptor.with_auth(token);
    }
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { acceptor.serve(listener, token).await });
    (addr, shutdown)
}

struct Collect(mpsc::UnboundedSender<String>);

#[async_trait]
impl DelegateService for Collect {
    async fn send(&self, data: String) -> Result<(), RpcError> {
        let _ = self.0.send(data);
        Ok(())
    }
    async fn ping(&self) -> Result<(), RpcError> {
        Ok(())
    }
    async fn pong(&self) -> Result<(), RpcError> {
        Ok(())
    }
    async fn terminate(&self) -> Result<(), RpcError> {
        let _ = self.0.send("<terminate>".into());
        Ok(())
    }
}

#[tokio::test]
async fn master_channel_forwards_control_calls() {
    let (addr, _shutdown) = spawn_worker(None).await;
    let master = open_master(&format!("tcp://{addr}"), None).await.unwrap();
    let control = master.control();

    assert!(control.kill_all_users().await.unwrap());
    assert!(control.is_running(&UserId::Numeric(1)).await.unwrap());
    assert!(!control.is_running(&UserId::Numeric(2)).await.unwrap());
    assert_eq!(
        control.get_process_id(&UserId::Numeric(1)).await.unwrap(),
        Some(ProcessId::Pid(4242))
    );

    let err = control.kill_user(&UserId::Numeric(9)).await.unwrap_err();
    assert_eq!(err.code(), "ENOENT");
    // The channel survives a failed call.
    control.start_user(&UserId::Numeric(9)).await.unwrap();
}

#[tokio::test]
async fn direct_connection_exposes_capabilities() {
    let (addr, _shutdown) = spawn_worker(None).await;
    let engine = open_direct(&addr, None, &UserId::Numeric(7)).await.unwrap();

    let name = engine.devices().call("name", vec![]).await.unwrap();
    assert_eq!(name, json!("devices"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = engine
        .websocket()
        .new_connection(DelegateSkeleton::new(Arc::new(Collect(tx))))
        .await
        .unwrap();
    conn.on_message("hello".into()).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "HELLO");
    conn.on_close(Some(1000)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "<terminate>");

    let hook = engine
        .webhook()
        .handle_callback(WebhookRequest {
            id: "nope".into(),
            method: "GET".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(hook.is_none());
}

#[tokio::test]
async fn direct_to_unknown_user_reports_error() {
    let (addr, _shutdown) = spawn_worker(None).await;
    let err = open_direct(&addr, None, &UserId::from("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E_NOT_FOUND");
    assert!(matches!(err, HubError::Handshake { .. }));
}

#[tokio::test]
async fn auth_is_enforced() {
    let (addr, _shutdown) = spawn_worker(Some("s3cret")).await;

    let err = open_master(&addr, None).await.unwrap_err();
    assert_eq!(err.code(), "E_FORBIDDEN");

    let err = open_master(&addr, Some("wrong")).await.unwrap_err();
    assert_eq!(err.code(), "E_FORBIDDEN");

    let master = open_master(&addr, Some("s3cret")).await.unwrap();
    assert!(master.control().kill_all_users().await.unwrap());
}

#[tokio::test]
async fn worker_shutdown_closes_channels() {
    let (addr, shutdown) = spawn_worker(None).await;
    let master = open_master(&addr, None).await.unwrap();

    shutdown.cancel();
    master.closed().await;
    assert!(!master.is_connected());
    assert_eq!(
        master.control().kill_all_users().await,
        Err(RpcError::SocketClosed)
    );
}

#[tokio::test]
async fn connect_failure_is_transport_error() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let err = open_master(&addr, None).await.unwrap_err();
    assert_eq!(err.code(), "E_TRANSPORT");
}
