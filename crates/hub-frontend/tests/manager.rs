// Connection manager, relay and webhook routes against in-process workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::channel::mpsc as fmpsc;
use futures::future::join_all;
use futures::StreamExt;
use hub_core::{HubError, ProcessId, ShardId, UserId, UserRecord};
use hub_frontend::{
    relay, ws, ClosedEvent, ControlStatus, EngineManagerClient, FrontendConfig, LocalFrame, RelayEnd,
};
use hub_rpc::services::{
    ConnectionFactoryService, ControlSkeleton, FactorySkeleton, WebhookService, WebhookSkeleton,
};
use hub_rpc::{
    ConnectionEndpoint, ControlService, DelegateProxy, DelegateService, EngineExports, EngineHost,
    RpcError, RpcObject, RpcSocket, WebhookRequest, WebhookResult, WorkerAcceptor,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

struct RecordingControl {
    calls: mpsc::UnboundedSender<String>,
}

impl RecordingControl {
    fn record(&self, call: String) {
        let _ = self.calls.send(call);
    }
}

#[async_trait]
impl ControlService for RecordingControl {
    async fn start(&self, _users: Vec<UserRecord>) -> Result<(), RpcError> {
        Ok(())
    }
    async fn kill_all_users(&self) -> Result<bool, RpcError> {
        self.record("killAllUsers".into());
        Ok(true)
    }
    async fn is_running(&self, user: &UserId) -> Result<bool, RpcError> {
        self.record(format!("isRunning:{user}"));
        Ok(true)
    }
    async fn get_process_id(&self, user: &UserId) -> Result<Option<ProcessId>, RpcError> {
        self.record(format!("getProcessId:{user}"));
        Ok(Some(ProcessId::Pid(77)))
    }
    async fn start_user(&self, user: &UserId) -> Result<(), RpcError> {
        self.record(format!("startUser:{user}"));
        Ok(())
    }
    async fn kill_user(&self, user: &UserId) -> Result<(), RpcError> {
        self.record(format!("killUser:{user}"));
        Ok(())
    }
    async fn delete_user(&self, user: &UserId) -> Result<(), RpcError> {
        self.record(format!("deleteUser:{user}"));
        Ok(())
    }
    async fn clear_cache(&self, user: &UserId) -> Result<(), RpcError> {
        self.record(format!("clearCache:{user}"));
        Ok(())
    }
    async fn restart_user(&self, user: &UserId) -> Result<(), RpcError> {
        self.record(format!("restartUser:{user}"));
        Ok(())
    }
    async fn restart_user_without_cache(&self, user: &UserId) -> Result<(), RpcError> {
        self.record(format!("restartUserWithoutCache:{user}"));
        Ok(())
    }
}

struct Inert;

#[async_trait]
impl RpcObject for Inert {
    fn methods(&self) -> &'static [&'static str] {
        &[]
    }
    async fn invoke(&self, _s: &RpcSocket, m: &str, _p: Vec<Value>) -> Result<Value, RpcError> {
        Err(RpcError::UnknownMethod(m.to_string()))
    }
}

struct Echo {
    delegate: DelegateProxy,
}

#[async_trait]
impl ConnectionEndpoint for Echo {
    async fn on_message(&self, data: String) -> Result<(), RpcError> {
        self.delegate.send(format!("echo:{data}")).await
    }
    async fn on_ping(&self) -> Result<(), RpcError> {
        self.delegate.pong().await
    }
    async fn on_pong(&self) -> Result<(), RpcError> {
        Ok(())
    }
    async fn on_close(&self, _code: Option<u16>) -> Result<(), RpcError> {
        Ok(())
    }
}

struct EchoFactory;

#[async_trait]
impl ConnectionFactoryService for EchoFactory {
    async fn new_connection(
        &self,
        delegate: DelegateProxy,
    ) -> Result<Arc<dyn ConnectionEndpoint>, RpcError> {
        Ok(Arc::new(Echo { delegate }))
    }
}

/// `custom` answers with its own result, everything else is unhandled.
struct Hooks;

#[async_trait]
impl WebhookService for Hooks {
    async fn handle_callback(
        &self,
        request: WebhookRequest,
    ) -> Result<Option<WebhookResult>, RpcError> {
        if request.id != "custom" {
            return Ok(None);
        }
        Ok(Some(WebhookResult {
            code: 202,
            content_type: Some("text/plain".into()),
            response: json!(format!("{} {}", request.method, request.body["n"])),
        }))
    }
}

struct Host {
    control: Arc<RecordingControl>,
    opens: AtomicUsize,
}

#[async_trait]
impl EngineHost for Host {
    fn control(&self) -> Arc<dyn RpcObject> {
        ControlSkeleton::new(self.control.clone())
    }

    async fn open_engine(&self, user: &UserId) -> Result<EngineExports, HubError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        // Long enough for concurrent callers to pile up on the same handshake.
        tokio::time::sleep(Duration::from_millis(50)).await;
        if *user == UserId::from("ghost") {
            return Err(HubError::NotFound(user.clone()));
        }
        Ok(EngineExports {
            engine: Arc::new(Inert),
            devices: Arc::new(Inert),
            apps: Arc::new(Inert),
            assistant: FactorySkeleton::new(Arc::new(EchoFactory)),
            websocket: FactorySkeleton::new(Arc::new(EchoFactory)),
            webhook: WebhookSkeleton::new(Arc::new(Hooks)),
        })
    }
}

struct FakeWorker {
    addr: String,
    host: Arc<Host>,
    calls: mpsc::UnboundedReceiver<String>,
    sockets: Arc<Mutex<Vec<RpcSocket>>>,
    accepted: Arc<AtomicUsize>,
}

impl FakeWorker {
    async fn spawn() -> FakeWorker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, calls) = mpsc::unbounded_channel();
        let host = Arc::new(Host {
            control: Arc::new(RecordingControl { calls: tx }),
            opens: AtomicUsize::new(0),
        });
        let acceptor = WorkerAcceptor::new(host.clone());

        let sockets = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let (s, a) = (sockets.clone(), accepted.clone());
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                a.fetch_add(1, Ordering::SeqCst);
                let socket = acceptor.attach(stream, peer.to_string());
                s.lock().unwrap().push(socket);
            }
        });

        FakeWorker {
            addr,
            host,
            calls,
            sockets,
            accepted,
        }
    }

    async fn next_call(&mut self) -> String {
        tokio::time::timeout(WAIT, self.calls.recv())
            .await
            .expect("timed out waiting for a control call")
            .expect("worker gone")
    }

    fn sever(&self) {
        for socket in self.sockets.lock().unwrap().drain(..) {
            socket.end();
        }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn opens(&self) -> usize {
        self.host.opens.load(Ordering::SeqCst)
    }
}

/// An address nothing listens on.
async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

fn manager(shards: Vec<String>) -> Arc<EngineManagerClient> {
    manager_with(FrontendConfig {
        shards,
        reconnect_secs: 1,
        ..FrontendConfig::default()
    })
}

fn manager_with(config: FrontendConfig) -> Arc<EngineManagerClient> {
    Arc::new(EngineManagerClient::new(&config).unwrap())
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn next_frame(rx: &mut fmpsc::UnboundedReceiver<LocalFrame>) -> Option<LocalFrame> {
    tokio::time::timeout(WAIT, rx.next())
        .await
        .expect("timed out waiting for a frame")
}

#[tokio::test]
async fn concurrent_callers_share_one_connection() {
    let worker = FakeWorker::spawn().await;
    let manager = manager(vec![worker.addr.clone()]);
    let user = UserId::Numeric(42);

    let results = join_all((0..5).map(|_| manager.get_engine(&user))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(worker.accepted(), 1);
    assert_eq!(worker.opens(), 1);

    manager.get_engine(&user).await.unwrap();
    assert_eq!(worker.accepted(), 1);
    assert_eq!(manager.cached_engines(), 1);
}

#[tokio::test]
async fn lost_connection_is_evicted_and_reported_once() {
    let worker = FakeWorker::spawn().await;
    let manager = manager(vec![worker.addr.clone()]);
    let user = UserId::Numeric(42);
    let mut closed = manager.subscribe_closed();

    manager.get_engine(&user).await.unwrap();
    worker.sever();

    let lost = tokio::time::timeout(WAIT, closed.recv()).await.unwrap();
    assert_eq!(lost, Some(ClosedEvent::User(user.clone())));
    assert_eq!(manager.cached_engines(), 0);
    assert!(tokio::time::timeout(Duration::from_millis(200), closed.recv())
        .await
        .is_err());

    manager.get_engine(&user).await.unwrap();
    assert_eq!(worker.accepted(), 2);
}

#[tokio::test]
async fn failed_handshake_is_evicted_and_retried() {
    let worker = FakeWorker::spawn().await;
    let client = manager(vec![worker.addr.clone()]);
    let ghost = UserId::from("ghost");

    let err = client.get_engine(&ghost).await.unwrap_err();
    assert_eq!(err.code(), "E_NOT_FOUND");
    assert_eq!(client.cached_engines(), 0);

    let err = client.get_engine(&ghost).await.unwrap_err();
    assert_eq!(err.code(), "E_NOT_FOUND");
    assert_eq!(worker.opens(), 2);

    let down = manager(vec![dead_addr().await]);
    let err = down.get_engine(&UserId::Numeric(1)).await.unwrap_err();
    assert_eq!(err.code(), "E_TRANSPORT");
    assert_eq!(down.cached_engines(), 0);
}

#[tokio::test]
async fn kill_all_users_reports_missing_shard_but_calls_the_rest() {
    let mut w0 = FakeWorker::spawn().await;
    let mut w1 = FakeWorker::spawn().await;
    let manager = manager(vec![w0.addr.clone(), w1.addr.clone(), dead_addr().await]);
    manager.start();

    wait_until(|| {
        manager.control_state(ShardId(0)) == ControlStatus::Ready
            && manager.control_state(ShardId(1)) == ControlStatus::Ready
    })
    .await;
    assert_ne!(manager.control_state(ShardId(2)), ControlStatus::Ready);

    assert!(!manager.kill_all_users().await);
    assert_eq!(w0.next_call().await, "killAllUsers");
    assert_eq!(w1.next_call().await, "killAllUsers");

    // User 5 lives on shard 2.
    let user = UserId::Numeric(5);
    assert!(!manager.is_running(&user).await.unwrap());
    assert_eq!(manager.get_process_id(&user).await.unwrap(), None);
    assert_eq!(
        manager.start_user(&user).await,
        Err(HubError::Unavailable(ShardId(2)))
    );

    manager.stop();
}

#[tokio::test]
async fn control_ops_reach_owning_shard_and_drop_cache() {
    let mut w0 = FakeWorker::spawn().await;
    let mut w1 = FakeWorker::spawn().await;
    let manager = manager(vec![w0.addr.clone(), w1.addr.clone()]);
    manager.start();
    wait_until(|| {
        manager.control_state(ShardId(0)) == ControlStatus::Ready
            && manager.control_state(ShardId(1)) == ControlStatus::Ready
    })
    .await;

    // 42 mod 2 == 0.
    let user = UserId::from("42");
    assert!(manager.is_running(&user).await.unwrap());
    assert_eq!(w0.next_call().await, "isRunning:42");
    assert_eq!(
        manager.get_process_id(&user).await.unwrap(),
        Some(ProcessId::Pid(77))
    );
    assert_eq!(w0.next_call().await, "getProcessId:42");

    manager.get_engine(&user).await.unwrap();
    assert_eq!(manager.cached_engines(), 1);
    manager.restart_user_without_cache(&user).await.unwrap();
    assert_eq!(w0.next_call().await, "restartUserWithoutCache:42");
    assert_eq!(manager.cached_engines(), 0);

    manager.kill_user(&UserId::Numeric(7)).await.unwrap();
    assert_eq!(w1.next_call().await, "killUser:7");

    manager.stop();
    assert_eq!(manager.control_state(ShardId(0)), ControlStatus::Disconnected);
}

#[tokio::test]
async fn relay_bridges_client_and_engine_until_engine_is_lost() {
    let w0 = FakeWorker::spawn().await;
    let w1 = FakeWorker::spawn().await;
    let manager = manager(vec![w0.addr.clone(), w1.addr.clone()]);
    let user = UserId::Numeric(42);

    let closed = manager.subscribe_closed();
    let engine = manager.get_engine(&user).await.unwrap();
    assert_eq!(w0.accepted(), 1);
    assert_eq!(w1.accepted(), 0);

    let (in_tx, in_rx) = fmpsc::unbounded::<Result<LocalFrame, std::convert::Infallible>>();
    let (out_tx, mut out_rx) = fmpsc::unbounded::<LocalFrame>();
    let factory = engine.websocket().clone();
    let watched = user.clone();
    let watched_engine = engine.clone();
    let task = tokio::spawn(relay(
        in_rx,
        out_tx,
        move |delegate| async move { factory.new_connection(delegate).await },
        async move { closed.until_lost(&watched, &watched_engine).await },
    ));

    in_tx.unbounded_send(Ok(LocalFrame::Text("one".into()))).unwrap();
    in_tx.unbounded_send(Ok(LocalFrame::Text("two".into()))).unwrap();
    in_tx.unbounded_send(Ok(LocalFrame::Ping)).unwrap();
    assert_eq!(next_frame(&mut out_rx).await, Some(LocalFrame::Text("echo:one".into())));
    assert_eq!(next_frame(&mut out_rx).await, Some(LocalFrame::Text("echo:two".into())));
    assert_eq!(next_frame(&mut out_rx).await, Some(LocalFrame::Pong));

    w0.sever();
    assert_eq!(
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap(),
        RelayEnd::EngineClosed
    );
    assert_eq!(next_frame(&mut out_rx).await, Some(LocalFrame::Close(None)));
}

#[tokio::test]
async fn webhook_results_are_mapped() {
    let worker = FakeWorker::spawn().await;
    let manager = manager(vec![worker.addr.clone()]);
    let user = UserId::Numeric(5);

    let res = manager
        .dispatch_webhook(&user, WebhookRequest { id: "plain".into(), ..Default::default() })
        .await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, json!({ "result": "ok" }));

    let res = manager
        .dispatch_webhook(
            &user,
            WebhookRequest {
                id: "custom".into(),
                method: "POST".into(),
                body: json!({ "n": 3 }),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(res.status, 202);
    assert_eq!(res.content_type.as_deref(), Some("text/plain"));
    assert_eq!(res.body, json!("POST 3"));

    let res = manager
        .dispatch_webhook(&UserId::from("ghost"), WebhookRequest::default())
        .await;
    assert_eq!(res.status, 400);
    assert!(res.body["error"].is_string());
}

#[tokio::test]
async fn http_routes() {
    let worker = FakeWorker::spawn().await;
    let manager = manager(vec![worker.addr.clone()]);
    let app = ws::router(manager.clone());

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/9/custom?source=test")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"n":1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(res.headers()["content-type"], "text/plain");
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"POST 1");

    let res = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["cachedEngines"], 1);
    assert_eq!(health["shards"][0]["shardId"], 0);
    assert_eq!(health["shards"][0]["control"], "disconnected");
}

#[tokio::test]
async fn stop_closes_engines_without_reporting_them() {
    let worker = FakeWorker::spawn().await;
    let manager = manager(vec![worker.addr.clone()]);
    let mut closed = manager.subscribe_closed();

    let engine = manager.get_engine(&UserId::Numeric(1)).await.unwrap();
    manager.stop();
    wait_until(|| !engine.is_connected()).await;
    assert_eq!(manager.cached_engines(), 0);
    assert!(tokio::time::timeout(Duration::from_millis(200), closed.recv())
        .await
        .is_err());
    assert_eq!(
        manager.get_engine(&UserId::Numeric(1)).await.err(),
        Some(HubError::ShuttingDown)
    );
}

#[tokio::test]
async fn control_channel_reconnects_after_a_drop_until_stopped() {
    let worker = FakeWorker::spawn().await;
    let manager = manager(vec![worker.addr.clone()]);
    manager.start();
    wait_until(|| manager.control_state(ShardId(0)) == ControlStatus::Ready).await;
    assert_eq!(worker.accepted(), 1);

    let dropped = Instant::now();
    worker.sever();
    wait_until(|| manager.control_state(ShardId(0)) == ControlStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.accepted(), 1);
    assert_eq!(manager.control_state(ShardId(0)), ControlStatus::Disconnected);

    // One reconnect, after the configured one second.
    wait_until(|| manager.control_state(ShardId(0)) == ControlStatus::Ready).await;
    assert!(dropped.elapsed() >= Duration::from_millis(900));
    assert_eq!(worker.accepted(), 2);

    // Stopping during the delay cancels the pending reconnect.
    worker.sever();
    wait_until(|| manager.control_state(ShardId(0)) == ControlStatus::Disconnected).await;
    manager.stop();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(worker.accepted(), 2);
    assert_eq!(manager.control_state(ShardId(0)), ControlStatus::Disconnected);
}

#[tokio::test]
async fn evicted_connections_are_closed() {
    let mut worker = FakeWorker::spawn().await;
    let manager = manager(vec![worker.addr.clone()]);
    let user = UserId::Numeric(1);

    // Control channel not up: the call fails and the cached connection stays.
    let engine = manager.get_engine(&user).await.unwrap();
    assert_eq!(
        manager.clear_cache(&user).await,
        Err(HubError::Unavailable(ShardId(0)))
    );
    assert_eq!(manager.cached_engines(), 1);
    assert!(engine.is_connected());

    manager.start();
    wait_until(|| manager.control_state(ShardId(0)) == ControlStatus::Ready).await;
    manager.clear_cache(&user).await.unwrap();
    assert_eq!(worker.next_call().await, "clearCache:1");
    assert_eq!(manager.cached_engines(), 0);
    wait_until(|| !engine.is_connected()).await;

    // A handshake still in flight when evicted is closed once it lands.
    let opening = {
        let manager = manager.clone();
        let user = user.clone();
        tokio::spawn(async move { manager.get_engine(&user).await })
    };
    wait_until(|| manager.cached_engines() == 1).await;
    manager.kill_user(&user).await.unwrap();
    assert_eq!(worker.next_call().await, "killUser:1");
    let late = opening.await.unwrap().unwrap();
    wait_until(|| !late.is_connected()).await;

    manager.stop();
}

#[tokio::test]
async fn lagging_subscriber_still_learns_of_lost_engines() {
    let worker = FakeWorker::spawn().await;
    let manager = manager_with(FrontendConfig {
        shards: vec![worker.addr.clone()],
        closed_event_capacity: 1,
        ..FrontendConfig::default()
    });
    let users: Vec<UserId> = (0..4).map(UserId::Numeric).collect();
    let engines: Vec<_> = join_all(users.iter().map(|u| manager.get_engine(u)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let mut closed = manager.subscribe_closed();
    let watchers: Vec<_> = users
        .iter()
        .zip(&engines)
        .map(|(user, engine)| {
            let sub = manager.subscribe_closed();
            let (user, engine) = (user.clone(), engine.clone());
            tokio::spawn(async move { sub.until_lost(&user, &engine).await })
        })
        .collect();

    worker.sever();
    wait_until(|| manager.cached_engines() == 0).await;

    // Four notifications through a one-slot channel: user 0's may be gone,
    // but the subscriber is told so instead of waiting forever.
    let seen = tokio::time::timeout(WAIT, closed.wait_for(&UserId::Numeric(0)))
        .await
        .unwrap();
    assert!(seen);
    for watcher in watchers {
        tokio::time::timeout(WAIT, watcher).await.unwrap().unwrap();
    }
}
