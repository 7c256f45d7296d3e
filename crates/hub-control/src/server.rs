//! HTTP control API and top-level server wiring.
//!
//! - `POST /registerBackend`, `GET /deregisterBackend`: backend lifecycle
//! - `GET /engineUrl/{userId}` and the per-user control operations,
//!   forwarded to the owning shard
//! - `GET /killAllUsers`, `GET /health`
//!
//! Errors are answered with a status derived from the error code and a
//! `{code, error}` body.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hub_core::{BackendDescriptor, HubError, ProcessId, ShardRouter, UserId};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::control_plane::ControlPlane;
use crate::roster::{StaticRoster, UserDirectory};
use crate::types::{DeregisterOutcome, HealthReport, RegisterOutcome, RegisterRequest};

/// Error answered by a handler.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(HubError::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(HubError::InvalidRequest(rejection.body_text()))
    }
}

pub fn status_for(err: &HubError) -> StatusCode {
    match err {
        HubError::NotFound(_) => StatusCode::NOT_FOUND,
        HubError::Forbidden(_) => StatusCode::FORBIDDEN,
        HubError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        HubError::Unavailable(_) | HubError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        HubError::Protocol(_)
        | HubError::Handshake { .. }
        | HubError::Transport(_)
        | HubError::Remote { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "code": self.0.code(), "error": self.0.to_string() });
        (status_for(&self.0), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Unit results are answered with the literal body `undefined`, which is
/// what existing callers of this API parse.
fn undefined() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "undefined",
    )
        .into_response()
}

fn user_id(raw: &str) -> UserId {
    UserId::from(raw)
}

pub fn router(plane: ControlPlane) -> Router {
    Router::new()
        .route("/registerBackend", post(register_backend))
        .route("/deregisterBackend", get(deregister_backend))
        .route("/killAllUsers", get(kill_all_users))
        .route("/engineUrl/{user_id}", get(engine_url))
        .route("/isRunning/{user_id}", get(is_running))
        .route("/getProcessId/{user_id}", get(get_process_id))
        .route("/startUser/{user_id}", get(start_user))
        .route("/killUser/{user_id}", get(kill_user))
        .route("/deleteUser/{user_id}", get(delete_user))
        .route("/clearCache/{user_id}", get(clear_cache))
        .route("/restartUser/{user_id}", get(restart_user))
        .route(
            "/restartUserWithoutCache/{user_id}",
            get(restart_user_without_cache),
        )
        .route("/health", get(health))
        .with_state(plane)
}

async fn register_backend(
    State(plane): State<ControlPlane>,
    req: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<Json<RegisterOutcome>> {
    let Json(req) = req?;
    Ok(Json(plane.register_backend(req.backend)?))
}

async fn deregister_backend(
    State(plane): State<ControlPlane>,
    descriptor: Result<Query<BackendDescriptor>, QueryRejection>,
) -> ApiResult<Json<DeregisterOutcome>> {
    let Query(descriptor) = descriptor?;
    Ok(Json(plane.deregister_backend(&descriptor)))
}

async fn kill_all_users(State(plane): State<ControlPlane>) -> Json<bool> {
    Json(plane.kill_all_users().await)
}

async fn engine_url(
    State(plane): State<ControlPlane>,
    Path(user): Path<String>,
) -> ApiResult<Json<String>> {
    info!(user = %user, "engineUrl lookup");
    Ok(Json(plane.engine_url(&user_id(&user))?))
}

async fn is_running(
    State(plane): State<ControlPlane>,
    Path(user): Path<String>,
) -> ApiResult<Json<bool>> {
    Ok(Json(plane.is_running(&user_id(&user)).await?))
}

async fn get_process_id(
    State(plane): State<ControlPlane>,
    Path(user): Path<String>,
) -> ApiResult<Json<ProcessId>> {
    let pid = plane.get_process_id(&user_id(&user)).await?;
    Ok(Json(pid.unwrap_or(ProcessId::Pid(ProcessId::UNKNOWN))))
}

async fn start_user(State(plane): State<ControlPlane>, Path(user): Path<String>) -> ApiResult<Response> {
    plane.start_user(&user_id(&user)).await?;
    Ok(undefined())
}

async fn kill_user(State(plane): State<ControlPlane>, Path(user): Path<String>) -> ApiResult<Response> {
    plane.kill_user(&user_id(&user)).await?;
    Ok(undefined())
}

async fn delete_user(State(plane): State<ControlPlane>, Path(user): Path<String>) -> ApiResult<Response> {
    plane.delete_user(&user_id(&user)).await?;
    Ok(undefined())
}

async fn clear_cache(State(plane): State<ControlPlane>, Path(user): Path<String>) -> ApiResult<Response> {
    plane.clear_cache(&user_id(&user)).await?;
    Ok(undefined())
}

async fn restart_user(State(plane): State<ControlPlane>, Path(user): Path<String>) -> ApiResult<Response> {
    plane.restart_user(&user_id(&user)).await?;
    Ok(undefined())
}

async fn restart_user_without_cache(
    State(plane): State<ControlPlane>,
    Path(user): Path<String>,
) -> ApiResult<Response> {
    plane.restart_user_without_cache(&user_id(&user)).await?;
    Ok(undefined())
}

async fn health(State(plane): State<ControlPlane>) -> Json<HealthReport> {
    Json(plane.health())
}

/// Run the control server with the given configuration until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let router = ShardRouter::new(config.shard_count)?;
    let roster: Arc<dyn UserDirectory> = match &config.roster_file {
        Some(path) => {
            let roster = StaticRoster::from_file(router, path)?;
            if roster.is_empty() {
                warn!(path = %path.display(), "roster file lists no users");
            } else {
                info!(path = %path.display(), users = roster.len(), "loaded roster");
            }
            Arc::new(roster)
        }
        None => Arc::new(StaticRoster::empty(router)),
    };

    let plane = ControlPlane::with_options(
        router,
        roster,
        config.reconnect_delay,
        config.manager_auth.clone(),
    );

    let addr = config.socket_addr_string();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, shards = config.shard_count, "control server listening");

    let app = self::router(plane.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await;

    plane.shutdown();
    info!("control server stopped");
    served.map_err(Into::into)
}
