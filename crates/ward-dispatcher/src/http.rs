//! HTTP/JSON binding for the worker/client RPC surface. One concrete
//! transport binding for the coordination kernel: a single `AppState`, one
//! `Router`, background loops spawned alongside `axum::serve`, graceful
//! shutdown via `tokio::sync::watch`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use uuid::Uuid;
use ward_core::RetryPolicy;

use crate::config::DispatcherConfig;
use crate::dispatcher::{Coordinator, DispatchError, HeartbeatOutcome, LeaseOutcome, TerminalOutcome};

pub struct CoordinatorServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl CoordinatorServer {
    /// Binds `bind`, opens (and replays) the WAL at `config.wal_path`, and
    /// starts the HTTP router plus the expiry and batch-sync background
    /// tickers, all driven by the same `shutdown` watch channel so `Ctrl+C`
    /// (or a test's explicit `shutdown()`) stops everything in lockstep.
    pub async fn start(config: DispatcherConfig, bind: SocketAddr) -> anyhow::Result<Self> {
        let (coordinator, stats) = Coordinator::open(config)?;
        tracing::info!(
            records = stats.record_count,
            duration_ms = stats.duration.as_millis(),
            "coordinator ready"
        );
        let coordinator = Arc::new(coordinator);

        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let app = build_router(coordinator.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let expiry_coordinator = coordinator.clone();
        let expiry_rx = shutdown_rx.clone();
        let expiry_handle = tokio::spawn(async move {
            expiry_coordinator.run_expiry_ticker(expiry_rx).await;
        });

        let batch_coordinator = coordinator.clone();
        let batch_rx = shutdown_rx.clone();
        let batch_handle = tokio::spawn(async move {
            batch_coordinator.run_batch_sync_ticker(batch_rx).await;
        });

        let mut serve_shutdown = shutdown_rx.clone();
        let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*serve_shutdown.borrow() {
                if serve_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

        let join = tokio::spawn(async move {
            if let Err(err) = server.await {
                tracing::error!(error = %err, "coordinator http server exited with error");
            }
            let _ = expiry_handle.await;
            let _ = batch_handle.await;
        });

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await?;
        Ok(())
    }
}

fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/v1/tasks", post(submit_task))
        .route("/v1/leases", post(request_lease))
        .route("/v1/leases/heartbeat", post(heartbeat))
        .route("/v1/leases/complete", post(complete))
        .route("/v1/leases/fail", post(fail))
        .route("/v1/status", get(status))
        .with_state(coordinator)
}

type ApiResult<T> = Result<T, ApiError>;

struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Durability(_) => {
                tracing::error!(error = %err, "durability failure, operation never happened");
                ApiError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: "durability failure, retry with the same request_id".into(),
                }
            }
            DispatchError::Rejected(msg) => ApiError {
                status: StatusCode::BAD_REQUEST,
                message: msg,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    payload_base64: String,
    execution_window_secs: i64,
    /// Omitted entirely means "use the coordinator's configured default",
    /// not zero.
    #[serde(default)]
    max_attempts: Option<i64>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    task_id: Uuid,
}

async fn submit_task(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<SubmitTaskRequest>,
) -> ApiResult<Json<SubmitTaskResponse>> {
    let payload = base64::engine::general_purpose::STANDARD
        .decode(&req.payload_base64)
        .map_err(|err| ApiError {
            status: StatusCode::BAD_REQUEST,
            message: format!("invalid payload_base64: {err}"),
        })?;

    let max_attempts = req.max_attempts.unwrap_or(coordinator.config().max_retries);
    let task_id = coordinator
        .submit_task(
            payload,
            req.execution_window_secs,
            RetryPolicy { max_attempts },
            req.request_id,
        )
        .await?;

    Ok(Json(SubmitTaskResponse { task_id }))
}

#[derive(Debug, Deserialize)]
struct RequestLeaseRequest {
    worker_id: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum RequestLeaseResponse {
    Granted {
        task_id: Uuid,
        lease_id: Uuid,
        attempt: i64,
        payload_base64: String,
        lease_expiry: DateTime<Utc>,
    },
    NoWork,
}

async fn request_lease(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<RequestLeaseRequest>,
) -> ApiResult<Json<RequestLeaseResponse>> {
    let outcome = coordinator.request_lease(&req.worker_id).await?;
    let body = match outcome {
        LeaseOutcome::Granted {
            task_id,
            lease_id,
            payload,
            lease_expiry,
            attempt,
        } => RequestLeaseResponse::Granted {
            task_id,
            lease_id,
            attempt,
            payload_base64: base64::engine::general_purpose::STANDARD.encode(payload),
            lease_expiry,
        },
        LeaseOutcome::NoWork => RequestLeaseResponse::NoWork,
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    worker_id: String,
    task_id: Uuid,
    lease_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HeartbeatResponse {
    Committed { new_expiry: DateTime<Utc> },
    Rejected { reason: String },
}

async fn heartbeat(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let outcome = coordinator.heartbeat(&req.worker_id, req.task_id, req.lease_id).await?;
    let body = match outcome {
        HeartbeatOutcome::Committed { new_expiry } => HeartbeatResponse::Committed { new_expiry },
        HeartbeatOutcome::Rejected(reason) => HeartbeatResponse::Rejected { reason },
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct TerminalRequest {
    task_id: Uuid,
    lease_id: Uuid,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TerminalResponse {
    Committed,
    Cancelled,
    Rejected { reason: String },
}

impl From<TerminalOutcome> for TerminalResponse {
    fn from(outcome: TerminalOutcome) -> Self {
        match outcome {
            TerminalOutcome::Committed => TerminalResponse::Committed,
            TerminalOutcome::Cancelled => TerminalResponse::Cancelled,
            TerminalOutcome::Rejected(reason) => TerminalResponse::Rejected { reason },
        }
    }
}

async fn complete(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<TerminalRequest>,
) -> ApiResult<Json<TerminalResponse>> {
    let outcome = coordinator.complete(req.task_id, req.lease_id).await?;
    Ok(Json(outcome.into()))
}

async fn fail(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<TerminalRequest>,
) -> ApiResult<Json<TerminalResponse>> {
    let reason = req.reason.unwrap_or_else(|| "unspecified".to_string());
    let outcome = coordinator.fail(req.task_id, req.lease_id, reason).await?;
    Ok(Json(outcome.into()))
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<ward_core::MetricsSnapshot> {
    Json(coordinator.metrics_snapshot())
}

/// Runs the coordinator HTTP server until `Ctrl+C`. Used by the
/// `coordinator` binary crate; kept here (rather than in `main.rs`) so
/// integration tests and the binary share the exact same startup path.
pub async fn run_until_ctrl_c(config: DispatcherConfig, bind: SocketAddr) -> anyhow::Result<()> {
    let server = CoordinatorServer::start(config, bind).await?;
    tracing::info!(addr = %server.addr, "coordinator listening");
    tokio::signal::ctrl_c().await?;
    tracing::info!("coordinator shutting down");
    server.shutdown().await?;
    Ok(())
}
