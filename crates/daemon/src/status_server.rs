//! Status HTTP server for media-relay
//!
//! Read-only job listings and metrics plus a stop endpoint, for dashboards
//! and for the command surface.

use crate::job::{JobId, JobInfo};
use crate::orchestrator::Orchestrator;
use crate::status::{timestamp_ms, StatusSnapshot, SystemMetrics};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// Host metrics refreshed by a background task
pub type SharedSystem = Arc<RwLock<SystemMetrics>>;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to bind or serve: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
    system: SharedSystem,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StopBody {
    id: String,
    stopping: bool,
}

fn not_found(id: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("no running job {}", id),
        }),
    )
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    Json(state.orchestrator.snapshot())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, (StatusCode, Json<ErrorBody>)> {
    state
        .orchestrator
        .get(&JobId::from(id.as_str()))
        .map(Json)
        .ok_or_else(|| not_found(&id))
}

async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StopBody>), (StatusCode, Json<ErrorBody>)> {
    if state.orchestrator.stop(&JobId::from(id.as_str())) {
        Ok((StatusCode::ACCEPTED, Json(StopBody { id, stopping: true })))
    } else {
        Err(not_found(&id))
    }
}

async fn get_metrics(State(state): State<AppState>) -> Json<StatusSnapshot> {
    let system = state.system.read().await.clone();
    Json(StatusSnapshot {
        timestamp_unix_ms: timestamp_ms(),
        jobs: state.orchestrator.snapshot(),
        gates: state.orchestrator.gate_status(),
        totals: state.orchestrator.totals(),
        system,
    })
}

/// Creates the axum Router with the status endpoints
pub fn create_status_router(orchestrator: Orchestrator, system: SharedSystem) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/stop", post(stop_job))
        .route("/metrics", get(get_metrics))
        .with_state(AppState {
            orchestrator,
            system,
        })
}

pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    addr.parse().map_err(|e: std::net::AddrParseError| ServerError::InvalidAddress {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Serve the status router on `addr` until the task is dropped
pub async fn run_status_server(
    addr: SocketAddr,
    orchestrator: Orchestrator,
    system: SharedSystem,
) -> Result<(), ServerError> {
    let app = create_status_router(orchestrator, system);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyPlan;
    use crate::job::{JobClass, JobPhase};
    use crate::orchestrator::OrchestratorSettings;
    use crate::progress::Progress;
    use crate::transfer::{TransferEngine, TransferSettings};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use media_relay_config::Config;
    use serde_json::Value;
    use tower::ServiceExt;

    fn orchestrator() -> Orchestrator {
        let cfg = Config::default();
        let settings = OrchestratorSettings {
            fetch: None,
            transcode: None,
            transfer: TransferEngine::new(None, TransferSettings::from_config(&cfg.transfer)),
        };
        Orchestrator::new(&ConcurrencyPlan::derive_with_cores(&cfg, 8), settings)
    }

    fn system() -> SharedSystem {
        Arc::new(RwLock::new(SystemMetrics {
            cpu_usage_percent: 12.5,
            mem_usage_percent: 40.0,
            load_avg_1: 1.5,
            load_avg_5: 1.2,
            load_avg_15: 0.9,
        }))
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_jobs_lists_registered_jobs() {
        let orch = orchestrator();
        let registration = orch
            .registry()
            .register(JobId::from("T-0000ABCD"), JobClass::Transcode, "episode-01")
            .unwrap();
        registration.handle().set_phase(JobPhase::Running);
        registration
            .handle()
            .record_progress(&Progress::new(42, "1.50x", Some(120)));

        let (status, body) = call(create_status_router(orch.clone(), system()), "GET", "/jobs").await;

        assert_eq!(status, StatusCode::OK);
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], "T-0000ABCD");
        assert_eq!(jobs[0]["class"], "transcode");
        assert_eq!(jobs[0]["phase"], "running");
        assert_eq!(jobs[0]["last_progress"]["percent"], 42);

        let (status, body) = call(create_status_router(orch, system()), "GET", "/jobs/T-0000ABCD").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "episode-01");
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let orch = orchestrator();

        let (status, body) = call(create_status_router(orch.clone(), system()), "GET", "/jobs/F-DEADBEEF").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("F-DEADBEEF"));

        let (status, _) = call(create_status_router(orch, system()), "POST", "/jobs/F-DEADBEEF/stop").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_endpoint_moves_job_to_stopping() {
        let orch = orchestrator();
        let registration = orch
            .registry()
            .register(JobId::from("F-00000001"), JobClass::Fetch, "movie")
            .unwrap();
        registration.handle().set_phase(JobPhase::Running);
        let signal = registration.cancel_signal();

        let (status, body) = call(create_status_router(orch.clone(), system()), "POST", "/jobs/F-00000001/stop").await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["stopping"], true);
        assert_eq!(orch.get(registration.id()).map(|j| j.phase), Some(JobPhase::Stopping));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_metrics_reports_gates_totals_and_system() {
        let (status, body) = call(create_status_router(orchestrator(), system()), "GET", "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["timestamp_unix_ms"].as_i64().unwrap() > 0);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 0);
        let gates = body["gates"].as_array().unwrap();
        assert_eq!(gates.len(), 3);
        let transcode = gates.iter().find(|g| g["class"] == "transcode").unwrap();
        assert_eq!(transcode["capacity"], 3);
        assert_eq!(body["totals"]["succeeded"], 0);
        assert_eq!(body["system"]["cpu_usage_percent"], 12.5);
    }

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            parse_listen_addr("127.0.0.1:7878").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 7878))
        );
        assert!(matches!(
            parse_listen_addr("localhost"),
            Err(ServerError::InvalidAddress { .. })
        ));
    }
}
