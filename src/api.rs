//! HTTP boundary for external collaborators.
//!
//! The generation side submits change sets and polls job status; the
//! preview side fetches published artifacts by content hash.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::scheduler::{ChangeKind, ChangeSet, SourceUnit, TargetPlatform, Tier, UnitRole};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

#[derive(Deserialize)]
struct UnitPayload {
    name: String,
    content_hash: String,
    #[serde(default)]
    dep_hashes: Vec<String>,
    role: UnitRole,
}

#[derive(Deserialize)]
struct SubmitChangeRequest {
    project_id: Uuid,
    platform: TargetPlatform,
    kind: ChangeKind,
    #[serde(default)]
    units: Vec<UnitPayload>,
    #[serde(default)]
    touches_manifest: bool,
    #[serde(default)]
    touches_build_config: bool,
    #[serde(default)]
    touches_signing: bool,
}

#[derive(Serialize)]
struct SubmitChangeResponse {
    job_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ArtifactResponse {
    content_hash: String,
    platform: String,
    binary_location: String,
    size: u64,
}

#[derive(Serialize)]
struct TierLatency {
    tier: String,
    p50_ms: Option<u64>,
    p95_ms: Option<u64>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/changes", post(submit_change_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(job_status_handler).delete(cancel_job_handler))
        .route("/api/artifacts/:hash", get(get_artifact_handler))
        .route("/api/sla", get(sla_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "API server failed");
    }
}

fn error_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::JobNotFound(_) | EngineError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::NotCancellable { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn submit_change_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitChangeRequest>,
) -> impl IntoResponse {
    let mut change = ChangeSet::new(payload.project_id, payload.platform, payload.kind);
    change.touches_manifest = payload.touches_manifest;
    change.touches_build_config = payload.touches_build_config;
    change.touches_signing = payload.touches_signing;
    for unit in payload.units {
        let mut source = SourceUnit::new(unit.name, unit.content_hash, unit.role);
        source.dep_hashes = unit.dep_hashes;
        change.units.push(source);
    }

    match state.engine.submit(change).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(SubmitChangeResponse {
                job_id: Some(job_id.to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            error_status(&e),
            Json(SubmitChangeResponse {
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.engine.all_jobs().await)
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.job_status(id).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => (error_status(&e), Json(serde_json::json!({ "error": e.to_string() })))
            .into_response(),
    }
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.cancel(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (error_status(&e), Json(serde_json::json!({ "error": e.to_string() })))
            .into_response(),
    }
}

async fn get_artifact_handler(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    match state.engine.get_artifact(&hash).await {
        Ok(artifact) => (
            StatusCode::OK,
            Json(ArtifactResponse {
                content_hash: artifact.content_hash,
                platform: artifact.platform.to_string(),
                binary_location: artifact.location.display().to_string(),
                size: artifact.size,
            }),
        )
            .into_response(),
        Err(e) => (error_status(&e), Json(serde_json::json!({ "error": e.to_string() })))
            .into_response(),
    }
}

async fn sla_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let mut latencies = Vec::new();
    for tier in [Tier::Hot, Tier::Warm, Tier::Cold] {
        let p50 = state.engine.sla_percentile(tier, 0.5).await;
        let p95 = state.engine.sla_percentile(tier, 0.95).await;
        latencies.push(TierLatency {
            tier: tier.to_string(),
            p50_ms: p50.map(|d| d.as_millis() as u64),
            p95_ms: p95.map(|d| d.as_millis() as u64),
        });
    }
    Json(latencies)
}
