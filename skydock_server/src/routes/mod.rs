//! Deployment orchestrator HTTP routes — webhook, API, WebSocket.

pub mod api;
pub mod webhook;
pub mod ws;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;

use crate::error::AppError;
use crate::models::DeploymentRun;
use crate::services::orchestrator::Orchestrator;
use crate::services::rollback::{RollbackCandidate, RollbackService};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub rollback: Arc<RollbackService>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        // Webhook
        .route("/webhooks/source", post(webhook_handler))
        // Integration API
        .route("/api/v1/integrations", post(link_integration_handler))
        // Pipeline API
        .route("/api/v1/pipelines/create", post(create_pipeline_handler))
        .route("/api/v1/pipelines/execute", post(execute_pipeline_handler))
        .route("/api/v1/pipelines/{pipeline_id}/status", get(pipeline_status_handler))
        // Rollback API
        .route("/api/v1/rollback/commit", post(rollback_commit_handler))
        .route("/api/v1/rollback/previous", post(rollback_previous_handler))
        .route(
            "/api/v1/rollback/candidates/{owner}/{repo}",
            get(rollback_candidates_handler),
        )
        // Run history
        .route("/api/v1/runs", get(list_runs_handler))
        .route("/api/v1/runs/{run_id}", get(get_run_handler))
        // Realtime
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    webhook::handle_webhook(&state, &headers, body).await
}

// ── Integration API ──

async fn link_integration_handler(
    State(state): State<AppState>,
    Json(req): Json<api::LinkRequest>,
) -> Result<(StatusCode, Json<crate::models::Integration>), AppError> {
    api::link_integration(&state, req)
        .await
        .map(|integration| (StatusCode::CREATED, Json(integration)))
}

// ── Pipeline API ──

async fn create_pipeline_handler(
    State(state): State<AppState>,
    Json(req): Json<api::RepoRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    api::create_pipeline(&state, req)
        .await
        .map(|body| (StatusCode::CREATED, Json(body)))
}

async fn execute_pipeline_handler(
    State(state): State<AppState>,
    Json(req): Json<api::RepoRequest>,
) -> Result<(StatusCode, Json<DeploymentRun>), AppError> {
    api::execute_pipeline(&state, req)
        .await
        .map(|run| (StatusCode::ACCEPTED, Json(run)))
}

async fn pipeline_status_handler(
    State(state): State<AppState>,
    Path(pipeline_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    api::pipeline_status(&state, &pipeline_id).await.map(Json)
}

// ── Rollback API ──

async fn rollback_commit_handler(
    State(state): State<AppState>,
    Json(req): Json<api::RollbackCommitRequest>,
) -> Result<(StatusCode, Json<DeploymentRun>), AppError> {
    api::rollback_to_commit(&state, req)
        .await
        .map(|run| (StatusCode::ACCEPTED, Json(run)))
}

async fn rollback_previous_handler(
    State(state): State<AppState>,
    Json(req): Json<api::RollbackPreviousRequest>,
) -> Result<(StatusCode, Json<DeploymentRun>), AppError> {
    api::rollback_to_previous(&state, req)
        .await
        .map(|run| (StatusCode::ACCEPTED, Json(run)))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatesQuery {
    pub user_id: String,
    pub limit: Option<i64>,
}

async fn rollback_candidates_handler(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<CandidatesQuery>,
) -> Result<Json<Vec<RollbackCandidate>>, AppError> {
    api::rollback_candidates(
        &state,
        &query.user_id,
        &owner,
        &repo,
        query.limit.unwrap_or(10),
    )
    .await
    .map(Json)
}

// ── Run history ──

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    pub user_id: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub limit: Option<i64>,
}

async fn list_runs_handler(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<DeploymentRun>>, AppError> {
    api::list_runs(
        &state,
        query.user_id.as_deref(),
        query.owner.as_deref(),
        query.repo.as_deref(),
        query.limit.unwrap_or(20),
    )
    .await
    .map(Json)
}

async fn get_run_handler(
    State(state): State<AppState>,
    Path(run_id): Path<i64>,
) -> Result<Json<DeploymentRun>, AppError> {
    api::get_run(&state, run_id).await.map(Json)
}

// ── Realtime ──

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_socket(socket, state))
}

async fn healthz() -> Json<Value> {
    Json(serde_json::json!({"status": "ok"}))
}
