//! Manual pipeline and rollback API.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::models::{DeploymentRun, Integration, NewIntegration};
use crate::routes::AppState;
use crate::services::integration_service;
use crate::services::rollback::RollbackCandidate;
use crate::services::run_service;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoRequest {
    pub user_id: String,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackCommitRequest {
    #[serde(flatten)]
    pub repo: RepoRequest,
    pub commit_sha: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPreviousRequest {
    #[serde(flatten)]
    pub repo: RepoRequest,
    #[serde(default = "default_steps_back")]
    pub steps_back: usize,
}

fn default_steps_back() -> usize {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    pub user_id: String,
    pub owner: String,
    pub repo: String,
    pub installation_id: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Link a repository so its webhooks start deploying.
pub async fn link_integration(state: &AppState, req: LinkRequest) -> AppResult<Integration> {
    let mut conn = state.orchestrator.pool.get().await?;
    let integration = integration_service::upsert(
        &mut conn,
        NewIntegration {
            user_id: req.user_id,
            owner: req.owner,
            repo: req.repo,
            installation_id: req.installation_id,
            branch: req.branch,
        },
    )
    .await?;
    Ok(integration)
}

async fn require_integration(state: &AppState, req: &RepoRequest) -> AppResult<Integration> {
    let mut conn = state.orchestrator.pool.get().await?;
    integration_service::find_by_user_repo(&mut conn, &req.user_id, &req.owner, &req.repo)
        .await?
        .ok_or_else(|| AppError::IntegrationNotFound {
            owner: req.owner.clone(),
            repo: req.repo.clone(),
        })
}

pub async fn create_pipeline(state: &AppState, req: RepoRequest) -> AppResult<Value> {
    let integration = require_integration(state, &req).await?;
    let pipeline_id = state.orchestrator.create_pipeline(&integration).await?;
    Ok(json!({"pipelineId": pipeline_id}))
}

/// Deploy whatever is at the head of the integration's branch right now.
/// Takes the managed-pipeline fast path when one exists.
pub async fn execute_pipeline(state: &AppState, req: RepoRequest) -> AppResult<DeploymentRun> {
    let integration = require_integration(state, &req).await?;
    state
        .orchestrator
        .clone()
        .trigger_manual_run(integration)
        .await
}

pub async fn pipeline_status(state: &AppState, pipeline_id: &str) -> AppResult<Value> {
    state.orchestrator.pipeline.status(pipeline_id).await
}

pub async fn rollback_to_commit(
    state: &AppState,
    req: RollbackCommitRequest,
) -> AppResult<DeploymentRun> {
    let integration = require_integration(state, &req.repo).await?;
    state
        .rollback
        .rollback_to_commit(&integration, &req.commit_sha)
        .await
}

pub async fn rollback_to_previous(
    state: &AppState,
    req: RollbackPreviousRequest,
) -> AppResult<DeploymentRun> {
    let integration = require_integration(state, &req.repo).await?;
    state
        .rollback
        .rollback_to_previous(&integration, req.steps_back)
        .await
}

pub async fn rollback_candidates(
    state: &AppState,
    user_id: &str,
    owner: &str,
    repo: &str,
    limit: i64,
) -> AppResult<Vec<RollbackCandidate>> {
    let req = RepoRequest {
        user_id: user_id.to_string(),
        owner: owner.to_string(),
        repo: repo.to_string(),
    };
    let integration = require_integration(state, &req).await?;
    state.rollback.candidates(&integration, limit).await
}

pub async fn list_runs(
    state: &AppState,
    user_id: Option<&str>,
    owner: Option<&str>,
    repo: Option<&str>,
    limit: i64,
) -> AppResult<Vec<DeploymentRun>> {
    let mut conn = state.orchestrator.pool.get().await?;
    match (owner, repo, user_id) {
        (Some(owner), Some(repo), _) => run_service::list_runs(&mut conn, owner, repo, limit).await,
        (_, _, Some(user_id)) => run_service::list_runs_for_user(&mut conn, user_id, limit).await,
        _ => Err(AppError::InvalidPayload(
            "owner and repo, or userId, required",
        )),
    }
}

pub async fn get_run(state: &AppState, run_id: i64) -> AppResult<DeploymentRun> {
    let mut conn = state.orchestrator.pool.get().await?;
    run_service::get_run(&mut conn, run_id).await
}
