//! Deploy status poller.
//!
//! Deploy triggers return before the rollout finishes, so a detached task
//! watches the provider's deploy history until the run reaches a terminal
//! state or the wait ceiling passes. Hitting the ceiling leaves the run
//! untouched: a stuck rollout is reported, never forced into a state.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;

use crate::db::DbPool;
use crate::hub::{app_key, Hub, HubMessage};
use crate::models::{stage, status};
use crate::services::ncp::{newest_history_entry, ProviderClient};
use crate::services::run_service;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Success,
    Failed,
    Running,
    Unknown,
}

/// Map a provider history status string onto our poll states. Provider
/// services are not consistent about wording, so several spellings collapse.
pub fn map_history_status(raw: &str) -> PollStatus {
    match raw.to_lowercase().as_str() {
        "success" | "succeeded" | "complete" | "completed" => PollStatus::Success,
        "failed" | "fail" | "error" | "cancelled" | "canceled" => PollStatus::Failed,
        "running" | "deploying" | "building" | "in_progress" | "pending" | "wait"
        | "waiting" | "ready" => PollStatus::Running,
        _ => PollStatus::Unknown,
    }
}

pub struct PollerParams {
    pub endpoint: String,
    pub deploy_project_id: String,
    pub run_id: i64,
    pub owner: String,
    pub repo: String,
    pub interval: Duration,
    pub max_wait: Duration,
}

/// Watch one deploy until terminal or timeout. Runs on its own task.
pub async fn poll_deploy_status(
    pool: DbPool,
    provider: ProviderClient,
    hub: Arc<Hub>,
    params: PollerParams,
) {
    let app = app_key(&params.owner, &params.repo);
    let started = tokio::time::Instant::now();
    let history_paths = [
        format!(
            "/api/v1/project/{}/history?pageSize=1",
            params.deploy_project_id
        ),
        format!("/api/v1/project/{}/history", params.deploy_project_id),
    ];

    loop {
        tokio::time::sleep(params.interval).await;
        if started.elapsed() >= params.max_wait {
            tracing::warn!(
                run_id = params.run_id,
                waited_secs = started.elapsed().as_secs(),
                "deploy poll timed out, leaving run as-is"
            );
            return;
        }

        let body = match provider
            .call(
                "sourcedeploy",
                &params.endpoint,
                Method::GET,
                &history_paths,
                None,
            )
            .await
        {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(run_id = params.run_id, error = %e, "deploy history poll errored, retrying");
                continue;
            }
        };
        let Some(entry) = newest_history_entry(&body) else {
            continue;
        };
        let raw = entry.get("status").and_then(|s| s.as_str()).unwrap_or("");

        match map_history_status(raw) {
            PollStatus::Success => {
                let elapsed = started.elapsed().as_secs() as i32;
                if let Err(e) = finish(&pool, params.run_id, Ok(elapsed)).await {
                    tracing::error!(run_id = params.run_id, error = %e, "failed to record deploy success");
                    return;
                }
                let image_url = image_url_of(&pool, params.run_id).await;
                hub.broadcast(
                    &app,
                    HubMessage::complete(&app, params.run_id, image_url.as_deref()),
                );
                return;
            }
            PollStatus::Failed => {
                let reason = format!("provider reported status {raw}");
                if let Err(e) = finish(&pool, params.run_id, Err(&reason)).await {
                    tracing::error!(run_id = params.run_id, error = %e, "failed to record deploy failure");
                    return;
                }
                hub.broadcast(
                    &app,
                    HubMessage::failed(&app, params.run_id, stage::DEPLOY, &reason),
                );
                return;
            }
            PollStatus::Running | PollStatus::Unknown => continue,
        }
    }
}

async fn finish(
    pool: &DbPool,
    run_id: i64,
    outcome: Result<i32, &str>,
) -> crate::error::AppResult<()> {
    let mut conn = pool.get().await?;
    match outcome {
        Ok(elapsed) => {
            run_service::set_stage_status(
                &mut conn,
                run_id,
                stage::DEPLOY,
                status::SUCCESS,
                Some(elapsed),
            )
            .await?;
            crate::metrics::record_stage_duration(stage::DEPLOY, elapsed as f64);
            run_service::finalize_success(&mut conn, run_id).await?;
        }
        Err(reason) => {
            run_service::set_stage_status(&mut conn, run_id, stage::DEPLOY, status::FAILED, None)
                .await?;
            run_service::finalize_failure(&mut conn, run_id, stage::DEPLOY, reason).await?;
        }
    }
    Ok(())
}

async fn image_url_of(pool: &DbPool, run_id: i64) -> Option<String> {
    let mut conn = pool.get().await.ok()?;
    run_service::get_run(&mut conn, run_id)
        .await
        .ok()
        .and_then(|r| r.image_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_spellings_collapse_to_poll_states() {
        assert_eq!(map_history_status("SUCCESS"), PollStatus::Success);
        assert_eq!(map_history_status("completed"), PollStatus::Success);
        assert_eq!(map_history_status("error"), PollStatus::Failed);
        assert_eq!(map_history_status("cancelled"), PollStatus::Failed);
        assert_eq!(map_history_status("deploying"), PollStatus::Running);
        assert_eq!(map_history_status("pending"), PollStatus::Running);
        assert_eq!(map_history_status("weird"), PollStatus::Unknown);
        assert_eq!(map_history_status(""), PollStatus::Unknown);
    }
}
