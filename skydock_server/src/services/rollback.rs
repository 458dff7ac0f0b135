//! Rollback engine.
//!
//! A rollback reuses the image a previous successful run produced and goes
//! straight to the deploy stage: no mirror, no build. The timeline it walks
//! contains only original (non-rollback) successful runs, so rolling back
//! twice does not shift the history underneath the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::hub::{app_key, Hub, HubMessage};
use crate::models::{stage, status, trigger, DeploymentRun, Integration, NewDeploymentRun};
use crate::services::deploy::DeployService;
use crate::services::poller::{self, PollerParams};
use crate::services::run_service;

const MAX_ROLLBACK_AGE_DAYS: i64 = 30;

/// Index of the currently live deployment within the timeline, matched by
/// short commit sha. Unknown (freshly wiped cluster, live run not in the
/// original timeline) falls back to the newest entry.
pub fn current_index(timeline_shas: &[&str], live_short_sha: Option<&str>) -> usize {
    live_short_sha
        .and_then(|live| timeline_shas.iter().position(|sha| *sha == live))
        .unwrap_or(0)
}

/// Resolve `steps_back` against the timeline. `available` counts how far
/// back from the current deployment the caller could actually go.
pub fn target_index(
    timeline_len: usize,
    current: usize,
    steps_back: usize,
) -> Result<usize, AppError> {
    let available = timeline_len.saturating_sub(current + 1);
    if steps_back == 0 || steps_back > available {
        return Err(AppError::RollbackRangeExceeded {
            available,
            requested: steps_back,
        });
    }
    Ok(current + steps_back)
}

pub fn is_too_old(deployed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - deployed_at > chrono::Duration::days(MAX_ROLLBACK_AGE_DAYS)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackCandidate {
    pub run_id: i64,
    pub commit_sha: String,
    pub short_sha: String,
    pub commit_message: Option<String>,
    pub image_url: Option<String>,
    pub deployed_at: DateTime<Utc>,
    pub steps_back: i64,
    pub is_current: bool,
}

pub struct RollbackService {
    config: AppConfig,
    pool: DbPool,
    deploy: DeployService,
    hub: Arc<Hub>,
    provider: crate::services::ncp::ProviderClient,
}

impl RollbackService {
    pub fn new(
        config: AppConfig,
        pool: DbPool,
        deploy: DeployService,
        hub: Arc<Hub>,
        provider: crate::services::ncp::ProviderClient,
    ) -> Self {
        Self {
            config,
            pool,
            deploy,
            hub,
            provider,
        }
    }

    /// Roll back `steps_back` deployments from the one currently live.
    pub async fn rollback_to_previous(
        &self,
        integration: &Integration,
        steps_back: usize,
    ) -> AppResult<DeploymentRun> {
        let mut conn = self.pool.get().await?;
        let timeline = run_service::successful_original_runs(
            &mut conn,
            &integration.owner,
            &integration.repo,
            steps_back as i64 + 5,
        )
        .await?;
        if timeline.is_empty() {
            return Err(AppError::RollbackTargetNotFound {
                owner: integration.owner.clone(),
                repo: integration.repo.clone(),
                query: "any previous deployment".to_string(),
            });
        }

        let live =
            run_service::latest_successful_run(&mut conn, &integration.owner, &integration.repo)
                .await?;
        let shas: Vec<&str> = timeline.iter().map(|r| r.short_sha()).collect();
        let current = current_index(&shas, live.as_ref().map(|r| r.short_sha()));
        let idx = target_index(timeline.len(), current, steps_back)?;
        let target = &timeline[idx];

        if is_too_old(target.started_at, Utc::now()) {
            return Err(AppError::RollbackTooOld {
                limit_days: MAX_ROLLBACK_AGE_DAYS,
            });
        }

        crate::metrics::record_rollback("previous");
        self.execute(integration, target, live.map(|r| r.id)).await
    }

    /// Roll back to the newest successful deployment of a specific commit.
    /// `sha` may be a prefix.
    pub async fn rollback_to_commit(
        &self,
        integration: &Integration,
        sha: &str,
    ) -> AppResult<DeploymentRun> {
        let mut conn = self.pool.get().await?;
        let timeline = run_service::successful_original_runs(
            &mut conn,
            &integration.owner,
            &integration.repo,
            200,
        )
        .await?;
        let target = timeline
            .iter()
            .find(|r| r.commit_sha == sha || r.commit_sha.starts_with(sha))
            .ok_or_else(|| AppError::RollbackTargetNotFound {
                owner: integration.owner.clone(),
                repo: integration.repo.clone(),
                query: sha.to_string(),
            })?;
        let live =
            run_service::latest_successful_run(&mut conn, &integration.owner, &integration.repo)
                .await?;

        crate::metrics::record_rollback("commit");
        self.execute(integration, target, live.map(|r| r.id)).await
    }

    /// Rollback targets, newest first, annotated with how many steps back
    /// each one is from the live deployment.
    pub async fn candidates(
        &self,
        integration: &Integration,
        limit: i64,
    ) -> AppResult<Vec<RollbackCandidate>> {
        let mut conn = self.pool.get().await?;
        let timeline = run_service::successful_original_runs(
            &mut conn,
            &integration.owner,
            &integration.repo,
            limit,
        )
        .await?;
        let live =
            run_service::latest_successful_run(&mut conn, &integration.owner, &integration.repo)
                .await?;
        let shas: Vec<&str> = timeline.iter().map(|r| r.short_sha()).collect();
        let current = current_index(&shas, live.as_ref().map(|r| r.short_sha()));

        Ok(timeline
            .iter()
            .enumerate()
            .map(|(i, run)| RollbackCandidate {
                run_id: run.id,
                commit_sha: run.commit_sha.clone(),
                short_sha: run.short_sha().to_string(),
                commit_message: run.commit_message.clone(),
                image_url: run.image_url.clone(),
                deployed_at: run.started_at,
                steps_back: i as i64 - current as i64,
                is_current: i == current,
            })
            .collect())
    }

    /// Deploy the target run's image again as a new rollback run.
    async fn execute(
        &self,
        integration: &Integration,
        target: &DeploymentRun,
        live_run_id: Option<i64>,
    ) -> AppResult<DeploymentRun> {
        let (image_name, image_tag) = match (&target.image_name, &target.image_tag) {
            (Some(name), Some(tag)) => (name.clone(), tag.clone()),
            _ => {
                return Err(AppError::StageFailed {
                    stage: stage::DEPLOY,
                    reason: format!("run {} recorded no image to roll back to", target.id),
                })
            }
        };
        let registry_url = integration
            .registry_url
            .clone()
            .unwrap_or_else(|| self.config.registry_url.clone());
        let mirror_repo = integration.mirror_repo.clone().ok_or_else(|| {
            AppError::IntegrationIncomplete {
                owner: integration.owner.clone(),
                repo: integration.repo.clone(),
                field: "mirror_repo",
            }
        })?;

        let mut conn = self.pool.get().await?;
        let run = run_service::create_run(
            &mut conn,
            NewDeploymentRun {
                user_id: integration.user_id.clone(),
                owner: integration.owner.clone(),
                repo: integration.repo.clone(),
                commit_sha: target.commit_sha.clone(),
                commit_message: target.commit_message.clone(),
                commit_author: target.commit_author.clone(),
                commit_url: target.commit_url.clone(),
                trigger_kind: trigger::ROLLBACK.to_string(),
                pipeline_mode: false,
                status: status::RUNNING.to_string(),
                // The image already exists, mirror and build never run.
                mirror_status: status::SKIPPED.to_string(),
                build_status: status::SKIPPED.to_string(),
                deploy_status: status::PENDING.to_string(),
                cluster_id: Some(self.config.default_cluster_id.clone()),
                namespace: self.config.default_namespace.clone(),
                is_rollback: true,
                rolled_back_from_id: live_run_id,
            },
        )
        .await?;

        run_service::set_image(
            &mut conn,
            run.id,
            &image_name,
            &image_tag,
            &format!("{registry_url}/{image_name}:{image_tag}"),
        )
        .await?;

        let app = app_key(&integration.owner, &integration.repo);
        let outcome = async {
            let deploy_target = self.deploy.ensure_project(integration, &mirror_repo).await?;
            run_service::set_stage_status(&mut conn, run.id, stage::DEPLOY, status::RUNNING, None)
                .await?;
            self.hub.broadcast(
                &app,
                HubMessage::progress(&app, run.id, stage::DEPLOY, status::RUNNING),
            );
            self.deploy
                .run(&deploy_target, &registry_url, &image_name, &image_tag)
                .await?;
            Ok::<_, AppError>(deploy_target)
        }
        .await;

        let deploy_target = match outcome {
            Ok(t) => t,
            Err(e) => {
                let stage_name = e.stage().unwrap_or(stage::DEPLOY);
                run_service::set_stage_status(
                    &mut conn,
                    run.id,
                    stage::DEPLOY,
                    status::FAILED,
                    None,
                )
                .await?;
                run_service::finalize_failure(&mut conn, run.id, stage_name, &e.to_string())
                    .await?;
                self.hub.broadcast(
                    &app,
                    HubMessage::failed(&app, run.id, stage_name, &e.to_string()),
                );
                return Err(e);
            }
        };

        tokio::spawn(poller::poll_deploy_status(
            self.pool.clone(),
            self.provider.clone(),
            self.hub.clone(),
            PollerParams {
                endpoint: self.config.sourcedeploy_endpoint.clone(),
                deploy_project_id: deploy_target.project_id,
                run_id: run.id,
                owner: integration.owner.clone(),
                repo: integration.repo.clone(),
                interval: Duration::from_secs(self.config.poll_interval_secs.max(1)),
                max_wait: Duration::from_secs(self.config.poll_timeout_secs),
            },
        ));

        run_service::get_run(&mut conn, run.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_defaults_to_newest_when_live_is_unknown() {
        let shas = ["ccc3333", "bbb2222", "aaa1111"];
        assert_eq!(current_index(&shas, None), 0);
        assert_eq!(current_index(&shas, Some("zzz9999")), 0);
        assert_eq!(current_index(&shas, Some("bbb2222")), 1);
    }

    #[test]
    fn one_step_back_from_newest_selects_second_entry() {
        assert_eq!(target_index(3, 0, 1).unwrap(), 1);
        assert_eq!(target_index(5, 1, 2).unwrap(), 3);
    }

    #[test]
    fn range_error_reports_available_and_requested() {
        // three deployments, live at the newest: only two steps available
        match target_index(3, 0, 5) {
            Err(AppError::RollbackRangeExceeded { available, requested }) => {
                assert_eq!(available, 2);
                assert_eq!(requested, 5);
            }
            other => panic!("expected range error, got {other:?}"),
        }
    }

    #[test]
    fn zero_steps_is_out_of_range() {
        assert!(matches!(
            target_index(3, 0, 0),
            Err(AppError::RollbackRangeExceeded { .. })
        ));
    }

    #[test]
    fn current_at_oldest_entry_has_nothing_to_roll_back_to() {
        match target_index(3, 2, 1) {
            Err(AppError::RollbackRangeExceeded { available, .. }) => assert_eq!(available, 0),
            other => panic!("expected range error, got {other:?}"),
        }
    }

    #[test]
    fn age_ceiling_is_thirty_days() {
        let now = Utc::now();
        assert!(!is_too_old(now - chrono::Duration::days(29), now));
        assert!(is_too_old(now - chrono::Duration::days(31), now));
    }
}
