//! Pipeline orchestrator: webhook events in, deployment runs out.
//!
//! The webhook handler answers immediately; the actual pipeline executes on
//! a detached task with its own pooled connection. Stage failures are
//! written into the run and broadcast, they never escape the task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::hub::{app_key, Hub, HubMessage};
use crate::models::{stage, status, DeploymentRun, Integration, NewDeploymentRun};
use crate::services::build::BuildService;
use crate::services::deploy::DeployService;
use crate::services::github::{self, EventDecision};
use crate::services::integration_service::{self, ProviderField};
use crate::services::mirror::{app_name, MirrorService};
use crate::services::ncp::ProviderClient;
use crate::services::pipeline::PipelineService;
use crate::services::poller::{self, PollerParams};
use crate::services::registry::RegistryVerifier;
use crate::services::run_service;

/// What the webhook endpoint should answer.
#[derive(Debug)]
pub enum WebhookOutcome {
    Accepted {
        run_id: i64,
        repository: String,
        installation_id: Option<String>,
        event: String,
    },
    Ignored(&'static str),
    Skipped(&'static str),
}

pub struct Orchestrator {
    pub config: AppConfig,
    pub pool: DbPool,
    pub hub: Arc<Hub>,
    pub provider: ProviderClient,
    mirror: MirrorService,
    build: BuildService,
    deploy: DeployService,
    pub pipeline: PipelineService,
}

impl Orchestrator {
    pub fn new(config: AppConfig, pool: DbPool, hub: Arc<Hub>) -> Self {
        let provider = ProviderClient::new(
            config.ncp_access_key.clone(),
            config.ncp_secret_key.clone(),
            config.ncp_region.clone(),
        );
        let registry = RegistryVerifier::new(
            config.registry_access_key.clone(),
            config.registry_secret_key.clone(),
        );
        Self {
            mirror: MirrorService::new(config.clone(), provider.clone()),
            build: BuildService::new(config.clone(), provider.clone(), registry.clone()),
            deploy: DeployService::new(config.clone(), provider.clone(), registry),
            pipeline: PipelineService::new(config.clone(), provider.clone()),
            config,
            pool,
            hub,
            provider,
        }
    }

    pub fn deploy_service(&self) -> DeployService {
        let registry = RegistryVerifier::new(
            self.config.registry_access_key.clone(),
            self.config.registry_secret_key.clone(),
        );
        DeployService::new(self.config.clone(), self.provider.clone(), registry)
    }

    /// Classify a verified webhook event and, when it is deployable, start
    /// a run on a detached task.
    pub async fn handle_event(
        self: Arc<Self>,
        event_type: &str,
        owner: &str,
        repo: &str,
        installation_id: Option<String>,
        payload: &Value,
    ) -> AppResult<WebhookOutcome> {
        crate::metrics::record_webhook_received(event_type);
        let mut conn = self.pool.get().await?;

        let Some(integration) = integration_service::find_by_repo(
            &mut conn,
            owner,
            repo,
            installation_id.as_deref(),
        )
        .await?
        else {
            tracing::info!(repo = %format!("{owner}/{repo}"), "webhook for unlinked repository");
            return Ok(WebhookOutcome::Skipped("repository not linked"));
        };
        if !integration.auto_deploy_enabled {
            return Ok(WebhookOutcome::Skipped("auto deploy disabled"));
        }

        let (trigger_kind, commit) =
            match github::classify_event(event_type, payload, &integration.branch) {
                EventDecision::Deploy {
                    trigger_kind,
                    commit,
                } => (trigger_kind, commit),
                EventDecision::Ignored(reason) => return Ok(WebhookOutcome::Ignored(reason)),
            };

        let run = match run_service::create_run(
            &mut conn,
            NewDeploymentRun {
                user_id: integration.user_id.clone(),
                owner: integration.owner.clone(),
                repo: integration.repo.clone(),
                commit_sha: commit.sha.clone(),
                commit_message: commit.message.clone(),
                commit_author: commit.author.clone(),
                commit_url: commit.url.clone(),
                trigger_kind: trigger_kind.to_string(),
                pipeline_mode: false,
                status: status::RUNNING.to_string(),
                mirror_status: status::PENDING.to_string(),
                build_status: status::PENDING.to_string(),
                deploy_status: status::PENDING.to_string(),
                cluster_id: Some(self.config.default_cluster_id.clone()),
                namespace: self.config.default_namespace.clone(),
                is_rollback: false,
                rolled_back_from_id: None,
            },
        )
        .await
        {
            Ok(run) => run,
            Err(AppError::DuplicateRun) => {
                tracing::info!(
                    repo = %integration.full_name(),
                    commit = &commit.sha[..commit.sha.len().min(7)],
                    "duplicate webhook delivery, skipping"
                );
                return Ok(WebhookOutcome::Skipped("duplicate delivery"));
            }
            Err(e) => return Err(e),
        };

        let this = Arc::clone(&self);
        let run_id = run.id;
        tokio::spawn(async move {
            this.run_pipeline(integration, run).await;
        });

        Ok(WebhookOutcome::Accepted {
            run_id,
            repository: format!("{owner}/{repo}"),
            installation_id,
            event: event_type.to_string(),
        })
    }

    /// Start a run for the current head of the integration's branch.
    /// Backs the manual execute endpoint; the pipeline itself runs
    /// detached, like a webhook-triggered one.
    pub async fn trigger_manual_run(
        self: Arc<Self>,
        integration: Integration,
    ) -> AppResult<DeploymentRun> {
        let head_sha = self.mirror.resolve_branch_head(&integration).await?;
        let mut conn = self.pool.get().await?;
        let run = run_service::create_run(
            &mut conn,
            NewDeploymentRun {
                user_id: integration.user_id.clone(),
                owner: integration.owner.clone(),
                repo: integration.repo.clone(),
                commit_sha: head_sha,
                commit_message: None,
                commit_author: None,
                commit_url: None,
                trigger_kind: crate::models::trigger::MANUAL.to_string(),
                pipeline_mode: false,
                status: status::RUNNING.to_string(),
                mirror_status: status::PENDING.to_string(),
                build_status: status::PENDING.to_string(),
                deploy_status: status::PENDING.to_string(),
                cluster_id: Some(self.config.default_cluster_id.clone()),
                namespace: self.config.default_namespace.clone(),
                is_rollback: false,
                rolled_back_from_id: None,
            },
        )
        .await?;

        let this = Arc::clone(&self);
        let spawned_run = run.clone();
        tokio::spawn(async move {
            this.run_pipeline(integration, spawned_run).await;
        });
        Ok(run)
    }

    /// Drive one run through mirror, then either the managed pipeline or
    /// the direct build and deploy stages.
    async fn run_pipeline(self: Arc<Self>, integration: Integration, run: DeploymentRun) {
        let app = app_key(&integration.owner, &integration.repo);
        if let Err(e) = self.clone().run_pipeline_inner(&integration, &run, &app).await {
            let failed_stage = e.stage().unwrap_or(stage::MIRROR);
            tracing::error!(
                run_id = run.id,
                repo = %integration.full_name(),
                stage = failed_stage,
                error = %e,
                "pipeline run failed"
            );
            if let Ok(mut conn) = self.pool.get().await {
                let _ = run_service::set_stage_status(
                    &mut conn,
                    run.id,
                    failed_stage,
                    status::FAILED,
                    None,
                )
                .await;
                let _ =
                    run_service::finalize_failure(&mut conn, run.id, failed_stage, &e.to_string())
                        .await;
            }
            self.hub.broadcast(
                &app,
                HubMessage::failed(&app, run.id, failed_stage, &e.to_string()),
            );
        }
    }

    async fn run_pipeline_inner(
        self: Arc<Self>,
        integration: &Integration,
        run: &DeploymentRun,
        app: &str,
    ) -> AppResult<()> {
        let mut conn = self.pool.get().await?;
        let mut integration = integration.clone();

        let image_repository = match &integration.image_repository {
            Some(name) => name.clone(),
            None => {
                let name = app_name(&integration.repo);
                integration = integration_service::persist_provider_field(
                    &mut conn,
                    integration.id,
                    ProviderField::ImageRepository,
                    &name,
                )
                .await?;
                name
            }
        };
        let registry_url = integration
            .registry_url
            .clone()
            .unwrap_or_else(|| self.config.registry_url.clone());
        let image_url = format!(
            "{registry_url}/{image_repository}:{}",
            run.short_sha()
        );

        // Mirror
        run_service::set_stage_status(&mut conn, run.id, stage::MIRROR, status::RUNNING, None)
            .await?;
        self.hub.broadcast(
            app,
            HubMessage::progress(app, run.id, stage::MIRROR, status::RUNNING),
        );
        let stage_start = Instant::now();
        let mirror_repo = self
            .mirror
            .mirror(&integration, &run.commit_sha, &image_url)
            .await
            .map_err(|e| e.in_stage(stage::MIRROR))?;
        let mirror_secs = stage_start.elapsed().as_secs() as i32;
        run_service::set_stage_status(
            &mut conn,
            run.id,
            stage::MIRROR,
            status::SUCCESS,
            Some(mirror_secs),
        )
        .await?;
        crate::metrics::record_stage_duration(stage::MIRROR, mirror_secs as f64);
        self.hub.broadcast(
            app,
            HubMessage::progress(app, run.id, stage::MIRROR, status::SUCCESS),
        );
        if integration.mirror_repo.as_deref() != Some(mirror_repo.as_str()) {
            integration = integration_service::persist_provider_field(
                &mut conn,
                integration.id,
                ProviderField::MirrorRepo,
                &mirror_repo,
            )
            .await?;
        }

        // Managed pipeline fast path. A trigger failure is a reason to fall
        // back, not a run failure.
        match self.pipeline.trigger(&integration).await {
            Ok(()) => {
                tracing::info!(run_id = run.id, "managed pipeline triggered");
                run_service::set_pipeline_mode(&mut conn, run.id).await?;
                run_service::set_image(
                    &mut conn,
                    run.id,
                    &image_repository,
                    run.short_sha(),
                    &image_url,
                )
                .await?;
                if let Some(deploy_project_id) = integration.deploy_project_id.clone() {
                    self.spawn_poller(&integration, run.id, deploy_project_id);
                }
                return Ok(());
            }
            Err(reason) => {
                tracing::info!(run_id = run.id, reason = %reason, "continuing with direct stages");
            }
        }

        // Build
        run_service::set_stage_status(&mut conn, run.id, stage::BUILD, status::RUNNING, None)
            .await?;
        self.hub.broadcast(
            app,
            HubMessage::progress(app, run.id, stage::BUILD, status::RUNNING),
        );
        let build_project_id = self
            .build
            .ensure_project(&integration, &mirror_repo, &image_repository)
            .await
            .map_err(|e| e.in_stage(stage::BUILD))?;
        if integration.build_project_id.as_deref() != Some(build_project_id.as_str()) {
            integration = integration_service::persist_provider_field(
                &mut conn,
                integration.id,
                ProviderField::BuildProjectId,
                &build_project_id,
            )
            .await?;
        }
        let stage_start = Instant::now();
        let outcome = self
            .build
            .run(
                &integration,
                &build_project_id,
                &image_repository,
                &run.commit_sha,
            )
            .await
            .map_err(|e| e.in_stage(stage::BUILD))?;
        let build_secs = stage_start.elapsed().as_secs() as i32;
        run_service::set_image(
            &mut conn,
            run.id,
            &outcome.image_name,
            &outcome.image_tag,
            &outcome.image_url,
        )
        .await?;
        run_service::set_stage_status(
            &mut conn,
            run.id,
            stage::BUILD,
            status::SUCCESS,
            Some(build_secs),
        )
        .await?;
        crate::metrics::record_stage_duration(stage::BUILD, build_secs as f64);
        self.hub.broadcast(
            app,
            HubMessage::progress(app, run.id, stage::BUILD, status::SUCCESS),
        );

        // Deploy
        let deploy_target = self
            .deploy
            .ensure_project(&integration, &mirror_repo)
            .await
            .map_err(|e| e.in_stage(stage::DEPLOY))?;
        if integration.deploy_project_id.as_deref() != Some(deploy_target.project_id.as_str()) {
            integration = integration_service::persist_provider_field(
                &mut conn,
                integration.id,
                ProviderField::DeployProjectId,
                &deploy_target.project_id,
            )
            .await?;
        }
        run_service::set_stage_status(&mut conn, run.id, stage::DEPLOY, status::RUNNING, None)
            .await?;
        self.hub.broadcast(
            app,
            HubMessage::progress(app, run.id, stage::DEPLOY, status::RUNNING),
        );
        self.deploy
            .run(
                &deploy_target,
                &registry_url,
                &outcome.image_name,
                &outcome.image_tag,
            )
            .await
            .map_err(|e| e.in_stage(stage::DEPLOY))?;
        self.spawn_poller(&integration, run.id, deploy_target.project_id.clone());

        // With both projects in place a managed pipeline can take over the
        // next run. Failure here is logged, never surfaced.
        if integration.pipeline_id.is_none() {
            match self
                .pipeline
                .create(
                    &integration,
                    &build_project_id,
                    &deploy_target.project_id,
                    &deploy_target.stage_id,
                    &deploy_target.scenario_id,
                )
                .await
            {
                Ok(pipeline_id) => {
                    integration_service::persist_provider_field(
                        &mut conn,
                        integration.id,
                        ProviderField::PipelineId,
                        &pipeline_id,
                    )
                    .await?;
                    tracing::info!(
                        repo = %integration.full_name(),
                        pipeline_id = %pipeline_id,
                        "managed pipeline created for future runs"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "opportunistic pipeline creation failed");
                }
            }
        }

        Ok(())
    }

    fn spawn_poller(&self, integration: &Integration, run_id: i64, deploy_project_id: String) {
        tokio::spawn(poller::poll_deploy_status(
            self.pool.clone(),
            self.provider.clone(),
            self.hub.clone(),
            PollerParams {
                endpoint: self.config.sourcedeploy_endpoint.clone(),
                deploy_project_id,
                run_id,
                owner: integration.owner.clone(),
                repo: integration.repo.clone(),
                interval: Duration::from_secs(self.config.poll_interval_secs.max(1)),
                max_wait: Duration::from_secs(self.config.poll_timeout_secs),
            },
        ));
    }

    /// Set up all provider resources for an integration and chain them into
    /// a managed pipeline. Backs the manual create endpoint.
    pub async fn create_pipeline(&self, integration: &Integration) -> AppResult<String> {
        let mut conn = self.pool.get().await?;
        let mut integration = integration.clone();

        if let Some(existing) = &integration.pipeline_id {
            return Ok(existing.clone());
        }

        let mirror_repo = self.mirror.ensure_repository(&integration).await?;
        if integration.mirror_repo.as_deref() != Some(mirror_repo.as_str()) {
            integration = integration_service::persist_provider_field(
                &mut conn,
                integration.id,
                ProviderField::MirrorRepo,
                &mirror_repo,
            )
            .await?;
        }
        let image_repository = integration
            .image_repository
            .clone()
            .unwrap_or_else(|| app_name(&integration.repo));

        let build_project_id = self
            .build
            .ensure_project(&integration, &mirror_repo, &image_repository)
            .await?;
        let deploy_target = self.deploy.ensure_project(&integration, &mirror_repo).await?;
        let pipeline_id = self
            .pipeline
            .create(
                &integration,
                &build_project_id,
                &deploy_target.project_id,
                &deploy_target.stage_id,
                &deploy_target.scenario_id,
            )
            .await?;

        integration_service::persist_provider_field(
            &mut conn,
            integration.id,
            ProviderField::BuildProjectId,
            &build_project_id,
        )
        .await?;
        integration_service::persist_provider_field(
            &mut conn,
            integration.id,
            ProviderField::DeployProjectId,
            &deploy_target.project_id,
        )
        .await?;
        integration_service::persist_provider_field(
            &mut conn,
            integration.id,
            ProviderField::PipelineId,
            &pipeline_id,
        )
        .await?;
        Ok(pipeline_id)
    }
}
