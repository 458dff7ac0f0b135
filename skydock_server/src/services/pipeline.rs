//! Managed pipeline (SourcePipeline) support.
//!
//! When an integration owns a provider pipeline that chains its build and
//! deploy projects, a single trigger call replaces our direct stage
//! driving. Trigger failures are not fatal: the orchestrator falls back to
//! the direct stages with a typed reason.

use reqwest::Method;
use serde_json::json;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::Integration;
use crate::services::ncp::{find_named_id, id_to_string, result_envelope, ProviderClient};

pub fn pipeline_name(owner: &str, repo: &str) -> String {
    format!("pipeline-{owner}-{repo}").to_lowercase()
}

/// Why the managed-pipeline fast path was not taken. Carried as data so the
/// orchestrator can log it and continue with the direct stages.
#[derive(Debug, Clone)]
pub enum FallbackReason {
    NotConfigured,
    TriggerFailed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::NotConfigured => write!(f, "no pipeline configured"),
            FallbackReason::TriggerFailed(e) => write!(f, "pipeline trigger failed: {e}"),
        }
    }
}

pub struct PipelineService {
    config: AppConfig,
    provider: ProviderClient,
}

impl PipelineService {
    pub fn new(config: AppConfig, provider: ProviderClient) -> Self {
        Self { config, provider }
    }

    /// Trigger the integration's pipeline. The error side is a reason to
    /// fall back, not a run failure.
    pub async fn trigger(&self, integration: &Integration) -> Result<(), FallbackReason> {
        let Some(pipeline_id) = &integration.pipeline_id else {
            return Err(FallbackReason::NotConfigured);
        };
        self.execute(pipeline_id)
            .await
            .map(|_| ())
            .map_err(|e| FallbackReason::TriggerFailed(e.to_string()))
    }

    /// Fire a pipeline by id. Returns the provider's execution handle when
    /// one is reported.
    pub async fn execute(&self, pipeline_id: &str) -> AppResult<Option<String>> {
        let body = self
            .provider
            .call(
                "sourcepipeline",
                &self.config.sourcepipeline_endpoint,
                Method::POST,
                &[
                    format!("/api/v1/project/{pipeline_id}/do"),
                    format!("/api/v1/pipelines/{pipeline_id}/trigger"),
                ],
                Some(&json!({})),
            )
            .await?;
        Ok(result_envelope(&body)
            .get("historyId")
            .or_else(|| result_envelope(&body).get("id"))
            .map(id_to_string))
    }

    /// Create a pipeline chaining the build project into the deploy
    /// scenario. Used opportunistically after a successful direct run and
    /// by the manual create endpoint.
    pub async fn create(
        &self,
        integration: &Integration,
        build_project_id: &str,
        deploy_project_id: &str,
        deploy_stage_id: &str,
        deploy_scenario_id: &str,
    ) -> AppResult<String> {
        let name = pipeline_name(&integration.owner, &integration.repo);
        let create_body = json!({
            "name": name,
            "description": format!("build and deploy for {}", integration.full_name()),
            "tasks": [
                {
                    "name": "build",
                    "type": "SourceBuild",
                    "config": {"projectId": build_project_id},
                    "linkedTasks": []
                },
                {
                    "name": "deploy",
                    "type": "SourceDeploy",
                    "config": {
                        "projectId": deploy_project_id,
                        "stageId": deploy_stage_id,
                        "scenarioId": deploy_scenario_id
                    },
                    "linkedTasks": ["build"]
                }
            ]
        });
        let paths = ["/api/v1/project".to_string(), "/api/v1/pipelines".to_string()];
        let response = self
            .provider
            .call(
                "sourcepipeline",
                &self.config.sourcepipeline_endpoint,
                Method::POST,
                &paths,
                Some(&create_body),
            )
            .await;

        match response {
            Ok(body) => result_envelope(&body)
                .get("id")
                .map(id_to_string)
                .ok_or(AppError::ExternalApi {
                    provider: "sourcepipeline",
                    status: 0,
                    body: "create returned no pipeline id".to_string(),
                }),
            Err(create_err) => {
                // Duplicate name from a concurrent creator.
                let listing = self
                    .provider
                    .call(
                        "sourcepipeline",
                        &self.config.sourcepipeline_endpoint,
                        Method::GET,
                        &paths,
                        None,
                    )
                    .await?;
                find_named_id(&listing, &name).ok_or(create_err)
            }
        }
    }

    /// Latest execution status of a pipeline, for the manual status
    /// endpoint. Returns the raw provider history entry.
    pub async fn status(&self, pipeline_id: &str) -> AppResult<serde_json::Value> {
        let body = self
            .provider
            .call(
                "sourcepipeline",
                &self.config.sourcepipeline_endpoint,
                Method::GET,
                &[
                    format!("/api/v1/project/{pipeline_id}/history"),
                    format!("/api/v1/pipelines/{pipeline_id}/history"),
                ],
                None,
            )
            .await?;
        Ok(result_envelope(&body).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_naming_is_lowercase() {
        assert_eq!(pipeline_name("Acme", "Web"), "pipeline-acme-web");
    }

    #[test]
    fn fallback_reasons_render_for_logs() {
        assert_eq!(FallbackReason::NotConfigured.to_string(), "no pipeline configured");
        assert!(FallbackReason::TriggerFailed("boom".into())
            .to_string()
            .contains("boom"));
    }
}
