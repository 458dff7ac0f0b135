//! Deploy stage: SourceDeploy project, stage and scenario management plus
//! deploy triggering. The deploy stage never builds implicitly: an image
//! that is not in the registry aborts before anything is triggered.

use reqwest::Method;
use serde_json::json;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::Integration;
use crate::services::ncp::{find_named_id, id_to_string, result_envelope, ProviderClient};
use crate::services::registry::RegistryVerifier;

const STAGE_NAME: &str = "production";
const SCENARIO_NAME: &str = "deploy-app";

pub fn deploy_project_name(owner: &str, repo: &str) -> String {
    format!("deploy-{owner}-{repo}").to_lowercase()
}

/// Fully resolved deploy target: project, stage and scenario ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub project_id: String,
    pub stage_id: String,
    pub scenario_id: String,
}

fn deploy_failed(reason: impl Into<String>) -> AppError {
    AppError::StageFailed {
        stage: crate::models::stage::DEPLOY,
        reason: reason.into(),
    }
}

pub struct DeployService {
    config: AppConfig,
    provider: ProviderClient,
    registry: RegistryVerifier,
}

impl DeployService {
    pub fn new(config: AppConfig, provider: ProviderClient, registry: RegistryVerifier) -> Self {
        Self {
            config,
            provider,
            registry,
        }
    }

    async fn resolve_named(&self, paths: &[String], name: &str) -> AppResult<Option<String>> {
        let body = self
            .provider
            .call(
                "sourcedeploy",
                &self.config.sourcedeploy_endpoint,
                Method::GET,
                paths,
                None,
            )
            .await?;
        Ok(find_named_id(&body, name))
    }

    async fn create_and_take_id(
        &self,
        paths: &[String],
        body: serde_json::Value,
    ) -> AppResult<Option<String>> {
        let response = self
            .provider
            .call(
                "sourcedeploy",
                &self.config.sourcedeploy_endpoint,
                Method::POST,
                paths,
                Some(&body),
            )
            .await?;
        Ok(result_envelope(&response).get("id").map(id_to_string))
    }

    /// Resolve or create the full deploy target for this integration:
    /// project, then a `production` stage bound to the cluster, then a
    /// `deploy-app` scenario whose manifests live in the mirror repository.
    pub async fn ensure_project(
        &self,
        integration: &Integration,
        mirror_repo: &str,
    ) -> AppResult<DeployTarget> {
        let cluster_id = &self.config.default_cluster_id;
        if cluster_id.is_empty() {
            return Err(AppError::ConfigMissing("cluster id"));
        }

        let name = deploy_project_name(&integration.owner, &integration.repo);
        let project_paths = ["/api/v1/project".to_string(), "/api/v1/projects".to_string()];

        let project_id = match &integration.deploy_project_id {
            Some(id) => id.clone(),
            None => match self.resolve_named(&project_paths, &name).await? {
                Some(id) => id,
                None => {
                    tracing::info!(project = %name, "creating deploy project");
                    let id = self
                        .create_and_take_id(&project_paths, json!({"name": name}))
                        .await?;
                    match id {
                        Some(id) => id,
                        // Concurrent creator won the name, pick up theirs.
                        None => self
                            .resolve_named(&project_paths, &name)
                            .await?
                            .ok_or_else(|| deploy_failed("deploy project create returned no id"))?,
                    }
                }
            },
        };

        let stage_paths = [format!("/api/v1/project/{project_id}/stage")];
        let stage_id = match self.resolve_named(&stage_paths, STAGE_NAME).await? {
            Some(id) => id,
            None => {
                let body = json!({
                    "name": STAGE_NAME,
                    "type": "KubernetesService",
                    "config": {"clusterNo": cluster_id}
                });
                match self.create_and_take_id(&stage_paths, body).await? {
                    Some(id) => id,
                    None => self
                        .resolve_named(&stage_paths, STAGE_NAME)
                        .await?
                        .ok_or_else(|| deploy_failed("stage create returned no id"))?,
                }
            }
        };

        let scenario_paths =
            [format!("/api/v1/project/{project_id}/stage/{stage_id}/scenario")];
        let scenario_id = match self.resolve_named(&scenario_paths, SCENARIO_NAME).await? {
            Some(id) => id,
            None => {
                let body = json!({
                    "name": SCENARIO_NAME,
                    "config": {
                        "strategy": "rolling",
                        "manifest": {
                            "type": "SourceCommit",
                            "repository": mirror_repo,
                            "branch": integration.branch,
                            "path": ["k8s/deployment.yaml", "k8s/service.yaml"]
                        }
                    }
                });
                match self.create_and_take_id(&scenario_paths, body).await? {
                    Some(id) => id,
                    None => self
                        .resolve_named(&scenario_paths, SCENARIO_NAME)
                        .await?
                        .ok_or_else(|| deploy_failed("scenario create returned no id"))?,
                }
            }
        };

        Ok(DeployTarget {
            project_id,
            stage_id,
            scenario_id,
        })
    }

    /// Gate on the registry, then trigger the rollout. Returns as soon as
    /// the provider accepts the deploy; completion is the poller's job.
    pub async fn run(
        &self,
        target: &DeployTarget,
        registry_url: &str,
        image_repository: &str,
        tag: &str,
    ) -> AppResult<()> {
        let exists = self
            .registry
            .verify_with_backoff(registry_url, image_repository, tag)
            .await?;
        if !exists {
            return Err(AppError::ImageNotFound {
                image: format!("{registry_url}/{image_repository}:{tag}"),
            });
        }

        self.provider
            .call(
                "sourcedeploy",
                &self.config.sourcedeploy_endpoint,
                Method::POST,
                &[format!(
                    "/api/v1/project/{}/stage/{}/scenario/{}/deploy",
                    target.project_id, target.stage_id, target.scenario_id
                )],
                Some(&json!({})),
            )
            .await?;
        tracing::info!(
            project_id = %target.project_id,
            scenario_id = %target.scenario_id,
            image = %format!("{registry_url}/{image_repository}:{tag}"),
            "deploy triggered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_naming_is_lowercase() {
        assert_eq!(deploy_project_name("Acme", "Web"), "deploy-acme-web");
    }
}
