//! Build stage: SourceBuild project management and build execution.

use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::Integration;
use crate::services::ncp::{
    find_named_id, id_to_string, newest_history_entry, result_envelope, ProviderClient,
};
use crate::services::poller::{map_history_status, PollStatus};
use crate::services::registry::RegistryVerifier;

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image_name: String,
    pub image_tag: String,
    pub image_url: String,
}

pub fn build_project_name(owner: &str, repo: &str) -> String {
    format!("build-{owner}-{repo}").to_lowercase()
}

/// Image the provider reports for a finished build, when the history entry
/// carries one. The deterministic registry/image/tag form is the fallback.
fn reported_image_url(entry: &Value) -> Option<String> {
    for key in ["imageUrl", "image", "registryImage"] {
        if let Some(url) = entry.get(key).and_then(|v| v.as_str()) {
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
    }
    None
}

fn build_failed(reason: impl Into<String>) -> AppError {
    AppError::StageFailed {
        stage: crate::models::stage::BUILD,
        reason: reason.into(),
    }
}

pub struct BuildService {
    config: AppConfig,
    provider: ProviderClient,
    registry: RegistryVerifier,
}

impl BuildService {
    pub fn new(config: AppConfig, provider: ProviderClient, registry: RegistryVerifier) -> Self {
        Self {
            config,
            provider,
            registry,
        }
    }

    async fn resolve_by_name(&self, name: &str) -> AppResult<Option<String>> {
        let body = self
            .provider
            .call(
                "sourcebuild",
                &self.config.sourcebuild_endpoint,
                Method::GET,
                &["/api/v1/project".to_string(), "/api/v1/projects".to_string()],
                None,
            )
            .await?;
        Ok(find_named_id(&body, name))
    }

    /// Resolve or create the build project for this integration, returning
    /// its provider-side id.
    ///
    /// Two runs can race here; the create call then fails on the duplicate
    /// name and the second resolve picks up whichever creation won.
    pub async fn ensure_project(
        &self,
        integration: &Integration,
        mirror_repo: &str,
        image_repository: &str,
    ) -> AppResult<String> {
        if let Some(id) = &integration.build_project_id {
            return Ok(id.clone());
        }

        let name = build_project_name(&integration.owner, &integration.repo);
        if let Some(id) = self.resolve_by_name(&name).await? {
            return Ok(id);
        }

        tracing::info!(project = %name, "creating build project");
        let registry_url = integration
            .registry_url
            .clone()
            .unwrap_or_else(|| self.config.registry_url.clone());
        let create_body = json!({
            "name": name,
            "description": format!("image build for {}", integration.full_name()),
            "source": {
                "type": "SourceCommit",
                "config": {
                    "repository": mirror_repo,
                    "branch": integration.branch,
                }
            },
            "env": {
                "compute": {"id": 1},
                "platform": {"type": "SingleImage", "config": {"os": {"id": 1}}},
                "docker": {"use": true}
            },
            "cmd": {
                "dockerbuild": {
                    "use": true,
                    "dockerfile": "Dockerfile",
                    "registry": registry_url,
                    "image": image_repository,
                    "tag": "latest",
                    "latest": true
                }
            }
        });
        let response = self
            .provider
            .call(
                "sourcebuild",
                &self.config.sourcebuild_endpoint,
                Method::POST,
                &["/api/v1/project".to_string(), "/api/v1/projects".to_string()],
                Some(&create_body),
            )
            .await;

        match response {
            Ok(body) => result_envelope(&body)
                .get("id")
                .map(id_to_string)
                .ok_or_else(|| build_failed("create returned no project id")),
            Err(create_err) => {
                // Duplicate-name conflict from a concurrent creator.
                match self.resolve_by_name(&name).await? {
                    Some(id) => Ok(id),
                    None => Err(create_err),
                }
            }
        }
    }

    /// Trigger a build of `commit_sha` and wait for it to finish, then
    /// confirm the image actually landed in the registry.
    pub async fn run(
        &self,
        integration: &Integration,
        project_id: &str,
        image_repository: &str,
        commit_sha: &str,
    ) -> AppResult<BuildOutcome> {
        let tag = commit_sha[..commit_sha.len().min(7)].to_string();
        let registry_url = integration
            .registry_url
            .clone()
            .unwrap_or_else(|| self.config.registry_url.clone());

        // Point the project's image tag at this commit before triggering.
        self.provider
            .call(
                "sourcebuild",
                &self.config.sourcebuild_endpoint,
                Method::PATCH,
                &[format!("/api/v1/project/{project_id}")],
                Some(&json!({
                    "cmd": {
                        "dockerbuild": {
                            "use": true,
                            "dockerfile": "Dockerfile",
                            "registry": registry_url,
                            "image": image_repository,
                            "tag": tag,
                            "latest": true
                        }
                    }
                })),
            )
            .await?;

        self.provider
            .call(
                "sourcebuild",
                &self.config.sourcebuild_endpoint,
                Method::POST,
                &[format!("/api/v1/project/{project_id}/build")],
                Some(&json!({})),
            )
            .await?;
        tracing::info!(project_id, tag = %tag, "build triggered");

        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
        let mut reported_image: Option<String> = None;
        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::StageTimeout {
                    stage: crate::models::stage::BUILD,
                });
            }

            let history = match self
                .provider
                .call(
                    "sourcebuild",
                    &self.config.sourcebuild_endpoint,
                    Method::GET,
                    &[format!("/api/v1/project/{project_id}/history?pageSize=1")],
                    None,
                )
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "build history poll errored, retrying");
                    continue;
                }
            };
            let Some(entry) = newest_history_entry(&history) else {
                continue;
            };
            let raw = entry.get("status").and_then(|s| s.as_str()).unwrap_or("");
            match map_history_status(raw) {
                PollStatus::Success => {
                    reported_image = reported_image_url(entry);
                    break;
                }
                PollStatus::Failed => {
                    return Err(build_failed(format!("provider reported status {raw}")));
                }
                PollStatus::Running | PollStatus::Unknown => continue,
            }
        }

        let image_url = reported_image
            .unwrap_or_else(|| format!("{registry_url}/{image_repository}:{tag}"));
        let visible = self
            .registry
            .verify_with_backoff(&registry_url, image_repository, &tag)
            .await?;
        if !visible {
            return Err(AppError::ImageNotFound {
                image: image_url.clone(),
            });
        }

        Ok(BuildOutcome {
            image_name: image_repository.to_string(),
            image_tag: tag,
            image_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_naming_is_lowercase() {
        assert_eq!(build_project_name("Acme", "Web"), "build-acme-web");
    }

    #[test]
    fn history_image_wins_over_deterministic_form() {
        let entry = json!({"status": "success", "imageUrl": "reg.example.com/app:abc1234"});
        assert_eq!(
            reported_image_url(&entry).as_deref(),
            Some("reg.example.com/app:abc1234")
        );
        assert!(reported_image_url(&json!({"status": "success"})).is_none());
        assert!(reported_image_url(&json!({"imageUrl": ""})).is_none());
    }
}
