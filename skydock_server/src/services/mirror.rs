//! Mirror stage: copy the GitHub repository into the provider's
//! source-control service and make sure the Kubernetes manifests the deploy
//! scenario references are present on the target branch.

use std::path::{Path, PathBuf};

use reqwest::Method;
use serde_json::json;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::Integration;
use crate::services::{github, ncp::ProviderClient};

const SOURCECOMMIT_GIT_HOST: &str = "devtools.ncloud.com";

/// Kubernetes name for the workload: lowercase, dashes, trimmed.
pub fn app_name(repo: &str) -> String {
    let cleaned: String = repo
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    cleaned.trim_matches('-').to_string()
}

/// Deployment manifest for the app, pulling through the `ncp-cr` secret.
pub fn generate_deployment_manifest(app: &str, image_url: &str) -> String {
    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": app,
            "labels": {"app": app}
        },
        "spec": {
            "replicas": 1,
            "selector": {"matchLabels": {"app": app}},
            "template": {
                "metadata": {"labels": {"app": app}},
                "spec": {
                    "imagePullSecrets": [{"name": "ncp-cr"}],
                    "containers": [{
                        "name": app,
                        "image": image_url,
                        "ports": [{"containerPort": 8080}]
                    }]
                }
            }
        }
    });
    serde_yaml::to_string(&manifest).unwrap_or_default()
}

/// ClusterIP service fronting the deployment, port 80 into 8080.
pub fn generate_service_manifest(app: &str) -> String {
    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": app},
        "spec": {
            "type": "ClusterIP",
            "selector": {"app": app},
            "ports": [{"port": 80, "targetPort": 8080}]
        }
    });
    serde_yaml::to_string(&manifest).unwrap_or_default()
}

fn mirror_failed(reason: impl Into<String>) -> AppError {
    AppError::StageFailed {
        stage: crate::models::stage::MIRROR,
        reason: reason.into(),
    }
}

/// Run one git command, scrubbing credentials from anything that could end
/// up in a log line or error message.
async fn run_git(cwd: Option<&Path>, args: &[&str], secrets: &[&str]) -> AppResult<String> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .await
        .map_err(|e| mirror_failed(format!("failed to spawn git: {e}")))?;
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        let mut scrubbed = stderr;
        for secret in secrets {
            if !secret.is_empty() {
                scrubbed = scrubbed.replace(secret, "***");
            }
        }
        return Err(mirror_failed(format!(
            "git {} exited with {}: {}",
            args.first().unwrap_or(&""),
            output.status,
            scrubbed.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub struct MirrorService {
    config: AppConfig,
    provider: ProviderClient,
}

impl MirrorService {
    pub fn new(config: AppConfig, provider: ProviderClient) -> Self {
        Self { config, provider }
    }

    /// Create the SourceCommit repository if it does not exist yet.
    /// Returns the repository name.
    pub async fn ensure_repository(&self, integration: &Integration) -> AppResult<String> {
        let name = integration
            .mirror_repo
            .clone()
            .unwrap_or_else(|| format!("{}-{}", integration.owner, integration.repo));

        let lookup = self
            .provider
            .call(
                "sourcecommit",
                &self.config.sourcecommit_endpoint,
                Method::GET,
                &[
                    format!("/api/v1/repository/{name}"),
                    format!("/api/v1/repos/{name}"),
                ],
                None,
            )
            .await;
        if lookup.is_ok() {
            return Ok(name);
        }

        tracing::info!(repo = %name, "creating mirror repository");
        self.provider
            .call(
                "sourcecommit",
                &self.config.sourcecommit_endpoint,
                Method::POST,
                &["/api/v1/repository".to_string(), "/api/v1/repos".to_string()],
                Some(&json!({
                    "name": name,
                    "description": format!("mirror of {}", integration.full_name()),
                })),
            )
            .await?;
        Ok(name)
    }

    fn provider_push_url(&self, repo_name: &str) -> String {
        format!(
            "https://{}:{}@{}/{}.git",
            self.config.sourcecommit_username,
            self.config.sourcecommit_password,
            SOURCECOMMIT_GIT_HOST,
            repo_name
        )
    }

    /// Commit currently at the head of the integration's target branch,
    /// for manually triggered runs where no webhook supplies a sha.
    pub async fn resolve_branch_head(&self, integration: &Integration) -> AppResult<String> {
        let url = github::authenticated_clone_url(
            &self.config.github_token,
            &integration.owner,
            &integration.repo,
        );
        let refspec = format!("refs/heads/{}", integration.branch);
        let output = run_git(
            None,
            &["ls-remote", url.as_str(), refspec.as_str()],
            &[self.config.github_token.as_str()],
        )
        .await?;
        output
            .split_whitespace()
            .next()
            .filter(|sha| !sha.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                mirror_failed(format!(
                    "branch {} not found on {}",
                    integration.branch,
                    integration.full_name()
                ))
            })
    }

    /// Mirror `integration`'s target branch at `commit_sha` into the
    /// provider repository and ensure the `k8s/` manifests are committed.
    pub async fn mirror(
        &self,
        integration: &Integration,
        commit_sha: &str,
        image_url: &str,
    ) -> AppResult<String> {
        let repo_name = self.ensure_repository(integration).await?;
        let branch = integration.branch.clone();

        let src_url = github::authenticated_clone_url(
            &self.config.github_token,
            &integration.owner,
            &integration.repo,
        );
        let push_url = self.provider_push_url(&repo_name);
        let secrets: Vec<&str> = vec![
            self.config.github_token.as_str(),
            self.config.sourcecommit_password.as_str(),
        ];

        let workdir = PathBuf::from(&self.config.workdir).join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| mirror_failed(format!("workdir create failed: {e}")))?;

        let result = self
            .mirror_inner(&workdir, &src_url, &push_url, &branch, commit_sha, image_url, &integration.repo, &secrets)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            tracing::warn!(error = %e, "mirror workdir cleanup failed");
        }
        result?;
        Ok(repo_name)
    }

    #[allow(clippy::too_many_arguments)]
    async fn mirror_inner(
        &self,
        workdir: &Path,
        src_url: &str,
        push_url: &str,
        branch: &str,
        commit_sha: &str,
        image_url: &str,
        repo: &str,
        secrets: &[&str],
    ) -> AppResult<()> {
        tracing::info!(
            src = %github::redact_url(src_url),
            branch,
            commit = &commit_sha[..commit_sha.len().min(7)],
            "mirroring repository"
        );

        // Bare mirror clone, then push only the target branch. Extra refs
        // (PR heads, tags) stay behind.
        let bare = workdir.join("mirror.git");
        let bare_str = bare.to_string_lossy().to_string();
        run_git(None, &["clone", "--mirror", src_url, bare_str.as_str()], secrets).await?;
        let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
        run_git(Some(&bare), &["push", push_url, refspec.as_str()], secrets).await?;

        // Working checkout to inject the manifests when the repo lacks them.
        let work = workdir.join("work");
        let work_str = work.to_string_lossy().to_string();
        run_git(
            None,
            &["clone", "--branch", branch, "--single-branch", src_url, work_str.as_str()],
            secrets,
        )
        .await?;

        let k8s_dir = work.join("k8s");
        tokio::fs::create_dir_all(&k8s_dir)
            .await
            .map_err(|e| mirror_failed(format!("k8s dir create failed: {e}")))?;

        let app = app_name(repo);
        let deployment = generate_deployment_manifest(&app, image_url);
        let service = generate_service_manifest(&app);
        let mut changed = false;
        changed |= write_if_different(&k8s_dir.join("deployment.yaml"), &deployment).await?;
        changed |= write_if_different(&k8s_dir.join("service.yaml"), &service).await?;

        if changed {
            run_git(Some(&work), &["add", "k8s/deployment.yaml", "k8s/service.yaml"], secrets)
                .await?;
            run_git(
                Some(&work),
                &[
                    "-c",
                    "user.name=skydock",
                    "-c",
                    "user.email=skydock@localhost",
                    "commit",
                    "-m",
                    "Add Kubernetes deployment manifests",
                ],
                secrets,
            )
            .await?;
        }
        let head_refspec = format!("HEAD:refs/heads/{branch}");
        run_git(Some(&work), &["push", push_url, head_refspec.as_str()], secrets).await?;

        Ok(())
    }
}

/// Write `content` unless the file already holds it. Returns whether a
/// write happened, so an unchanged tree produces no commit.
async fn write_if_different(path: &Path, content: &str) -> AppResult<bool> {
    if let Ok(existing) = tokio::fs::read_to_string(path).await {
        if existing == content {
            return Ok(false);
        }
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| mirror_failed(format!("manifest write failed: {e}")))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_name_is_kubernetes_safe() {
        assert_eq!(app_name("My_Web.App"), "my-web-app");
        assert_eq!(app_name("--app--"), "app");
        assert_eq!(app_name("simple"), "simple");
    }

    #[test]
    fn deployment_manifest_pins_image_and_pull_secret() {
        let yaml = generate_deployment_manifest("web", "reg.example.com/web:abc1234");
        assert!(yaml.contains("kind: Deployment"));
        assert!(yaml.contains("image: reg.example.com/web:abc1234"));
        assert!(yaml.contains("name: ncp-cr"));
        assert!(yaml.contains("containerPort: 8080"));
    }

    #[test]
    fn service_manifest_routes_80_to_8080() {
        let yaml = generate_service_manifest("web");
        assert!(yaml.contains("kind: Service"));
        assert!(yaml.contains("port: 80"));
        assert!(yaml.contains("targetPort: 8080"));
    }

    #[test]
    fn manifest_generation_is_stable() {
        let a = generate_deployment_manifest("web", "r/i:t");
        let b = generate_deployment_manifest("web", "r/i:t");
        assert_eq!(a, b);
    }
}
