use std::env;

/// Runtime configuration. Everything is read from the environment once at
/// startup; missing secrets log a warning instead of failing, so a dev
/// instance can boot without provider credentials.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_address: String,

    /// Secret shared with GitHub for X-Hub-Signature-256 validation.
    pub webhook_secret: String,
    /// Token used for authenticated clones of the source repository.
    pub github_token: String,

    /// Cloud provider API credentials for the signed REST caller.
    pub ncp_access_key: String,
    pub ncp_secret_key: String,
    pub ncp_region: String,
    /// Base endpoints per provider service, candidate-path resolution
    /// happens inside the REST caller.
    pub sourcecommit_endpoint: String,
    pub sourcebuild_endpoint: String,
    pub sourcedeploy_endpoint: String,
    pub sourcepipeline_endpoint: String,
    /// Credentials pushed to the mirror repository remote.
    pub sourcecommit_username: String,
    pub sourcecommit_password: String,

    pub registry_url: String,
    pub registry_access_key: String,
    pub registry_secret_key: String,

    pub default_cluster_id: String,
    pub default_namespace: String,

    /// Status poll cadence and ceiling for build/deploy watches.
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,

    pub workdir: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/skydock".to_string()),
            bind_address: env::var("SKYDOCK_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            webhook_secret: env::var("SKYDOCK_WEBHOOK_SECRET").unwrap_or_default(),
            github_token: env::var("SKYDOCK_GITHUB_TOKEN").unwrap_or_default(),
            ncp_access_key: env::var("NCP_ACCESS_KEY").unwrap_or_default(),
            ncp_secret_key: env::var("NCP_SECRET_KEY").unwrap_or_default(),
            ncp_region: env::var("NCP_REGION").unwrap_or_else(|_| "KR".to_string()),
            sourcecommit_endpoint: env::var("NCP_SOURCECOMMIT_ENDPOINT")
                .unwrap_or_else(|_| "https://sourcecommit.apigw.ntruss.com".to_string()),
            sourcebuild_endpoint: env::var("NCP_SOURCEBUILD_ENDPOINT")
                .unwrap_or_else(|_| "https://sourcebuild.apigw.ntruss.com".to_string()),
            sourcedeploy_endpoint: env::var("NCP_SOURCEDEPLOY_ENDPOINT")
                .unwrap_or_else(|_| "https://vpcsourcedeploy.apigw.ntruss.com".to_string()),
            sourcepipeline_endpoint: env::var("NCP_SOURCEPIPELINE_ENDPOINT")
                .unwrap_or_else(|_| "https://vpcsourcepipeline.apigw.ntruss.com".to_string()),
            sourcecommit_username: env::var("NCP_SOURCECOMMIT_USERNAME").unwrap_or_default(),
            sourcecommit_password: env::var("NCP_SOURCECOMMIT_PASSWORD").unwrap_or_default(),
            registry_url: env::var("NCP_REGISTRY_URL").unwrap_or_default(),
            registry_access_key: env::var("NCP_REGISTRY_ACCESS_KEY").unwrap_or_default(),
            registry_secret_key: env::var("NCP_REGISTRY_SECRET_KEY").unwrap_or_default(),
            default_cluster_id: env::var("SKYDOCK_CLUSTER_ID").unwrap_or_default(),
            default_namespace: env::var("SKYDOCK_NAMESPACE")
                .unwrap_or_else(|_| "default".to_string()),
            poll_interval_secs: env::var("SKYDOCK_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            poll_timeout_secs: env::var("SKYDOCK_POLL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            workdir: env::var("SKYDOCK_WORKDIR").unwrap_or_else(|_| "/tmp/skydock".to_string()),
        };

        if config.webhook_secret.is_empty() {
            tracing::warn!("SKYDOCK_WEBHOOK_SECRET not set, webhook signatures will be rejected");
        }
        if config.ncp_access_key.is_empty() || config.ncp_secret_key.is_empty() {
            tracing::warn!("NCP API credentials not set, provider calls will fail");
        }

        config
    }
}
