pub mod integration;
pub mod run;

pub use integration::{Integration, NewIntegration};
pub use run::{DeploymentRun, NewDeploymentRun};

/// Overall and per-stage run statuses. Stored as strings, transitions are
/// forward-only and enforced by guarded updates in [`crate::services::run_service`].
pub mod status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
    pub const SKIPPED: &str = "skipped";
}

pub mod stage {
    pub const MIRROR: &str = "mirror";
    pub const BUILD: &str = "build";
    pub const DEPLOY: &str = "deploy";
}

pub mod trigger {
    pub const PUSH: &str = "push";
    pub const PR_MERGE: &str = "pr_merge";
    pub const RELEASE: &str = "release";
    pub const MANUAL: &str = "manual";
    pub const ROLLBACK: &str = "rollback";
}
