//! Schema bootstrap. Applied at startup with `batch_execute`; every
//! statement is idempotent so restarts are safe.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS integrations (
    id BIGSERIAL PRIMARY KEY,
    user_id VARCHAR(64) NOT NULL,
    owner VARCHAR(255) NOT NULL,
    repo VARCHAR(255) NOT NULL,
    installation_id VARCHAR(64),
    mirror_repo VARCHAR(255),
    build_project_id VARCHAR(64),
    deploy_project_id VARCHAR(64),
    pipeline_id VARCHAR(64),
    registry_url VARCHAR(512),
    image_repository VARCHAR(255),
    branch VARCHAR(255) NOT NULL DEFAULT 'main',
    auto_deploy_enabled BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_integrations_user_repo
    ON integrations (user_id, owner, repo);
CREATE INDEX IF NOT EXISTS idx_integrations_owner_repo
    ON integrations (owner, repo);

CREATE TABLE IF NOT EXISTS deployment_runs (
    id BIGSERIAL PRIMARY KEY,
    user_id VARCHAR(64) NOT NULL,
    owner VARCHAR(255) NOT NULL,
    repo VARCHAR(255) NOT NULL,
    commit_sha VARCHAR(64) NOT NULL,
    commit_message TEXT,
    commit_author VARCHAR(255),
    commit_url VARCHAR(512),
    trigger_kind VARCHAR(32) NOT NULL DEFAULT 'push',
    pipeline_mode BOOLEAN NOT NULL DEFAULT FALSE,
    status VARCHAR(32) NOT NULL DEFAULT 'pending',
    mirror_status VARCHAR(32) NOT NULL DEFAULT 'pending',
    build_status VARCHAR(32) NOT NULL DEFAULT 'pending',
    deploy_status VARCHAR(32) NOT NULL DEFAULT 'pending',
    mirror_duration_seconds INTEGER,
    build_duration_seconds INTEGER,
    deploy_duration_seconds INTEGER,
    image_name VARCHAR(255),
    image_tag VARCHAR(128),
    image_url VARCHAR(512),
    cluster_id VARCHAR(64),
    namespace VARCHAR(255) NOT NULL DEFAULT 'default',
    is_rollback BOOLEAN NOT NULL DEFAULT FALSE,
    rolled_back_from_id BIGINT,
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    total_duration_seconds INTEGER,
    error_stage VARCHAR(32),
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_runs_owner_repo_started
    ON deployment_runs (owner, repo, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_user ON deployment_runs (user_id);
CREATE INDEX IF NOT EXISTS idx_runs_status ON deployment_runs (status);

-- One live run per commit for webhook-triggered deploys. Rollbacks of the
-- same commit are always allowed, so the constraint skips them.
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_dedup
    ON deployment_runs (owner, repo, commit_sha, trigger_kind)
    WHERE NOT is_rollback;
"#;

pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL).await?;
    tracing::info!("database migration applied");
    Ok(())
}
