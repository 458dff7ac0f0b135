//! deployment_run — one pipeline execution (push, manual, or rollback).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::deployment_runs;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = deployment_runs)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRun {
    pub id: i64,
    pub user_id: String,
    pub owner: String,
    pub repo: String,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub commit_url: Option<String>,
    pub trigger_kind: String,
    pub pipeline_mode: bool,
    pub status: String,
    pub mirror_status: String,
    pub build_status: String,
    pub deploy_status: String,
    pub mirror_duration_seconds: Option<i32>,
    pub build_duration_seconds: Option<i32>,
    pub deploy_duration_seconds: Option<i32>,
    pub image_name: Option<String>,
    pub image_tag: Option<String>,
    pub image_url: Option<String>,
    pub cluster_id: Option<String>,
    pub namespace: String,
    pub is_rollback: bool,
    pub rolled_back_from_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_duration_seconds: Option<i32>,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = deployment_runs)]
pub struct NewDeploymentRun {
    pub user_id: String,
    pub owner: String,
    pub repo: String,
    pub commit_sha: String,
    pub commit_message: Option<String>,
    pub commit_author: Option<String>,
    pub commit_url: Option<String>,
    pub trigger_kind: String,
    pub pipeline_mode: bool,
    pub status: String,
    pub mirror_status: String,
    pub build_status: String,
    pub deploy_status: String,
    pub cluster_id: Option<String>,
    pub namespace: String,
    pub is_rollback: bool,
    pub rolled_back_from_id: Option<i64>,
}

impl DeploymentRun {
    /// Short commit identifier used in image tags and log lines.
    pub fn short_sha(&self) -> &str {
        let end = self.commit_sha.len().min(7);
        &self.commit_sha[..end]
    }
}
