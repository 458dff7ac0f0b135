//! integration — links a user's GitHub repository to its provider-side
//! resources (mirror repo, build project, deploy project, pipeline).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::integrations;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = integrations)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: i64,
    pub user_id: String,
    pub owner: String,
    pub repo: String,
    pub installation_id: Option<String>,
    pub mirror_repo: Option<String>,
    pub build_project_id: Option<String>,
    pub deploy_project_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub registry_url: Option<String>,
    pub image_repository: Option<String>,
    pub branch: String,
    pub auto_deploy_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = integrations)]
pub struct NewIntegration {
    pub user_id: String,
    pub owner: String,
    pub repo: String,
    pub installation_id: Option<String>,
    pub branch: String,
}

impl Integration {
    /// Full repository name as GitHub reports it.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}
