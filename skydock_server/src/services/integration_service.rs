//! Integration store access.

use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::{Integration, NewIntegration};
use crate::schema::integrations;

/// Look up by repository coordinates. The installation id narrows the match
/// when present; a repo linked before the GitHub App install has none.
pub async fn find_by_repo(
    conn: &mut AsyncPgConnection,
    owner: &str,
    repo: &str,
    installation_id: Option<&str>,
) -> anyhow::Result<Option<Integration>> {
    let mut query = integrations::table
        .filter(integrations::owner.eq(owner))
        .filter(integrations::repo.eq(repo))
        .into_boxed();
    if let Some(inst) = installation_id {
        query = query.filter(
            integrations::installation_id
                .eq(inst)
                .or(integrations::installation_id.is_null()),
        );
    }
    let result = query
        .order(integrations::id.desc())
        .first::<Integration>(conn)
        .await
        .optional()?;
    Ok(result)
}

pub async fn find_by_user_repo(
    conn: &mut AsyncPgConnection,
    user_id: &str,
    owner: &str,
    repo: &str,
) -> anyhow::Result<Option<Integration>> {
    let result = integrations::table
        .filter(integrations::user_id.eq(user_id))
        .filter(integrations::owner.eq(owner))
        .filter(integrations::repo.eq(repo))
        .first::<Integration>(conn)
        .await
        .optional()?;
    Ok(result)
}

/// Create or refresh the (user, owner, repo) row. Concurrent creators race
/// on the unique index, the upsert makes both land on the same row.
pub async fn upsert(
    conn: &mut AsyncPgConnection,
    new: NewIntegration,
) -> anyhow::Result<Integration> {
    let result = diesel::insert_into(integrations::table)
        .values(&new)
        .on_conflict((
            integrations::user_id,
            integrations::owner,
            integrations::repo,
        ))
        .do_update()
        .set((
            integrations::installation_id.eq(&new.installation_id),
            integrations::branch.eq(&new.branch),
            integrations::updated_at.eq(diesel::dsl::now),
        ))
        .get_result::<Integration>(conn)
        .await?;
    tracing::info!(
        integration_id = result.id,
        repo = %result.full_name(),
        "integration upserted"
    );
    Ok(result)
}

/// Persist a provider resource id resolved on demand. Re-reads the row so a
/// concurrent writer's value wins over a stale in-memory copy.
pub async fn persist_provider_field(
    conn: &mut AsyncPgConnection,
    integration_id: i64,
    field: ProviderField,
    value: &str,
) -> anyhow::Result<Integration> {
    let query = diesel::update(integrations::table.find(integration_id));
    match field {
        ProviderField::MirrorRepo => {
            query
                .set((
                    integrations::mirror_repo.eq(value),
                    integrations::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .await?
        }
        ProviderField::BuildProjectId => {
            query
                .set((
                    integrations::build_project_id.eq(value),
                    integrations::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .await?
        }
        ProviderField::DeployProjectId => {
            query
                .set((
                    integrations::deploy_project_id.eq(value),
                    integrations::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .await?
        }
        ProviderField::PipelineId => {
            query
                .set((
                    integrations::pipeline_id.eq(value),
                    integrations::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .await?
        }
        ProviderField::ImageRepository => {
            query
                .set((
                    integrations::image_repository.eq(value),
                    integrations::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)
                .await?
        }
    };
    let refreshed = integrations::table
        .find(integration_id)
        .first::<Integration>(conn)
        .await?;
    Ok(refreshed)
}

#[derive(Debug, Clone, Copy)]
pub enum ProviderField {
    MirrorRepo,
    BuildProjectId,
    DeployProjectId,
    PipelineId,
    ImageRepository,
}
