//! DeploymentRun store access.
//!
//! Writes that touch a live run are guarded on `status = 'running'`, so a
//! run that already reached a terminal state cannot be mutated again. A
//! guarded update that matches zero rows is reported to the caller, never
//! treated as an error.

use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::{AppError, AppResult};
use crate::models::{status, DeploymentRun, NewDeploymentRun};
use crate::schema::deployment_runs;

/// Insert a new run. A second webhook delivery for the same commit trips
/// the partial unique index and comes back as [`AppError::DuplicateRun`].
pub async fn create_run(
    conn: &mut AsyncPgConnection,
    new_run: NewDeploymentRun,
) -> AppResult<DeploymentRun> {
    let result = diesel::insert_into(deployment_runs::table)
        .values(&new_run)
        .get_result::<DeploymentRun>(conn)
        .await
        .map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                AppError::DuplicateRun
            }
            other => AppError::Database(other),
        })?;

    crate::metrics::record_run_started(&result.trigger_kind);
    tracing::info!(
        run_id = result.id,
        repo = %format!("{}/{}", result.owner, result.repo),
        commit = %result.short_sha(),
        trigger = %result.trigger_kind,
        "deployment run created"
    );
    Ok(result)
}

pub async fn get_run(conn: &mut AsyncPgConnection, run_id: i64) -> AppResult<DeploymentRun> {
    let run = deployment_runs::table
        .find(run_id)
        .first::<DeploymentRun>(conn)
        .await
        .optional()?
        .ok_or(AppError::RunNotFound(run_id))?;
    Ok(run)
}

/// Move one stage to a new status on a live run. Stage transitions are
/// forward-only: a stage already at `success`, `failed` or `skipped` never
/// changes again, so the update also guards on the stage's own status.
/// Returns false when the guard matched nothing.
pub async fn set_stage_status(
    conn: &mut AsyncPgConnection,
    run_id: i64,
    stage: &str,
    stage_status: &str,
    duration_seconds: Option<i32>,
) -> AppResult<bool> {
    let transient = [status::PENDING, status::RUNNING];
    let target = deployment_runs::table
        .find(run_id)
        .filter(deployment_runs::status.eq(status::RUNNING));
    let updated = match stage {
        crate::models::stage::MIRROR => {
            diesel::update(target.filter(deployment_runs::mirror_status.eq_any(transient)))
                .set((
                    deployment_runs::mirror_status.eq(stage_status),
                    deployment_runs::mirror_duration_seconds.eq(duration_seconds),
                ))
                .execute(conn)
                .await?
        }
        crate::models::stage::BUILD => {
            diesel::update(target.filter(deployment_runs::build_status.eq_any(transient)))
                .set((
                    deployment_runs::build_status.eq(stage_status),
                    deployment_runs::build_duration_seconds.eq(duration_seconds),
                ))
                .execute(conn)
                .await?
        }
        crate::models::stage::DEPLOY => {
            diesel::update(target.filter(deployment_runs::deploy_status.eq_any(transient)))
                .set((
                    deployment_runs::deploy_status.eq(stage_status),
                    deployment_runs::deploy_duration_seconds.eq(duration_seconds),
                ))
                .execute(conn)
                .await?
        }
        other => {
            return Err(AppError::Internal(anyhow::anyhow!(
                "unknown pipeline stage {other}"
            )))
        }
    };
    if updated == 0 {
        tracing::warn!(run_id, stage, "stage update skipped, stage or run already terminal");
    }
    Ok(updated > 0)
}

/// Record the image the build produced.
pub async fn set_image(
    conn: &mut AsyncPgConnection,
    run_id: i64,
    name: &str,
    tag: &str,
    url: &str,
) -> AppResult<()> {
    diesel::update(
        deployment_runs::table
            .find(run_id)
            .filter(deployment_runs::status.eq(status::RUNNING)),
    )
    .set((
        deployment_runs::image_name.eq(name),
        deployment_runs::image_tag.eq(tag),
        deployment_runs::image_url.eq(url),
    ))
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn set_pipeline_mode(conn: &mut AsyncPgConnection, run_id: i64) -> AppResult<()> {
    diesel::update(
        deployment_runs::table
            .find(run_id)
            .filter(deployment_runs::status.eq(status::RUNNING)),
    )
    .set(deployment_runs::pipeline_mode.eq(true))
    .execute(conn)
    .await?;
    Ok(())
}

/// Close out a run as succeeded. Idempotent, the guard makes a second call
/// a no-op.
pub async fn finalize_success(conn: &mut AsyncPgConnection, run_id: i64) -> AppResult<bool> {
    let run = get_run(conn, run_id).await?;
    let total = (Utc::now() - run.started_at).num_seconds().max(0) as i32;
    let updated = diesel::update(
        deployment_runs::table
            .find(run_id)
            .filter(deployment_runs::status.eq(status::RUNNING)),
    )
    .set((
        deployment_runs::status.eq(status::SUCCESS),
        deployment_runs::deploy_status.eq(status::SUCCESS),
        deployment_runs::completed_at.eq(Utc::now()),
        deployment_runs::total_duration_seconds.eq(total),
    ))
    .execute(conn)
    .await?;
    if updated > 0 {
        crate::metrics::record_run_finished(status::SUCCESS);
        tracing::info!(run_id, total_seconds = total, "deployment run succeeded");
    }
    Ok(updated > 0)
}

/// Close out a run as failed at the given stage.
pub async fn finalize_failure(
    conn: &mut AsyncPgConnection,
    run_id: i64,
    error_stage: &str,
    error_message: &str,
) -> AppResult<bool> {
    let run = get_run(conn, run_id).await?;
    let total = (Utc::now() - run.started_at).num_seconds().max(0) as i32;
    let updated = diesel::update(
        deployment_runs::table
            .find(run_id)
            .filter(deployment_runs::status.eq(status::RUNNING)),
    )
    .set((
        deployment_runs::status.eq(status::FAILED),
        deployment_runs::completed_at.eq(Utc::now()),
        deployment_runs::total_duration_seconds.eq(total),
        deployment_runs::error_stage.eq(error_stage),
        deployment_runs::error_message.eq(error_message),
    ))
    .execute(conn)
    .await?;
    if updated > 0 {
        crate::metrics::record_run_finished(status::FAILED);
        tracing::warn!(run_id, stage = error_stage, error = error_message, "deployment run failed");
    }
    Ok(updated > 0)
}

/// Recent runs for a repository, newest first.
pub async fn list_runs(
    conn: &mut AsyncPgConnection,
    owner: &str,
    repo: &str,
    limit: i64,
) -> AppResult<Vec<DeploymentRun>> {
    let runs = deployment_runs::table
        .filter(deployment_runs::owner.eq(owner))
        .filter(deployment_runs::repo.eq(repo))
        .order(deployment_runs::started_at.desc())
        .limit(limit)
        .load::<DeploymentRun>(conn)
        .await?;
    Ok(runs)
}

pub async fn list_runs_for_user(
    conn: &mut AsyncPgConnection,
    user_id: &str,
    limit: i64,
) -> AppResult<Vec<DeploymentRun>> {
    let runs = deployment_runs::table
        .filter(deployment_runs::user_id.eq(user_id))
        .order(deployment_runs::started_at.desc())
        .limit(limit)
        .load::<DeploymentRun>(conn)
        .await?;
    Ok(runs)
}

/// Successful non-rollback runs, newest first. This is the rollback
/// timeline: rollbacks themselves never become rollback targets.
pub async fn successful_original_runs(
    conn: &mut AsyncPgConnection,
    owner: &str,
    repo: &str,
    limit: i64,
) -> AppResult<Vec<DeploymentRun>> {
    let runs = deployment_runs::table
        .filter(deployment_runs::owner.eq(owner))
        .filter(deployment_runs::repo.eq(repo))
        .filter(deployment_runs::status.eq(status::SUCCESS))
        .filter(deployment_runs::is_rollback.eq(false))
        .order(deployment_runs::started_at.desc())
        .limit(limit)
        .load::<DeploymentRun>(conn)
        .await?;
    Ok(runs)
}

/// Most recent successful run of any kind, rollbacks included. Determines
/// what is currently live on the cluster.
pub async fn latest_successful_run(
    conn: &mut AsyncPgConnection,
    owner: &str,
    repo: &str,
) -> AppResult<Option<DeploymentRun>> {
    let run = deployment_runs::table
        .filter(deployment_runs::owner.eq(owner))
        .filter(deployment_runs::repo.eq(repo))
        .filter(deployment_runs::status.eq(status::SUCCESS))
        .order(deployment_runs::started_at.desc())
        .first::<DeploymentRun>(conn)
        .await
        .optional()?;
    Ok(run)
}
