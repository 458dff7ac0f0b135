use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy for the pipeline orchestrator. Messages never carry raw
/// credentials or signature material, only identifiers safe to surface.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid webhook signature")]
    SignatureInvalid,

    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("{provider} API error (status {status}): {body}")]
    ExternalApi {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("image not found in registry: {image}")]
    ImageNotFound { image: String },

    #[error("{stage} stage failed: {reason}")]
    StageFailed { stage: &'static str, reason: String },

    #[error("timed out waiting for {stage} stage")]
    StageTimeout { stage: &'static str },

    #[error("no integration found for {owner}/{repo}")]
    IntegrationNotFound { owner: String, repo: String },

    #[error("integration for {owner}/{repo} is missing {field}")]
    IntegrationIncomplete {
        owner: String,
        repo: String,
        field: &'static str,
    },

    #[error("rollback range exceeded: {available} previous deployments available, {requested} requested")]
    RollbackRangeExceeded { available: usize, requested: usize },

    #[error("rollback target is older than {limit_days} days")]
    RollbackTooOld { limit_days: i64 },

    #[error("no successful deployment found for {owner}/{repo} matching {query}")]
    RollbackTargetNotFound {
        owner: String,
        repo: String,
        query: String,
    },

    #[error("deployment run {0} not found")]
    RunNotFound(i64),

    #[error("a run for this commit already exists")]
    DuplicateRun,

    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            AppError::IntegrationNotFound { .. }
            | AppError::RunNotFound(_)
            | AppError::RollbackTargetNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::RollbackRangeExceeded { .. }
            | AppError::RollbackTooOld { .. }
            | AppError::IntegrationIncomplete { .. }
            | AppError::ImageNotFound { .. }
            | AppError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            AppError::DuplicateRun => StatusCode::CONFLICT,
            AppError::StageTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::ExternalApi { .. } => StatusCode::BAD_GATEWAY,
            AppError::ConfigMissing(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Pipeline stage attributed to this error when recorded on a run.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            AppError::StageFailed { stage, .. } | AppError::StageTimeout { stage } => Some(stage),
            _ => None,
        }
    }

    /// Attribute this error to `stage` unless it already names one. Stage
    /// coordinators surface provider errors bare; the caller knows which
    /// stage was in flight.
    pub fn in_stage(self, stage: &'static str) -> AppError {
        if self.stage().is_some() {
            return self;
        }
        AppError::StageFailed {
            stage,
            reason: self.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = match &self {
            AppError::RollbackRangeExceeded { available, requested } => json!({
                "error": self.to_string(),
                "available": available,
                "requested": requested,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_class() {
        assert_eq!(AppError::SignatureInvalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::IntegrationNotFound {
                owner: "o".into(),
                repo: "r".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::DuplicateRun.status(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::StageTimeout { stage: "build" }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::ExternalApi {
                provider: "sourcebuild",
                status: 500,
                body: "oops".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn rollback_range_message_names_both_numbers() {
        let err = AppError::RollbackRangeExceeded {
            available: 2,
            requested: 5,
        };
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let msg = err.to_string();
        assert!(msg.contains("2 previous deployments available"));
        assert!(msg.contains("5 requested"));
    }

    #[test]
    fn stage_attribution_covers_stage_errors_only() {
        assert_eq!(
            AppError::StageFailed {
                stage: "mirror",
                reason: "x".into()
            }
            .stage(),
            Some("mirror")
        );
        assert_eq!(AppError::StageTimeout { stage: "deploy" }.stage(), Some("deploy"));
        assert_eq!(AppError::ImageNotFound { image: "i".into() }.stage(), None);
        assert_eq!(AppError::SignatureInvalid.stage(), None);
    }

    #[test]
    fn bare_errors_take_the_stage_they_occurred_in() {
        // Provider errors carry no stage on their own; in_stage pins them to
        // whichever stage was running so a build failure is never written to
        // the mirror stage.
        let provider = AppError::ExternalApi {
            provider: "sourcebuild",
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(provider.stage(), None);
        assert_eq!(provider.in_stage("build").stage(), Some("build"));

        let missing = AppError::ImageNotFound { image: "r/i:t".into() };
        assert_eq!(missing.in_stage("build").stage(), Some("build"));

        // An error that already names its stage keeps it.
        let timed_out = AppError::StageTimeout { stage: "deploy" };
        assert_eq!(timed_out.in_stage("build").stage(), Some("deploy"));
    }
}
