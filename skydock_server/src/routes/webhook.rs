//! Source webhook handling: signature check, payload checks, dispatch.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::routes::AppState;
use crate::services::github;
use crate::services::orchestrator::WebhookOutcome;

pub async fn handle_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !github::validate_signature(&state.orchestrator.config.webhook_secret, &body, signature) {
        tracing::warn!("webhook rejected: bad signature");
        return Err(AppError::SignatureInvalid);
    }

    let event_type = headers
        .get("x-event-type")
        .or_else(|| headers.get("x-github-event"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let payload: Value = serde_json::from_slice(&body).map_err(|_| bad_payload())?;
    let (owner, repo) = github::extract_repository(&payload).ok_or_else(bad_payload)?;
    let installation_id = github::extract_installation_id(&payload);

    let outcome = state
        .orchestrator
        .clone()
        .handle_event(&event_type, &owner, &repo, installation_id, &payload)
        .await?;

    Ok(match outcome {
        WebhookOutcome::Accepted {
            run_id,
            repository,
            installation_id,
            event,
        } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "runId": run_id,
                "repository": repository,
                "installationId": installation_id,
                "event": event,
            })),
        ),
        WebhookOutcome::Ignored(reason) => (
            StatusCode::OK,
            Json(json!({"status": "ignored", "reason": reason})),
        ),
        WebhookOutcome::Skipped(reason) => (
            StatusCode::OK,
            Json(json!({"status": "skipped", "reason": reason})),
        ),
    })
}

fn bad_payload() -> AppError {
    AppError::InvalidPayload("missing repository coordinates or unparseable body")
}
