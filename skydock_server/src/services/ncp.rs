//! Signed REST caller for the NCP developer-tools APIs.
//!
//! Provider services expose the same operation under slightly different
//! paths between API generations, so every call takes a list of candidate
//! paths and returns the first success. Responses wrap payloads in a
//! `result` envelope.

use reqwest::Method;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::services::signer;

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    access_key: String,
    secret_key: String,
    region: String,
}

impl ProviderClient {
    pub fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            access_key,
            secret_key,
            region,
        }
    }

    /// Try each candidate path in order against `endpoint`, returning the
    /// first 2xx JSON body. All failures surface the last one.
    pub async fn call(
        &self,
        service: &'static str,
        endpoint: &str,
        method: Method,
        paths: &[String],
        body: Option<&Value>,
    ) -> AppResult<Value> {
        if self.access_key.is_empty() || self.secret_key.is_empty() {
            return Err(AppError::ConfigMissing("provider API keys"));
        }

        let mut last_error = AppError::ExternalApi {
            provider: service,
            status: 0,
            body: "no candidate paths".to_string(),
        };

        for path in paths {
            let timestamp_ms = chrono::Utc::now().timestamp_millis();
            let mut request = self
                .http
                .request(method.clone(), format!("{endpoint}{path}"))
                .header("Content-Type", "application/json");
            for (name, value) in signer::signed_headers(
                &self.access_key,
                &self.secret_key,
                &self.region,
                method.as_str(),
                path,
                timestamp_ms,
            ) {
                request = request.header(name, value);
            }
            if let Some(json) = body {
                request = request.json(json);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = AppError::ExternalApi {
                        provider: service,
                        status: 0,
                        body: e.to_string(),
                    };
                    continue;
                }
            };

            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if status.is_success() {
                metrics::record_provider_call(service, true);
                let parsed = if text.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&text).unwrap_or(Value::Null)
                };
                return Ok(parsed);
            }

            tracing::debug!(
                service,
                path = %path,
                status = status.as_u16(),
                "provider path candidate failed"
            );
            last_error = AppError::ExternalApi {
                provider: service,
                status: status.as_u16(),
                body: truncate(&text, 512),
            };
        }

        metrics::record_provider_call(service, false);
        Err(last_error)
    }
}

/// Unwrap the provider's `result` envelope, or return the body as-is when
/// the envelope is absent.
pub fn result_envelope(body: &Value) -> &Value {
    body.get("result").unwrap_or(body)
}

/// Newest entry of a provider history response, wherever the list hides.
/// Different provider services use different list keys.
pub fn newest_history_entry(body: &Value) -> Option<&Value> {
    let result = result_envelope(body);
    for key in ["history", "historyList", "buildHistoryList", "deployHistoryList"] {
        if let Some(list) = result.get(key).and_then(|v| v.as_array()) {
            return list.first();
        }
    }
    None
}

/// Find a resource id by exact name in a provider list response. Covers the
/// list keys used by project, stage and scenario endpoints.
pub fn find_named_id(body: &Value, name: &str) -> Option<String> {
    let result = result_envelope(body);
    for key in [
        "project",
        "projectList",
        "projects",
        "stageList",
        "scenarioList",
    ] {
        if let Some(list) = result.get(key).and_then(|v| v.as_array()) {
            for entry in list {
                if entry.get("name").and_then(|n| n.as_str()) == Some(name) {
                    return entry.get("id").map(id_to_string);
                }
            }
        }
    }
    None
}

pub fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_envelope_unwraps_when_present() {
        let body = json!({"result": {"id": 7}});
        assert_eq!(result_envelope(&body)["id"], 7);
        let flat = json!({"id": 9});
        assert_eq!(result_envelope(&flat)["id"], 9);
    }

    #[test]
    fn history_entry_found_under_any_list_key() {
        let a = json!({"result": {"history": [{"status": "success"}]}});
        assert_eq!(newest_history_entry(&a).unwrap()["status"], "success");
        let b = json!({"result": {"deployHistoryList": [
            {"status": "running"}, {"status": "success"}
        ]}});
        assert_eq!(newest_history_entry(&b).unwrap()["status"], "running");
        assert!(newest_history_entry(&json!({"result": {}})).is_none());
    }

    #[test]
    fn named_id_resolution_matches_exact_name() {
        let body = json!({"result": {"project": [
            {"id": 12, "name": "build-acme-web"},
            {"id": "34", "name": "build-acme-api"},
        ]}});
        assert_eq!(find_named_id(&body, "build-acme-web").as_deref(), Some("12"));
        assert_eq!(find_named_id(&body, "build-acme-api").as_deref(), Some("34"));
        assert!(find_named_id(&body, "build-acme-other").is_none());

        let stages = json!({"result": {"stageList": [{"id": 5, "name": "production"}]}});
        assert_eq!(find_named_id(&stages, "production").as_deref(), Some("5"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("héllo", 2), "h");
    }
}
